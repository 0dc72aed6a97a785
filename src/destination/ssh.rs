use std::fs::File;
use std::io::{self, BufReader, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use ssh2::{RenameFlags, Session, Sftp};

use crate::configuration::{Configuration, Destination};
use crate::error::DeliveryError;

use super::{is_candidate, pick_newest, Delivery, DestinationAdapter};

/// A remote directory reached over sftp with password authentication.
///
/// libssh2 is blocking, so every operation runs on tokio's blocking pool
/// with its own session.
#[derive(Clone)]
pub struct SshDestination {
    id: String,
    server: String,
    port: u16,
    username: String,
    password: String,
    path: PathBuf,
}

impl SshDestination {
    pub fn new(destination: &Destination) -> Self {
        let path = if destination.path.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&destination.path)
        };
        Self {
            id: destination.id.clone(),
            server: destination.server.clone(),
            port: destination.port,
            username: destination.username.clone(),
            password: destination.password.clone(),
            path,
        }
    }

    pub fn create(destination: &Destination) -> Arc<dyn DestinationAdapter> {
        Arc::new(Self::new(destination))
    }

    fn transfer_error(&self, reason: impl ToString) -> DeliveryError {
        DeliveryError::transfer(&self.id, reason)
    }

    fn connect(&self) -> Result<Sftp, DeliveryError> {
        debug!("connecting to {}:{}", self.server, self.port);
        let tcp = TcpStream::connect((self.server.as_str(), self.port))
            .map_err(|err| self.transfer_error(err))?;
        let mut session = Session::new().map_err(|err| self.transfer_error(err))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|err| self.transfer_error(err))?;
        session
            .userauth_password(&self.username, &self.password)
            .map_err(|err| self.transfer_error(err))?;
        if !session.authenticated() {
            return Err(self.transfer_error("authentication failed"));
        }

        session.sftp().map_err(|err| self.transfer_error(err))
    }

    fn upload(&self, file: &Path, object_name: &str) -> Result<Delivery, DeliveryError> {
        let size = file
            .metadata()
            .map_err(|err| self.transfer_error(err))?
            .len();
        let sftp = self.connect()?;
        if sftp.stat(&self.path).is_err() {
            sftp.mkdir(&self.path, 0o755)
                .map_err(|err| self.transfer_error(err))?;
        }

        let part = self.path.join(format!(".{}.part", object_name));
        let target = self.path.join(object_name);
        info!("destination '{}': uploading '{}'", self.id, object_name);

        let copied = (|| -> io::Result<()> {
            let mut reader = BufReader::with_capacity(Configuration::BUFFER_SIZE, File::open(file)?);
            let mut remote = sftp.create(&part)?;
            io::copy(&mut reader, &mut remote)?;
            remote.flush()
        })();
        if let Err(err) = copied {
            sftp.unlink(&part).unwrap_or_default();
            return Err(self.transfer_error(err));
        }

        let stored = sftp
            .stat(&part)
            .map_err(|err| self.transfer_error(err))?
            .size;
        if stored != Some(size) {
            sftp.unlink(&part).unwrap_or_default();
            return Err(DeliveryError::verification(
                &self.id,
                format!("remote size {:?} differs from local size {}", stored, size),
            ));
        }

        publish(&sftp, &part, &target).map_err(|err| self.transfer_error(err))?;

        Ok(Delivery {
            destination: self.id.clone(),
            location: format!("{}:{}", self.server, target.display()),
            size,
        })
    }

    fn fetch_latest(
        &self,
        prefix: &str,
        suffix: &str,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>, DeliveryError> {
        let sftp = self.connect()?;
        let entries = sftp
            .readdir(&self.path)
            .map_err(|err| self.transfer_error(err))?;

        let candidates = entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                let modified = stat.mtime?;
                is_candidate(&name, prefix, suffix).then_some((name, modified))
            })
            .collect();
        let name = match pick_newest(candidates) {
            Some(name) => name,
            None => {
                warn!("destination '{}': no SSH file found", self.id);
                return Ok(None);
            }
        };

        info!("found latest file: {:?}", name);
        let target = target_dir.join(&name);
        let copied = (|| -> io::Result<()> {
            let mut remote = sftp.open(&self.path.join(&name))?;
            let mut local = File::create(&target)?;
            io::copy(&mut remote, &mut local)?;
            local.sync_all()
        })();
        copied.map_err(|err| self.transfer_error(err))?;

        Ok(Some(target))
    }
}

/// The remote file operations needed to move an upload into place.
trait RemoteFiles {
    fn exists(&self, path: &Path) -> bool;
    fn unlink(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path, flags: Option<RenameFlags>) -> io::Result<()>;
}

impl RemoteFiles for Sftp {
    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        Sftp::unlink(self, path).map_err(io::Error::from)
    }

    fn rename(&self, from: &Path, to: &Path, flags: Option<RenameFlags>) -> io::Result<()> {
        Sftp::rename(self, from, to, flags).map_err(io::Error::from)
    }
}

/// Renames the uploaded `part` to `target`.
///
/// SFTP v3 servers (OpenSSH among them) refuse to rename onto an existing
/// file whatever the flags say, so an existing target is removed and the
/// rename retried once. The part file never outlives a failed publish.
fn publish<R: RemoteFiles>(remote: &R, part: &Path, target: &Path) -> io::Result<()> {
    let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
    let renamed = match remote.rename(part, target, Some(flags)) {
        Ok(()) => Ok(()),
        Err(err) if remote.exists(target) => {
            debug!("replacing existing {} after: {}", target.display(), err);
            remote
                .unlink(target)
                .and_then(|_| remote.rename(part, target, None))
        }
        Err(err) => Err(err),
    };
    if renamed.is_err() {
        remote.unlink(part).unwrap_or_default();
    }
    renamed
}

#[async_trait]
impl DestinationAdapter for SshDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, file: &Path, object_name: &str) -> Result<Delivery, DeliveryError> {
        let adapter = self.clone();
        let file = file.to_path_buf();
        let object_name = object_name.to_string();
        tokio::task::spawn_blocking(move || adapter.upload(&file, &object_name))
            .await
            .map_err(|err| self.transfer_error(err))?
    }

    async fn retrieve_latest(
        &self,
        prefix: &str,
        suffix: &str,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>, DeliveryError> {
        let adapter = self.clone();
        let prefix = prefix.to_string();
        let suffix = suffix.to_string();
        let target_dir = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || adapter.fetch_latest(&prefix, &suffix, &target_dir))
            .await
            .map_err(|err| self.transfer_error(err))?
    }
}
