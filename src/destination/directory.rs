use std::fs::{self, File, Permissions};
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use log::{info, warn};

use crate::configuration::{Configuration, Destination};
use crate::error::DeliveryError;

use super::{is_candidate, pick_newest, Delivery, DestinationAdapter};

/// A local (or mounted) directory.
pub struct DirectoryDestination {
    id: String,
    path: PathBuf,
}

impl DirectoryDestination {
    pub fn new(destination: &Destination) -> Self {
        Self {
            id: destination.id.clone(),
            path: PathBuf::from(&destination.path),
        }
    }

    pub fn create(destination: &Destination) -> Arc<dyn DestinationAdapter> {
        Arc::new(Self::new(destination))
    }
}

fn store(directory: &Path, file: &Path, object_name: &str) -> io::Result<(PathBuf, u64)> {
    fs::create_dir_all(directory)?;
    let expected = fs::metadata(file)?.len();

    let mut part = tempfile::Builder::new()
        .prefix(&format!(".{}.", object_name))
        .suffix(".part")
        .tempfile_in(directory)?;
    let mut reader = BufReader::with_capacity(Configuration::BUFFER_SIZE, File::open(file)?);
    io::copy(&mut reader, part.as_file_mut())?;
    part.as_file().set_permissions(Permissions::from_mode(0o644))?;
    part.as_file().sync_all()?;

    let written = part.as_file().metadata()?.len();
    if written != expected {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("wrote {} of {} bytes", written, expected),
        ));
    }

    let target = directory.join(object_name);
    part.persist(&target).map_err(|err| err.error)?;
    if let Err(err) = File::open(directory).and_then(|dir| dir.sync_all()) {
        warn!("unable to sync directory '{}': {}", directory.display(), err);
    }

    Ok((target, written))
}

fn fetch_latest(
    directory: &Path,
    prefix: &str,
    suffix: &str,
    target_dir: &Path,
) -> io::Result<Option<PathBuf>> {
    let mut candidates: Vec<(String, SystemTime)> = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = entry.metadata()?;
        if metadata.is_file() && is_candidate(&name, prefix, suffix) {
            candidates.push((name, metadata.modified()?));
        }
    }

    let name = match pick_newest(candidates) {
        Some(name) => name,
        None => return Ok(None),
    };

    info!("found latest archive: '{}'", name);
    let target = target_dir.join(&name);
    fs::copy(directory.join(&name), &target)?;
    Ok(Some(target))
}

#[async_trait]
impl DestinationAdapter for DirectoryDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, file: &Path, object_name: &str) -> Result<Delivery, DeliveryError> {
        let directory = self.path.clone();
        let file = file.to_path_buf();
        let name = object_name.to_string();

        let (target, size) = tokio::task::spawn_blocking(move || store(&directory, &file, &name))
            .await
            .map_err(|err| DeliveryError::transfer(&self.id, err))?
            .map_err(|err| DeliveryError::transfer(&self.id, err))?;

        info!("destination '{}': stored '{}'", self.id, target.display());
        Ok(Delivery {
            destination: self.id.clone(),
            location: target.to_string_lossy().into_owned(),
            size,
        })
    }

    async fn retrieve_latest(
        &self,
        prefix: &str,
        suffix: &str,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>, DeliveryError> {
        if !self.path.is_dir() {
            warn!("destination '{}': '{}' does not exist", self.id, self.path.display());
            return Ok(None);
        }

        let directory = self.path.clone();
        let prefix = prefix.to_string();
        let suffix = suffix.to_string();
        let target_dir = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || fetch_latest(&directory, &prefix, &suffix, &target_dir))
            .await
            .map_err(|err| DeliveryError::transfer(&self.id, err))?
            .map_err(|err| DeliveryError::transfer(&self.id, err))
    }
}
