use std::fs;
use std::io;
use std::os::unix::fs::{chown, lchown, symlink};
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::WalkDir;

use crate::configuration::Directory;
use crate::error::SourceError;
use crate::helper::process::Cancellation;

use super::{dump_error, enumerate_error, restore_error, DumpedUnit, Payload, SourceAdapter};

/// A directory archived verbatim under its base name.
pub struct DirectorySource {
    directory: Directory,
    path: PathBuf,
}

impl DirectorySource {
    pub fn new(directory: &Directory) -> Self {
        Self {
            directory: directory.clone(),
            path: PathBuf::from(&directory.name),
        }
    }

    pub fn base_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    fn copy_entry(&self, source: &Path, target: &Path, file_type: fs::FileType) -> io::Result<()> {
        if file_type.is_dir() {
            fs::create_dir_all(target)?;
        } else if file_type.is_symlink() {
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target)?;
            }
            symlink(fs::read_link(source)?, target)?;
        } else {
            fs::copy(source, target)?;
        }

        let uid = self.directory.get_uid().map(|uid| uid.as_raw());
        let gid = self.directory.get_gid().map(|gid| gid.as_raw());
        if uid.is_some() || gid.is_some() {
            if file_type.is_symlink() {
                lchown(target, uid, gid)?;
            } else {
                chown(target, uid, gid)?;
            }
        }
        Ok(())
    }
}

impl SourceAdapter for DirectorySource {
    fn id(&self) -> &str {
        &self.directory.name
    }

    fn entry_extension(&self) -> &str {
        ""
    }

    fn enumerate(&self, _cancel: &Cancellation) -> Result<Vec<String>, SourceError> {
        let metadata = fs::metadata(&self.path).map_err(|err| enumerate_error(self.id(), err))?;
        if !metadata.is_dir() {
            return Err(enumerate_error(self.id(), "not a directory"));
        }

        match self.base_name() {
            Some(name) => Ok(vec![name]),
            None => Err(enumerate_error(self.id(), "directory has no base name")),
        }
    }

    fn dump(
        &self,
        unit: &str,
        _workspace: &Path,
        _cancel: &Cancellation,
    ) -> Result<DumpedUnit, SourceError> {
        if self.base_name().as_deref() != Some(unit) {
            return Err(dump_error(self.id(), unit, "unknown logical unit"));
        }

        info!("source '{}': adding directory tree", self.id());
        Ok(DumpedUnit {
            entry_name: unit.to_string(),
            payload: Payload::Tree(self.path.clone()),
        })
    }

    /// Copies the extracted tree `dump` over the original directory.
    fn restore(&self, unit: &str, dump: &Path, cancel: &Cancellation) -> Result<(), SourceError> {
        info!("source '{}': restoring directory tree", self.id());
        for entry in WalkDir::new(dump).follow_links(false).sort_by_file_name() {
            if cancel.interrupted().is_some() {
                return Err(restore_error(self.id(), unit, "restore was interrupted"));
            }

            let entry = entry.map_err(|err| restore_error(self.id(), unit, err))?;
            let relative = match entry.path().strip_prefix(dump) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let target = self.path.join(relative);
            let file_type = entry.file_type();
            if !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()) {
                warn!("skipping special file '{}'", entry.path().display());
                continue;
            }

            self.copy_entry(entry.path(), &target, file_type)
                .map_err(|err| {
                    restore_error(self.id(), unit, format!("{}: {}", target.display(), err))
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn directory(path: &Path) -> Directory {
        let mut directory = Directory::new();
        directory.name = path.to_string_lossy().into_owned();
        directory
    }

    #[test]
    fn test_enumerate_yields_base_name() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("www");
        fs::create_dir(&root).unwrap();

        let source = DirectorySource::new(&directory(&root));
        assert_eq!(source.enumerate(&Cancellation::new()).unwrap(), vec!["www"]);

        let dumped = source
            .dump("www", temp_dir.path(), &Cancellation::new())
            .unwrap();
        assert_eq!(dumped.payload, Payload::Tree(root));
    }

    #[test]
    fn test_missing_directory_fails_enumeration() {
        let temp_dir = TempDir::new().unwrap();
        let source = DirectorySource::new(&directory(&temp_dir.path().join("missing")));
        assert!(matches!(
            source.enumerate(&Cancellation::new()),
            Err(SourceError::Enumerate { .. })
        ));
    }

    #[test]
    fn test_restore_copies_tree_back() {
        let temp_dir = TempDir::new().unwrap();
        let extracted = temp_dir.path().join("extracted").join("www");
        fs::create_dir_all(extracted.join("css")).unwrap();
        fs::write(extracted.join("index.html"), b"<html/>").unwrap();
        fs::write(extracted.join("css").join("site.css"), b"body{}").unwrap();

        let original = temp_dir.path().join("srv").join("www");
        let source = DirectorySource::new(&directory(&original));
        source
            .restore("www", &extracted, &Cancellation::new())
            .unwrap();

        assert_eq!(fs::read(original.join("index.html")).unwrap(), b"<html/>");
        assert_eq!(
            fs::read(original.join("css").join("site.css")).unwrap(),
            b"body{}"
        );
    }
}
