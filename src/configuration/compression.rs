use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use bzip2::{read::BzDecoder, write::BzEncoder};
use flate2::{read::GzDecoder, write::GzEncoder};
use log::{info, warn};
use tar::{Builder, EntryType, Header, HeaderMode};
use walkdir::WalkDir;

use crate::configuration::Configuration;
use crate::error::{CompressionError, ConfigError};
use crate::source::{DumpedUnit, Payload};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Tar,
    TarBZ2,
    TarGz,
}

impl Compression {
    /// Packs `units` into `target` in the given order. File entries get a
    /// fixed header stamped with `mtime`, directory trees are walked sorted,
    /// so equal inputs produce byte-identical archives. Dump files are
    /// removed once they are appended.
    pub fn compress(
        &self,
        units: &[DumpedUnit],
        target: &Path,
        mtime: u64,
    ) -> Result<PathBuf, CompressionError> {
        info!("compressing {} unit(s) into '{}'", units.len(), target.display());
        let file = File::create(target).map_err(|cause| CompressionError::Create {
            path: target.to_path_buf(),
            cause,
        })?;
        let writer = BufWriter::with_capacity(Configuration::BUFFER_SIZE, file);
        let finish_error = |cause: io::Error| CompressionError::Finish {
            path: target.to_path_buf(),
            cause,
        };

        let mut writer = match self {
            Self::Tar => Self::write_entries(writer, units, mtime, target)?,
            Self::TarBZ2 => {
                let encoder = BzEncoder::new(writer, bzip2::Compression::best());
                Self::write_entries(encoder, units, mtime, target)?
                    .finish()
                    .map_err(finish_error)?
            }
            Self::TarGz => {
                let encoder = GzEncoder::new(writer, flate2::Compression::default());
                Self::write_entries(encoder, units, mtime, target)?
                    .finish()
                    .map_err(finish_error)?
            }
        };
        writer.flush().map_err(finish_error)?;
        writer
            .get_ref()
            .sync_all()
            .map_err(finish_error)?;

        info!("compressing '{}' completed!", target.display());
        Ok(target.to_path_buf())
    }

    fn write_entries<W: Write>(
        writer: W,
        units: &[DumpedUnit],
        mtime: u64,
        target: &Path,
    ) -> Result<W, CompressionError> {
        let mut builder = Builder::new(writer);
        builder.mode(HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        for unit in units {
            match &unit.payload {
                Payload::File(path) => {
                    Self::append_file(&mut builder, &unit.entry_name, path, mtime)?;
                    if let Err(err) = fs::remove_file(path) {
                        warn!("unable to remove dump file '{}': {}", path.display(), err);
                    }
                }
                Payload::Tree(root) => Self::append_tree(&mut builder, &unit.entry_name, root)?,
            }
        }

        builder.into_inner().map_err(|cause| CompressionError::Finish {
            path: target.to_path_buf(),
            cause,
        })
    }

    fn append_file<W: Write>(
        builder: &mut Builder<W>,
        entry_name: &str,
        path: &Path,
        mtime: u64,
    ) -> Result<(), CompressionError> {
        let append_error = |cause: io::Error| CompressionError::Append {
            entry: entry_name.to_string(),
            cause,
        };
        let file = File::open(path).map_err(append_error)?;
        let size = file.metadata().map_err(append_error)?.len();

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, entry_name, BufReader::new(file))
            .map_err(append_error)
    }

    fn append_tree<W: Write>(
        builder: &mut Builder<W>,
        entry_name: &str,
        root: &Path,
    ) -> Result<(), CompressionError> {
        let append_error = |cause: io::Error| CompressionError::Append {
            entry: entry_name.to_string(),
            cause,
        };

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|err| append_error(err.into()))?;
            let relative = match entry.path().strip_prefix(root) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let name = Path::new(entry_name).join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                builder.append_dir(&name, entry.path()).map_err(append_error)?;
            } else if file_type.is_file() || file_type.is_symlink() {
                builder
                    .append_path_with_name(entry.path(), &name)
                    .map_err(append_error)?;
            } else {
                warn!("skipping special file '{}'", entry.path().display());
            }
        }

        Ok(())
    }

    /// Unpacks `file` into `target_dir`.
    pub fn decompress(&self, file: &Path, target_dir: &Path) -> Result<(), CompressionError> {
        info!("extracting '{}' ...", file.display());
        let extract_error = |cause: io::Error| CompressionError::Extract {
            path: file.to_path_buf(),
            cause,
        };
        fs::create_dir_all(target_dir).map_err(extract_error)?;
        let reader = BufReader::with_capacity(
            Configuration::BUFFER_SIZE,
            File::open(file).map_err(extract_error)?,
        );

        match self {
            Self::Tar => Self::unpack(reader, target_dir),
            Self::TarBZ2 => Self::unpack(BzDecoder::new(reader), target_dir),
            Self::TarGz => Self::unpack(GzDecoder::new(reader), target_dir),
        }
        .map_err(extract_error)?;

        info!("extracting '{}' completed!", file.display());
        Ok(())
    }

    fn unpack<R: Read>(reader: R, target_dir: &Path) -> io::Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.unpack(target_dir)
    }

    pub fn to_extension_string(&self) -> String {
        match self {
            Self::Tar => String::from(".tar"),
            Self::TarBZ2 => String::from(".tar.bz2"),
            Self::TarGz => String::from(".tar.gz"),
        }
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tar" => Ok(Self::Tar),
            "tar.bz2" => Ok(Self::TarBZ2),
            "tar.gz" => Ok(Self::TarGz),
            compression => Err(ConfigError::InvalidValue {
                attribute: "compression",
                value: compression.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(workspace: &Path) -> Vec<DumpedUnit> {
        let dump = workspace.join("shop.sql");
        fs::write(&dump, b"CREATE TABLE items (id INT);\n").unwrap();

        let tree = workspace.join("etc");
        fs::create_dir_all(tree.join("conf.d")).unwrap();
        fs::write(tree.join("conf.d").join("b.conf"), b"b=2\n").unwrap();
        fs::write(tree.join("a.conf"), b"a=1\n").unwrap();

        vec![
            DumpedUnit {
                entry_name: String::from("shop.sql"),
                payload: Payload::File(dump),
            },
            DumpedUnit {
                entry_name: String::from("etc"),
                payload: Payload::Tree(tree),
            },
        ]
    }

    fn entry_names(compression: Compression, file: &Path) -> Vec<String> {
        let reader: Box<dyn Read> = match compression {
            Compression::Tar => Box::new(File::open(file).unwrap()),
            Compression::TarBZ2 => Box::new(BzDecoder::new(File::open(file).unwrap())),
            Compression::TarGz => Box::new(GzDecoder::new(File::open(file).unwrap())),
        };
        let mut archive = tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_entries_keep_unit_names_and_order() {
        let temp_dir = TempDir::new().unwrap();
        let units = fixture(temp_dir.path());
        let target = temp_dir.path().join("nightly.tar.bz2");

        Compression::TarBZ2.compress(&units, &target, 1_700_000_000).unwrap();

        assert_eq!(
            entry_names(Compression::TarBZ2, &target),
            vec![
                "shop.sql",
                "etc",
                "etc/a.conf",
                "etc/conf.d",
                "etc/conf.d/b.conf"
            ]
        );
        assert!(!temp_dir.path().join("shop.sql").exists());
    }

    #[test]
    fn test_compression_is_deterministic() {
        for compression in [Compression::Tar, Compression::TarBZ2, Compression::TarGz] {
            let temp_dir = TempDir::new().unwrap();
            let first = temp_dir.path().join("first");
            let second = temp_dir.path().join("second");

            compression
                .compress(&fixture(temp_dir.path()), &first, 1_700_000_000)
                .unwrap();
            compression
                .compress(&fixture(temp_dir.path()), &second, 1_700_000_000)
                .unwrap();

            assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
        }
    }

    #[test]
    fn test_decompress_restores_content() {
        let temp_dir = TempDir::new().unwrap();
        let units = fixture(temp_dir.path());
        let target = temp_dir.path().join("nightly.tar.gz");
        Compression::TarGz.compress(&units, &target, 0).unwrap();

        let extracted = temp_dir.path().join("out");
        Compression::TarGz.decompress(&target, &extracted).unwrap();

        assert_eq!(
            fs::read(extracted.join("shop.sql")).unwrap(),
            b"CREATE TABLE items (id INT);\n"
        );
        assert_eq!(
            fs::read(extracted.join("etc").join("conf.d").join("b.conf")).unwrap(),
            b"b=2\n"
        );
    }

    #[test]
    fn test_missing_dump_file_is_append_error() {
        let temp_dir = TempDir::new().unwrap();
        let units = vec![DumpedUnit {
            entry_name: String::from("gone.sql"),
            payload: Payload::File(temp_dir.path().join("gone.sql")),
        }];
        let err = Compression::Tar
            .compress(&units, &temp_dir.path().join("x.tar"), 0)
            .unwrap_err();
        assert!(matches!(err, CompressionError::Append { entry, .. } if entry == "gone.sql"));
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!("tar.bz2".parse::<Compression>().unwrap(), Compression::TarBZ2);
        assert!("zip".parse::<Compression>().is_err());
    }
}
