use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};

use crate::configuration::{Archive, Configuration, Selector};
use crate::encryptor::Encryptor;
use crate::error::{ConfigReferenceError, RestoreError, RunError, SourceError};
use crate::helper::process::Cancellation;
use crate::registry::Adapters;
use crate::source::{resolve_selectors, DirectorySource, SourceAdapter};

#[derive(Debug)]
pub struct RestoreOutcome {
    pub archive: String,
    /// File name of the artifact that was restored.
    pub artifact: Option<String>,
    pub result: Result<(), RestoreError>,
}

#[derive(Debug)]
pub struct RestoreReport {
    pub outcomes: Vec<RestoreOutcome>,
}

impl RestoreReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn log_summary(&self) {
        for outcome in &self.outcomes {
            match (&outcome.result, &outcome.artifact) {
                (Ok(()), Some(artifact)) => info!("archive '{}': restored '{}'", outcome.archive, artifact),
                (Ok(()), None) => info!("archive '{}': restored", outcome.archive),
                (Err(err), _) => error!("archive '{}': {}", outcome.archive, err),
            }
        }
    }
}

/// Everything needed to unpack one artifact, owned so it can move to a
/// blocking worker.
struct Unpack {
    archive: Archive,
    artifact: PathBuf,
    content: PathBuf,
    encryptor: Option<Arc<dyn Encryptor>>,
    sources: Vec<(Arc<dyn SourceAdapter>, Vec<Selector>)>,
    cancel: Cancellation,
}

impl Unpack {
    fn run(self) -> Result<(), RestoreError> {
        let mut compressed = self.artifact.clone();
        if let Some(encryptor) = &self.encryptor {
            let encrypted = self.artifact.to_string_lossy().into_owned();
            if let Some(stripped) = encrypted.strip_suffix(encryptor.extension()) {
                compressed = PathBuf::from(stripped);
            }
            encryptor.decrypt(&compressed, &self.cancel)?;
        }

        self.check_interrupt()?;
        self.archive
            .compression
            .decompress(&compressed, &self.content)?;

        for directory in &self.archive.directories {
            self.check_interrupt()?;
            let source = DirectorySource::new(directory);
            let extracted = match source.base_name() {
                Some(base_name) => self.content.join(base_name),
                None => continue,
            };
            if !extracted.is_dir() {
                warn!("directory '{}' is not part of the archive", directory.name);
                continue;
            }
            let unit = source.base_name().unwrap_or_default();
            source.restore(&unit, &extracted, &self.cancel)?;
        }

        for (source, selectors) in &self.sources {
            self.check_interrupt()?;
            self.restore_source(source.as_ref(), selectors)?;
        }

        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), RestoreError> {
        match self.cancel.interrupted() {
            Some(_) => Err(RestoreError::Cancelled),
            None => Ok(()),
        }
    }

    /// Imports every dump of the archive that the selection of `source` matches.
    fn restore_source(
        &self,
        source: &dyn SourceAdapter,
        selectors: &[Selector],
    ) -> Result<(), RestoreError> {
        let extension = source.entry_extension();
        let mut units = Vec::new();
        for entry in fs::read_dir(&self.content)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(unit) = file_name.strip_suffix(extension) {
                units.push(unit.to_string());
            }
        }
        units.sort();

        let units = match resolve_selectors(source.id(), &units, selectors) {
            Ok(units) => source.collapse(units),
            Err(SourceError::NoMatch { .. }) => {
                warn!("source '{}': no dump in the archive matches", source.id());
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        for unit in units {
            let dump = self.content.join(format!("{}{}", unit, extension));
            source.restore(&unit, &dump, &self.cancel)?;
        }
        Ok(())
    }
}

/// Fetches the newest artifact of every archive and restores its content.
pub struct Restore {
    adapters: Arc<Adapters>,
}

impl Restore {
    pub fn new(adapters: Adapters) -> Self {
        Self {
            adapters: Arc::new(adapters),
        }
    }

    pub async fn run(
        &self,
        configuration: &Configuration,
        cancel: &Cancellation,
    ) -> Result<RestoreReport, RunError> {
        configuration.validate()?;
        let working_directory = configuration.working_directory.clone();
        fs::create_dir_all(&working_directory).map_err(|cause| RunError::WorkingDirectory {
            path: working_directory.clone(),
            cause,
        })?;

        let mut outcomes = Vec::new();
        for archive in &configuration.archives {
            info!("restoring archive: {}", archive.name.as_str());
            let mut outcome = RestoreOutcome {
                archive: archive.name.as_str().to_string(),
                artifact: None,
                result: Ok(()),
            };
            if cancel.is_cancelled() {
                outcome.result = Err(RestoreError::Cancelled);
                outcomes.push(outcome);
                continue;
            }

            let token = cancel.with_timeout(archive.timeout);
            match self.restore_archive(archive, &working_directory, &token).await {
                Ok(artifact) => outcome.artifact = Some(artifact),
                Err(err) => {
                    error!("restoring '{}' failed: {}", archive.name.as_str(), err);
                    outcome.result = Err(err);
                }
            }
            outcomes.push(outcome);
        }

        Ok(RestoreReport { outcomes })
    }

    async fn restore_archive(
        &self,
        archive: &Archive,
        working_directory: &Path,
        cancel: &Cancellation,
    ) -> Result<String, RestoreError> {
        let dangling = |family: &'static str, id: &str| ConfigReferenceError {
            archive: archive.name.as_str().to_string(),
            family,
            id: id.to_string(),
        };

        let encryptor = match &archive.encryption {
            Some(id) => Some(
                self.adapters
                    .encryptor(id)
                    .ok_or_else(|| dangling("encryption", id))?,
            ),
            None => None,
        };
        let mut sources = Vec::new();
        for selection in &archive.databases {
            let source = self
                .adapters
                .source(&selection.db_id)
                .ok_or_else(|| dangling("database", &selection.db_id))?;
            sources.push((source, selection.selectors.clone()));
        }

        let prefix = archive.name.literal_prefix();
        let mut suffix = archive.compression.to_extension_string();
        if let Some(encryptor) = &encryptor {
            suffix.push_str(encryptor.extension());
        }

        let workspace = tempfile::Builder::new()
            .prefix("restore.")
            .tempdir_in(working_directory)?;

        let mut artifact = None;
        for id in &archive.destinations {
            let destination = self
                .adapters
                .destination(id)
                .ok_or_else(|| dangling("destination", id))?;
            match destination
                .retrieve_latest(prefix, &suffix, workspace.path())
                .await
            {
                Ok(Some(path)) => {
                    artifact = Some(path);
                    break;
                }
                Ok(None) => info!("destination '{}' holds no matching archive", id),
                Err(err) => warn!("{}", err),
            }
        }
        let artifact = artifact.ok_or_else(|| RestoreError::NothingFound {
            prefix: prefix.to_string(),
            suffix: suffix.clone(),
        })?;
        let artifact_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let unpack = Unpack {
            archive: archive.clone(),
            artifact,
            content: workspace.path().join("content"),
            encryptor,
            sources,
            cancel: cancel.clone(),
        };
        let result = tokio::task::spawn_blocking(move || unpack.run())
            .await
            .map_err(|err| RestoreError::Task(err.to_string()))
            .and_then(|result| result);

        let path = workspace.path().to_path_buf();
        if let Err(err) = workspace.close() {
            warn!("unable to remove workspace '{}': {}", path.display(), err);
        }
        result.map(|_| artifact_name)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::backup::Backup;
    use crate::configuration::{
        Compression, Database, Destination, Directory, Encryption, ProgramParameter,
    };
    use crate::encryptor::ExternalProgram;
    use crate::template::{FixedClock, NameTemplate};
    use crate::testing::{FakeDestination, FakeSource};

    fn recipe() -> Encryption {
        let mut recipe = Encryption::new();
        recipe.id = String::from("b64");
        recipe.program = String::from("sh");
        recipe.parameters = vec![ProgramParameter::short(
            "c",
            Some("base64 '{filename}' > '{filename}.enc'"),
        )];
        recipe.decrypt_parameters = vec![ProgramParameter::short(
            "c",
            Some("base64 -d '{filename}.enc' > '{filename}'"),
        )];
        recipe
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let temp_dir = TempDir::new().unwrap();
        let site = temp_dir.path().join("site");
        fs::create_dir(&site).unwrap();
        fs::write(site.join("index.html"), b"<html/>").unwrap();

        let mut configuration = Configuration::new();
        configuration.working_directory = temp_dir.path().join("work");
        let mut database = Database::new();
        database.id = String::from("main");
        configuration.databases.push(database);
        let mut destination = Destination::new();
        destination.id = String::from("local");
        configuration.destinations.push(destination);
        configuration.encryptions.push(recipe());

        let mut archive = Archive::new();
        archive.name = NameTemplate::new("nightly-{date:weekday}");
        archive.compression = Compression::TarGz;
        archive.encryption = Some(String::from("b64"));
        archive.add_destination("local");
        archive.add_selector("main", Selector::regex("shop|crm"));
        let mut directory = Directory::new();
        directory.name = site.to_string_lossy().into_owned();
        archive.directories.push(directory);
        configuration.archives.push(archive);

        let source = Arc::new(FakeSource::new("main", &["shop", "crm", "other"]));
        let destination = Arc::new(FakeDestination::new("local"));
        let mut adapters = Adapters::new();
        adapters.insert_source(source.clone());
        adapters.insert_destination(destination.clone());
        adapters.insert_encryptor(ExternalProgram::create(&recipe()));

        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap());
        let backup = Backup::new(adapters.clone())
            .with_clock(Arc::new(clock))
            .run(&configuration, &Cancellation::new())
            .await
            .unwrap();
        assert!(backup.is_success());
        assert_eq!(destination.names(), vec!["nightly-Wed.tar.gz.enc"]);

        fs::remove_file(site.join("index.html")).unwrap();
        let report = Restore::new(adapters)
            .run(&configuration, &Cancellation::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(
            report.outcomes[0].artifact.as_deref(),
            Some("nightly-Wed.tar.gz.enc")
        );
        assert_eq!(fs::read(site.join("index.html")).unwrap(), b"<html/>");
        assert_eq!(
            source.restored(),
            vec![
                (String::from("crm"), b"dump of crm".to_vec()),
                (String::from("shop"), b"dump of shop".to_vec()),
            ]
        );
        let work = fs::read_dir(temp_dir.path().join("work")).unwrap().count();
        assert_eq!(work, 0);
    }

    #[tokio::test]
    async fn test_nothing_found_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let mut configuration = Configuration::new();
        configuration.working_directory = temp_dir.path().join("work");
        let mut destination = Destination::new();
        destination.id = String::from("local");
        configuration.destinations.push(destination);
        let mut archive = Archive::new();
        archive.name = NameTemplate::new("etc-{date:day}");
        archive.add_destination("local");
        configuration.archives.push(archive);

        let mut adapters = Adapters::new();
        adapters.insert_destination(Arc::new(FakeDestination::new("local")));
        let report = Restore::new(adapters)
            .run(&configuration, &Cancellation::new())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert!(matches!(
            &report.outcomes[0].result,
            Err(RestoreError::NothingFound { prefix, suffix })
                if prefix == "etc-" && suffix == ".tar.bz2"
        ));
    }
}
