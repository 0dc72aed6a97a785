use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use log::{error, info, warn};
use tempfile::TempDir;

use crate::configuration::{Archive, Selector};
use crate::destination::{Delivery, DestinationAdapter};
use crate::encryptor::Encryptor;
use crate::error::{ConfigReferenceError, DeliveryError, PipelineError, SourceError};
use crate::helper::process::{Cancellation, Interrupt};
use crate::registry::Adapters;
use crate::source::{resolve_selectors, DirectorySource, DumpedUnit, SourceAdapter};
use crate::template::{Clock, RenderContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Dumping,
    Compressing,
    Encrypting,
    Delivering,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Dumping => "dumping",
            Stage::Compressing => "compressing",
            Stage::Encrypting => "encrypting",
            Stage::Delivering => "delivering",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// Delivered to every destination.
    Success,
    /// Delivered to some but not all destinations.
    Partial,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub destination: String,
    pub result: Result<Delivery, DeliveryError>,
}

/// What happened to one archive during a run.
#[derive(Debug)]
pub struct ArchiveOutcome {
    /// The raw name template of the archive.
    pub archive: String,
    /// The rendered name, once the template was rendered.
    pub name: Option<String>,
    pub status: ArchiveStatus,
    pub failed_stage: Option<Stage>,
    pub error: Option<PipelineError>,
    pub deliveries: Vec<DeliveryOutcome>,
}

impl ArchiveOutcome {
    fn new(archive: &str) -> Self {
        Self {
            archive: archive.to_string(),
            name: None,
            status: ArchiveStatus::Failed,
            failed_stage: None,
            error: None,
            deliveries: Vec::new(),
        }
    }

    /// An archive that never started because the run was cancelled.
    pub fn cancelled(archive: &str) -> Self {
        Self {
            status: ArchiveStatus::Cancelled,
            error: Some(PipelineError::Cancelled),
            ..Self::new(archive)
        }
    }

    /// The errors of every destination that did not receive the artifact.
    pub fn failed_deliveries(&self) -> impl Iterator<Item = &DeliveryError> {
        self.deliveries
            .iter()
            .filter_map(|delivery| delivery.result.as_ref().err())
    }

    fn fail(mut self, stage: Stage, error: PipelineError) -> Self {
        self.status = match error {
            PipelineError::Cancelled => ArchiveStatus::Cancelled,
            _ => ArchiveStatus::Failed,
        };
        self.failed_stage = Some(stage);
        self.error = Some(error);
        self
    }
}

type StageResult<T> = Result<T, (Stage, PipelineError)>;

/// Everything the stages of one archive work on.
struct Plan {
    sources: Vec<(Arc<dyn SourceAdapter>, Vec<Selector>)>,
    encryptor: Option<Arc<dyn Encryptor>>,
    destinations: Vec<Arc<dyn DestinationAdapter>>,
}

/// Turns one archive definition into a delivered artifact.
///
/// The pipeline owns a workspace directory below the working directory for
/// the whole run. Every intermediate file lives there and the workspace is
/// removed on every exit path.
pub struct ArchivePipeline {
    archive: Archive,
    adapters: Arc<Adapters>,
    working_directory: PathBuf,
    clock: Arc<dyn Clock>,
    cancel: Cancellation,
}

impl ArchivePipeline {
    pub fn new(
        archive: Archive,
        adapters: Arc<Adapters>,
        working_directory: PathBuf,
        clock: Arc<dyn Clock>,
        cancel: Cancellation,
    ) -> Self {
        Self {
            archive,
            adapters,
            working_directory,
            clock,
            cancel,
        }
    }

    pub async fn execute(&self) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome::new(self.archive.name.as_str());
        let context = RenderContext {
            timestamp: self.clock.now(),
        };

        let name = match self.archive.name.render(&context) {
            Ok(name) => name,
            Err(err) => {
                error!("archive '{}': {}", outcome.archive, err);
                return outcome.fail(Stage::Resolving, err.into());
            }
        };
        outcome.name = Some(name.clone());
        info!("creating archive: {}", name);

        let workspace = match tempfile::Builder::new()
            .prefix(&format!("{}.", name))
            .tempdir_in(&self.working_directory)
        {
            Ok(workspace) => workspace,
            Err(err) => {
                error!("archive '{}': unable to create workspace: {}", name, err);
                return outcome.fail(Stage::Resolving, err.into());
            }
        };

        let mtime = context.timestamp.timestamp().max(0) as u64;
        let result = self.run_stages(&name, mtime, workspace.path()).await;
        self.cleanup(&name, workspace);

        match result {
            Ok(deliveries) => {
                let delivered = deliveries
                    .iter()
                    .filter(|delivery| delivery.result.is_ok())
                    .count();
                outcome.status = if delivered == deliveries.len() {
                    ArchiveStatus::Success
                } else if delivered > 0 {
                    ArchiveStatus::Partial
                } else {
                    outcome.failed_stage = Some(Stage::Delivering);
                    ArchiveStatus::Failed
                };
                outcome.deliveries = deliveries;
                info!("archive '{}': {:?}", name, outcome.status);
                outcome
            }
            Err((stage, err)) => {
                error!("archive '{}' failed while {}: {}", name, stage, err);
                outcome.fail(stage, err)
            }
        }
    }

    fn enter(&self, name: &str, stage: Stage) -> StageResult<()> {
        match self.cancel.interrupted() {
            Some(Interrupt::Cancelled) => Err((stage, PipelineError::Cancelled)),
            Some(Interrupt::TimedOut) => Err((stage, PipelineError::TimedOut)),
            None => {
                info!("archive '{}': {}", name, stage);
                Ok(())
            }
        }
    }

    /// Replaces a stage error with the interruption that caused it.
    fn interrupted_or(&self, stage: Stage, err: PipelineError) -> (Stage, PipelineError) {
        match self.cancel.interrupted() {
            Some(Interrupt::Cancelled) => (stage, PipelineError::Cancelled),
            Some(Interrupt::TimedOut) => (stage, PipelineError::TimedOut),
            None => (stage, err),
        }
    }

    async fn blocking<T, F>(&self, stage: Stage, work: F) -> StageResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|err| PipelineError::Task(err.to_string()))
            .and_then(|result| result)
            .map_err(|err| self.interrupted_or(stage, err))
    }

    fn plan(&self) -> Result<Plan, PipelineError> {
        let dangling = |family: &'static str, id: &str| ConfigReferenceError {
            archive: self.archive.name.as_str().to_string(),
            family,
            id: id.to_string(),
        };

        let mut sources: Vec<(Arc<dyn SourceAdapter>, Vec<Selector>)> = Vec::new();
        for directory in &self.archive.directories {
            sources.push((
                Arc::new(DirectorySource::new(directory)),
                vec![Selector::exact("*")],
            ));
        }
        for selection in &self.archive.databases {
            let source = self
                .adapters
                .source(&selection.db_id)
                .ok_or_else(|| dangling("database", &selection.db_id))?;
            sources.push((source, selection.selectors.clone()));
        }

        let encryptor = match &self.archive.encryption {
            Some(id) => Some(
                self.adapters
                    .encryptor(id)
                    .ok_or_else(|| dangling("encryption", id))?,
            ),
            None => None,
        };

        let destinations = self
            .archive
            .destinations
            .iter()
            .map(|id| {
                self.adapters
                    .destination(id)
                    .ok_or_else(|| dangling("destination", id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Plan {
            sources,
            encryptor,
            destinations,
        })
    }

    async fn run_stages(
        &self,
        name: &str,
        mtime: u64,
        workspace: &Path,
    ) -> StageResult<Vec<DeliveryOutcome>> {
        self.enter(name, Stage::Resolving)?;
        let plan = self
            .plan()
            .map_err(|err| (Stage::Resolving, err))?;
        let cancel = self.cancel.clone();
        let sources = plan.sources.clone();
        let resolved = self
            .blocking(Stage::Resolving, move || {
                let mut resolved = Vec::new();
                for (source, selectors) in sources {
                    let units = source.enumerate(&cancel)?;
                    let units = resolve_selectors(source.id(), &units, &selectors)?;
                    let units = source.collapse(units);
                    resolved.push((source, units));
                }
                Ok(resolved)
            })
            .await?;

        self.enter(name, Stage::Dumping)?;
        let cancel = self.cancel.clone();
        let dump_root = workspace.to_path_buf();
        let units = self
            .blocking(Stage::Dumping, move || dump_all(resolved, &dump_root, &cancel))
            .await?;

        self.enter(name, Stage::Compressing)?;
        let compression = self.archive.compression;
        let target = workspace.join(format!("{}{}", name, compression.to_extension_string()));
        let mut artifact = self
            .blocking(Stage::Compressing, move || {
                Ok(compression.compress(&units, &target, mtime)?)
            })
            .await?;

        if let Some(encryptor) = plan.encryptor {
            self.enter(name, Stage::Encrypting)?;
            let cancel = self.cancel.clone();
            let plain = artifact.clone();
            artifact = self
                .blocking(Stage::Encrypting, move || {
                    let encrypted = encryptor.encrypt(&plain, &cancel)?;
                    if let Err(err) = fs::remove_file(&plain) {
                        warn!("unable to remove '{}': {}", plain.display(), err);
                    }
                    Ok(encrypted)
                })
                .await?;
        }

        self.enter(name, Stage::Delivering)?;
        let object_name = artifact
            .file_name()
            .map(|file_name| file_name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                (
                    Stage::Delivering,
                    PipelineError::Task(String::from("artifact has no file name")),
                )
            })?;
        let artifact = artifact.as_path();
        let object_name = object_name.as_str();
        let deliveries = join_all(plan.destinations.iter().map(|destination| async move {
            let result = destination.deliver(artifact, object_name).await;
            if let Err(err) = &result {
                warn!("{}", err);
            }
            DeliveryOutcome {
                destination: destination.id().to_string(),
                result,
            }
        }))
        .await;

        Ok(deliveries)
    }

    fn cleanup(&self, name: &str, workspace: TempDir) {
        info!("archive '{}': {}", name, Stage::Cleanup);
        let path = workspace.path().to_path_buf();
        if let Err(err) = workspace.close() {
            warn!("unable to remove workspace '{}': {}", path.display(), err);
        }
    }
}

/// Dumps every resolved unit into its own directory below `workspace`, in
/// resolution order.
fn dump_all(
    resolved: Vec<(Arc<dyn SourceAdapter>, Vec<String>)>,
    workspace: &Path,
    cancel: &Cancellation,
) -> Result<Vec<DumpedUnit>, PipelineError> {
    let mut dumped: Vec<DumpedUnit> = Vec::new();
    for (index, (source, units)) in resolved.into_iter().enumerate() {
        let source_workspace = workspace.join(format!("source-{}", index));
        fs::create_dir(&source_workspace)?;

        for unit in units {
            if cancel.interrupted().is_some() {
                return Err(PipelineError::Cancelled);
            }
            let dump = source.dump(&unit, &source_workspace, cancel)?;
            if dumped.iter().any(|known| known.entry_name == dump.entry_name) {
                return Err(SourceError::Dump {
                    source_id: source.id().to_string(),
                    unit,
                    reason: format!("archive entry '{}' is already taken", dump.entry_name),
                }
                .into());
            }
            dumped.push(dump);
        }
    }
    Ok(dumped)
}
