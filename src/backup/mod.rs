use std::fs;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{error, info, warn};

use crate::configuration::Configuration;
use crate::error::RunError;
use crate::helper::process::Cancellation;
use crate::registry::Adapters;
use crate::template::{Clock, SystemClock};

pub mod pipeline;

pub use pipeline::{ArchiveOutcome, ArchivePipeline, ArchiveStatus, DeliveryOutcome, Stage};

/// One outcome per archive, in configuration order.
#[derive(Debug)]
pub struct RunReport {
    pub outcomes: Vec<ArchiveOutcome>,
}

impl RunReport {
    /// True only if every archive reached every destination.
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| outcome.status == ArchiveStatus::Success)
    }

    pub fn log_summary(&self) {
        for outcome in &self.outcomes {
            let name = outcome.name.as_deref().unwrap_or(outcome.archive.as_str());
            match outcome.status {
                ArchiveStatus::Success => info!("archive '{}': delivered", name),
                ArchiveStatus::Partial => {
                    for err in outcome.failed_deliveries() {
                        warn!("archive '{}': {}", name, err);
                    }
                }
                ArchiveStatus::Failed | ArchiveStatus::Cancelled => {
                    let stage = outcome
                        .failed_stage
                        .map(|stage| stage.to_string())
                        .unwrap_or_else(|| String::from("startup"));
                    match &outcome.error {
                        Some(err) => error!("archive '{}' failed while {}: {}", name, stage, err),
                        None => error!("archive '{}' failed while {}", name, stage),
                    }
                    for err in outcome.failed_deliveries() {
                        error!("archive '{}': {}", name, err);
                    }
                }
            }
        }
    }
}

/// Runs every archive of a configuration through its own pipeline.
pub struct Backup {
    adapters: Arc<Adapters>,
    clock: Arc<dyn Clock>,
}

impl Backup {
    pub fn new(adapters: Adapters) -> Self {
        Self {
            adapters: Arc::new(adapters),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fails before any archive starts if a reference dangles or the working
    /// directory cannot be created. Archive failures only show up in the report.
    pub async fn run(
        &self,
        configuration: &Configuration,
        cancel: &Cancellation,
    ) -> Result<RunReport, RunError> {
        configuration.validate()?;
        let working_directory = configuration.working_directory.clone();
        fs::create_dir_all(&working_directory).map_err(|cause| RunError::WorkingDirectory {
            path: working_directory.clone(),
            cause,
        })?;

        let jobs = configuration.jobs.max(1);
        info!(
            "running {} archive(s) with {} job(s)",
            configuration.archives.len(),
            jobs
        );

        let outcomes = stream::iter(configuration.archives.iter().cloned())
            .map(|archive| {
                let adapters = Arc::clone(&self.adapters);
                let clock = Arc::clone(&self.clock);
                let working_directory = working_directory.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        warn!("archive '{}' skipped, the run was cancelled", archive.name.as_str());
                        return ArchiveOutcome::cancelled(archive.name.as_str());
                    }
                    let token = cancel.with_timeout(archive.timeout);
                    ArchivePipeline::new(archive, adapters, working_directory, clock, token)
                        .execute()
                        .await
                }
            })
            .buffered(jobs)
            .collect::<Vec<_>>()
            .await;

        Ok(RunReport { outcomes })
    }
}
