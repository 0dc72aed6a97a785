//! In-memory adapters for pipeline, run and restore tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::destination::{Delivery, DestinationAdapter};
use crate::error::{DeliveryError, SourceError};
use crate::helper::process::Cancellation;
use crate::source::{DumpedUnit, Payload, SourceAdapter};

/// A database source with a fixed list of units. Dumps contain `dump of <unit>`.
pub struct FakeSource {
    pub id: String,
    pub units: Vec<String>,
    pub failing_unit: Option<String>,
    pub restored: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeSource {
    pub fn new(id: &str, units: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            units: units.iter().map(|unit| unit.to_string()).collect(),
            failing_unit: None,
            restored: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(mut self, unit: &str) -> Self {
        self.failing_unit = Some(unit.to_string());
        self
    }

    pub fn restored(&self) -> Vec<(String, Vec<u8>)> {
        self.restored.lock().unwrap().clone()
    }
}

impl SourceAdapter for FakeSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn entry_extension(&self) -> &str {
        ".sql"
    }

    fn enumerate(&self, _cancel: &Cancellation) -> Result<Vec<String>, SourceError> {
        Ok(self.units.clone())
    }

    fn dump(
        &self,
        unit: &str,
        workspace: &Path,
        _cancel: &Cancellation,
    ) -> Result<DumpedUnit, SourceError> {
        if self.failing_unit.as_deref() == Some(unit) {
            return Err(SourceError::Dump {
                source_id: self.id.clone(),
                unit: unit.to_string(),
                reason: String::from("access denied"),
            });
        }

        let entry_name = format!("{}.sql", unit);
        let path = workspace.join(&entry_name);
        fs::write(&path, format!("dump of {}", unit)).unwrap();
        Ok(DumpedUnit {
            entry_name,
            payload: Payload::File(path),
        })
    }

    fn restore(&self, unit: &str, dump: &Path, _cancel: &Cancellation) -> Result<(), SourceError> {
        let content = fs::read(dump).unwrap();
        self.restored
            .lock()
            .unwrap()
            .push((unit.to_string(), content));
        Ok(())
    }
}

/// A destination keeping delivered objects in memory.
pub struct FakeDestination {
    pub id: String,
    pub failing: bool,
    pub stored: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeDestination {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            failing: false,
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(id: &str) -> Self {
        Self {
            failing: true,
            ..Self::new(id)
        }
    }

    pub fn stored(&self) -> Vec<(String, Vec<u8>)> {
        self.stored.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.stored().into_iter().map(|(name, _)| name).collect()
    }
}

#[async_trait]
impl DestinationAdapter for FakeDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, file: &Path, object_name: &str) -> Result<Delivery, DeliveryError> {
        if self.failing {
            return Err(DeliveryError::transfer(&self.id, "connection refused"));
        }

        let content = fs::read(file).map_err(|err| DeliveryError::transfer(&self.id, err))?;
        let size = content.len() as u64;
        self.stored
            .lock()
            .unwrap()
            .push((object_name.to_string(), content));
        Ok(Delivery {
            destination: self.id.clone(),
            location: format!("memory://{}/{}", self.id, object_name),
            size,
        })
    }

    async fn retrieve_latest(
        &self,
        prefix: &str,
        suffix: &str,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>, DeliveryError> {
        let latest = self
            .stored()
            .into_iter()
            .rev()
            .find(|(name, _)| name.starts_with(prefix) && name.ends_with(suffix));

        match latest {
            Some((name, content)) => {
                let target = target_dir.join(name);
                fs::write(&target, content).map_err(|err| DeliveryError::transfer(&self.id, err))?;
                Ok(Some(target))
            }
            None => Ok(None),
        }
    }
}

/// Writes an executable `/bin/sh` script `name` into `directory`.
pub fn write_tool(directory: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let path = directory.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Shell snippet appending the script's name, arguments and `variable` to `calls.log`.
pub fn log_call(variable: &str) -> String {
    format!(
        "echo \"$(basename \"$0\") $* {variable}=${variable}\" >> \"$(dirname \"$0\")/calls.log\"",
        variable = variable
    )
}

pub fn read_calls(directory: &Path) -> String {
    fs::read_to_string(directory.join("calls.log")).unwrap_or_default()
}
