//! Source adapters produce the logical units an archive is built from.
//!
//! Database adapters shell out to the engine's native client and dump tools,
//! writing dump output straight to a file in the archive workspace. The
//! directory adapter hands the tree to the compressor untouched.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::info;
use regex::Regex;

use crate::configuration::archive::Selector;
use crate::error::SourceError;
use crate::helper::process::{self, Cancellation};

pub mod directory;
pub mod mongodb;
pub mod mysql;
pub mod postgresql;

pub use directory::DirectorySource;
pub use mongodb::MongoDbSource;
pub use mysql::MySqlSource;
pub use postgresql::PostgreSqlSource;

/// Content of one dumped logical unit.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// A dump file inside the workspace, owned by the pipeline.
    File(PathBuf),
    /// A directory tree archived verbatim, never modified.
    Tree(PathBuf),
}

/// A logical unit ready for the compressor, `entry_name` is its name inside the archive.
#[derive(Clone, Debug, PartialEq)]
pub struct DumpedUnit {
    pub entry_name: String,
    pub payload: Payload,
}

pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Extension appended to a unit's name to form its archive entry.
    fn entry_extension(&self) -> &str;

    /// Lists the logical units currently visible on the live source.
    fn enumerate(&self, cancel: &Cancellation) -> Result<Vec<String>, SourceError>;

    /// Drops resolved units that another resolved unit already contains.
    fn collapse(&self, units: Vec<String>) -> Vec<String> {
        units
    }

    /// Dumps one unit, writing any intermediate file into `workspace`.
    fn dump(
        &self,
        unit: &str,
        workspace: &Path,
        cancel: &Cancellation,
    ) -> Result<DumpedUnit, SourceError>;

    /// Loads a previously dumped unit back into the source.
    fn restore(&self, unit: &str, dump: &Path, cancel: &Cancellation) -> Result<(), SourceError>;
}

enum Matcher {
    All,
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn new(source_id: &str, selector: &Selector) -> Result<Self, SourceError> {
        if !selector.name_is_regex {
            return Ok(match selector.name.as_str() {
                "*" => Matcher::All,
                name => Matcher::Exact(name.to_string()),
            });
        }

        Regex::new(&format!("^(?:{})$", selector.name))
            .map(Matcher::Pattern)
            .map_err(|err| SourceError::InvalidSelector {
                source_id: source_id.to_string(),
                pattern: selector.name.clone(),
                reason: err.to_string(),
            })
    }

    fn matches(&self, unit: &str) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Exact(name) => name == unit,
            Matcher::Pattern(regex) => regex.is_match(unit),
        }
    }
}

/// Resolves `selectors` against the live enumeration `units`.
///
/// Exact names match whole unit names only, `*` matches everything and
/// regular expressions must match the whole name. The result keeps the
/// enumeration order without duplicates and is never empty.
pub fn resolve_selectors(
    source_id: &str,
    units: &[String],
    selectors: &[Selector],
) -> Result<Vec<String>, SourceError> {
    let matchers = selectors
        .iter()
        .map(|selector| Matcher::new(source_id, selector))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen: HashSet<&str> = HashSet::new();
    let mut resolved = Vec::new();
    for unit in units {
        if matchers.iter().any(|matcher| matcher.matches(unit)) && seen.insert(unit.as_str()) {
            resolved.push(unit.clone());
        }
    }

    if resolved.is_empty() {
        return Err(SourceError::NoMatch {
            source_id: source_id.to_string(),
        });
    }

    info!("source '{}': selected {:?}", source_id, resolved);
    Ok(resolved)
}

fn enumerate_error(source_id: &str, reason: impl ToString) -> SourceError {
    SourceError::Enumerate {
        source_id: source_id.to_string(),
        reason: reason.to_string(),
    }
}

fn dump_error(source_id: &str, unit: &str, reason: impl ToString) -> SourceError {
    SourceError::Dump {
        source_id: source_id.to_string(),
        unit: unit.to_string(),
        reason: reason.to_string(),
    }
}

fn restore_error(source_id: &str, unit: &str, reason: impl ToString) -> SourceError {
    SourceError::Restore {
        source_id: source_id.to_string(),
        unit: unit.to_string(),
        reason: reason.to_string(),
    }
}

/// Runs a listing command and returns its non-empty output lines.
fn list_units(source_id: &str, command: Command, cancel: &Cancellation) -> Result<Vec<String>, SourceError> {
    let stdout = process::output(command, cancel).map_err(|err| enumerate_error(source_id, err))?;
    Ok(String::from_utf8_lossy(&stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Streams the stdout of `command` into `<workspace>/<unit><extension>`.
fn dump_to_file(
    source_id: &str,
    unit: &str,
    extension: &str,
    mut command: Command,
    workspace: &Path,
    cancel: &Cancellation,
) -> Result<DumpedUnit, SourceError> {
    if unit.is_empty() || unit.contains(['/', '\\', '\0']) || unit == "." || unit == ".." {
        return Err(dump_error(source_id, unit, "unit name is not usable as a file name"));
    }

    let entry_name = format!("{}{}", unit, extension);
    let target = workspace.join(&entry_name);
    let output = File::create(&target).map_err(|err| dump_error(source_id, unit, err))?;

    info!("source '{}': dumping '{}'", source_id, unit);
    command.stdout(Stdio::from(output));
    process::run(command, cancel).map_err(|err| dump_error(source_id, unit, err))?;

    Ok(DumpedUnit {
        entry_name,
        payload: Payload::File(target),
    })
}

/// Feeds `dump` to `command` on stdin.
fn import_from_file(
    source_id: &str,
    unit: &str,
    command: Command,
    dump: &Path,
    cancel: &Cancellation,
) -> Result<(), SourceError> {
    let input = File::open(dump).map_err(|err| restore_error(source_id, unit, err))?;

    info!("source '{}': restoring '{}'", source_id, unit);
    process::run_with_stdin(command, Stdio::from(input), cancel)
        .map_err(|err| restore_error(source_id, unit, err))
}
