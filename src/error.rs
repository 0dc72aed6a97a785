use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading a backup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backup configuration '{path}' does not exist")]
    NotFound { path: String },

    #[error("unable to read backup configuration: {0}")]
    Io(#[from] io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] xml::reader::Error),

    #[error("invalid {attribute} value '{value}'")]
    InvalidValue {
        attribute: &'static str,
        value: String,
    },

    #[error("{message}")]
    Invalid { message: String },

    #[error("the {family}-id '{id}' already exists")]
    DuplicateId { family: &'static str, id: String },

    #[error("secret placeholder '[{name}]' could not be resolved")]
    UnresolvedSecret { name: String },

    #[error(transparent)]
    Reference(#[from] ConfigReferenceError),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// An archive refers to a database, destination or encryption that was never declared.
#[derive(Debug, Error)]
#[error("archive '{archive}' references unknown {family} '{id}'")]
pub struct ConfigReferenceError {
    pub archive: String,
    pub family: &'static str,
    pub id: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unknown placeholder '{placeholder}' in name template '{template}'")]
    UnknownPlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("unterminated placeholder in name template '{template}'")]
    Unterminated { template: String },

    #[error("name template '{template}' renders to an empty name")]
    Empty { template: String },

    #[error("rendered name '{name}' is not a valid file name: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// Failures of external programs run through `helper::process`.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unable to spawn '{program}': {cause}")]
    Spawn {
        program: String,
        #[source]
        cause: io::Error,
    },

    #[error("'{program}' exited with code {code}: {stderr}")]
    Exit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("'{program}' was terminated by a signal")]
    Signalled { program: String },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },

    #[error("'{program}' exceeded its deadline")]
    TimedOut { program: String },

    #[error("i/o error while supervising '{program}': {cause}")]
    Io {
        program: String,
        #[source]
        cause: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source '{source_id}': unable to enumerate logical units: {reason}")]
    Enumerate { source_id: String, reason: String },

    #[error("source '{source_id}': unable to dump '{unit}': {reason}")]
    Dump {
        source_id: String,
        unit: String,
        reason: String,
    },

    #[error("source '{source_id}': unable to restore '{unit}': {reason}")]
    Restore {
        source_id: String,
        unit: String,
        reason: String,
    },

    #[error("source '{source_id}': invalid selector '{pattern}': {reason}")]
    InvalidSelector {
        source_id: String,
        pattern: String,
        reason: String,
    },

    #[error("source '{source_id}': selectors matched no logical unit")]
    NoMatch { source_id: String },
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("unable to create archive file '{}': {cause}", path.display())]
    Create { path: PathBuf, cause: io::Error },

    #[error("unable to append '{entry}' to archive: {cause}")]
    Append { entry: String, cause: io::Error },

    #[error("unable to finish archive '{}': {cause}", path.display())]
    Finish { path: PathBuf, cause: io::Error },

    #[error("unable to extract archive '{}': {cause}", path.display())]
    Extract { path: PathBuf, cause: io::Error },
}

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption '{recipe}': {cause}")]
    Program {
        recipe: String,
        #[source]
        cause: ProcessError,
    },

    #[error("encryption '{recipe}': expected output '{}' was not produced", output.display())]
    MissingOutput { recipe: String, output: PathBuf },

    #[error("encryption '{recipe}' has no decrypt-parameters")]
    NoDecryptParameters { recipe: String },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("destination '{destination}' is not configured")]
    Unknown { destination: String },

    #[error("destination '{destination}': {reason}")]
    Transfer { destination: String, reason: String },

    #[error("destination '{destination}': upload could not be verified: {reason}")]
    Verification { destination: String, reason: String },
}

impl DeliveryError {
    pub fn transfer(destination: &str, reason: impl ToString) -> Self {
        Self::Transfer {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn verification(destination: &str, reason: impl ToString) -> Self {
        Self::Verification {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Stage failures of one archive pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Reference(#[from] ConfigReferenceError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error("unable to prepare workspace: {0}")]
    Workspace(#[from] io::Error),

    #[error("archive was cancelled")]
    Cancelled,

    #[error("archive exceeded its timeout")]
    TimedOut,

    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// Errors that stop a whole run before any archive is processed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Reference(#[from] ConfigReferenceError),

    #[error("unable to prepare working directory '{}': {cause}", path.display())]
    WorkingDirectory { path: PathBuf, cause: io::Error },

    #[error("no {family} adapter registered for kind '{kind}'")]
    UnknownKind { family: &'static str, kind: String },
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Reference(#[from] ConfigReferenceError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("unable to prepare workspace: {0}")]
    Workspace(#[from] io::Error),

    #[error("no archive matching '{prefix}*{suffix}' found on any destination")]
    NothingFound { prefix: String, suffix: String },

    #[error("restore was cancelled")]
    Cancelled,

    #[error("restore task failed: {0}")]
    Task(String),
}
