use std::path::PathBuf;
use std::str::FromStr;

use crate::configuration::Credential;
use crate::error::ConfigError;

/// A database server archives can select logical databases from.
#[derive(Clone, Debug)]
pub struct Database {
    pub credential: Credential,
    pub host: Option<String>,
    pub id: String,
    pub kind: Kind,
    pub port: Option<u16>,
    /// Directory holding the client tools. When unset they are looked up in `PATH`.
    pub tool_directory: Option<PathBuf>,
}

impl Database {
    pub fn new() -> Database {
        Database {
            credential: Credential::new(),
            host: None,
            id: String::new(),
            kind: Kind::MySql,
            port: None,
            tool_directory: None,
        }
    }

    /// Path of the client tool `program`, inside `tool_directory` when one is set.
    pub fn tool(&self, program: &str) -> PathBuf {
        match &self.tool_directory {
            Some(directory) => directory.join(program),
            None => PathBuf::from(program),
        }
    }
}

/// The configured engine. Kinds without a built-in variant are kept verbatim
/// and left to the adapter registry to accept or reject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    MongoDB,
    MySql,
    PostgreSql,
    Other(String),
}

impl Kind {
    pub fn as_str(&self) -> &str {
        match self {
            Kind::MongoDB => "mongodb",
            Kind::MySql => "mysql",
            Kind::PostgreSql => "postgresql",
            Kind::Other(kind) => kind,
        }
    }
}

impl FromStr for Kind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mongodb" => Ok(Kind::MongoDB),
            "mysql" => Ok(Kind::MySql),
            "postgresql" => Ok(Kind::PostgreSql),
            "" => Err(ConfigError::InvalidValue {
                attribute: "database kind",
                value: String::new(),
            }),
            kind => Ok(Kind::Other(kind.to_string())),
        }
    }
}
