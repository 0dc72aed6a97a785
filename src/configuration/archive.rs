use std::time::Duration;

use crate::configuration::{Compression, Directory};
use crate::template::NameTemplate;

/// One `{name, name-is-regex}` selector of a database selection.
#[derive(Clone, Debug, PartialEq)]
pub struct Selector {
    pub name: String,
    pub name_is_regex: bool,
}

impl Selector {
    pub fn exact<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            name_is_regex: false,
        }
    }

    pub fn regex<S: Into<String>>(pattern: S) -> Self {
        Self {
            name: pattern.into(),
            name_is_regex: true,
        }
    }
}

/// The logical databases an archive takes from one database source.
#[derive(Clone, Debug)]
pub struct DatabaseSelection {
    pub db_id: String,
    pub selectors: Vec<Selector>,
}

#[derive(Clone, Debug)]
pub struct Archive {
    pub compression: Compression,
    pub databases: Vec<DatabaseSelection>,
    pub destinations: Vec<String>,
    pub directories: Vec<Directory>,
    pub encryption: Option<String>,
    pub name: NameTemplate,
    pub timeout: Option<Duration>,
}

impl Archive {
    pub fn new() -> Archive {
        Archive {
            compression: Compression::TarBZ2,
            databases: Vec::new(),
            destinations: Vec::new(),
            directories: Vec::new(),
            encryption: None,
            name: NameTemplate::new(""),
            timeout: None,
        }
    }

    /// Adds `selector` to the selection of `db_id`, creating it on first use.
    pub fn add_selector(&mut self, db_id: &str, selector: Selector) {
        match self.databases.iter_mut().find(|selection| selection.db_id == db_id) {
            Some(selection) => selection.selectors.push(selector),
            None => self.databases.push(DatabaseSelection {
                db_id: db_id.to_string(),
                selectors: vec![selector],
            }),
        }
    }

    pub fn add_destination(&mut self, id: &str) {
        let id = id.trim();
        if !id.is_empty() && !self.destinations.iter().any(|known| known == id) {
            self.destinations.push(id.to_string());
        }
    }
}
