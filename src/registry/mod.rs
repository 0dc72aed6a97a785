//! Maps configured kinds to adapter constructors.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::configuration::{Configuration, Database, Destination};
use crate::destination::{DestinationAdapter, DirectoryDestination, S3Destination, SshDestination};
use crate::encryptor::{Encryptor, ExternalProgram};
use crate::error::RunError;
use crate::source::{MongoDbSource, MySqlSource, PostgreSqlSource, SourceAdapter};

pub type SourceFactory = fn(&Database) -> Arc<dyn SourceAdapter>;
pub type DestinationFactory = fn(&Destination) -> Arc<dyn DestinationAdapter>;

/// The adapters of one configuration, keyed by their configured id.
#[derive(Clone, Default)]
pub struct Adapters {
    sources: HashMap<String, Arc<dyn SourceAdapter>>,
    destinations: HashMap<String, Arc<dyn DestinationAdapter>>,
    encryptors: HashMap<String, Arc<dyn Encryptor>>,
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_source(&mut self, source: Arc<dyn SourceAdapter>) {
        self.sources.insert(source.id().to_string(), source);
    }

    pub fn insert_destination(&mut self, destination: Arc<dyn DestinationAdapter>) {
        self.destinations
            .insert(destination.id().to_string(), destination);
    }

    pub fn insert_encryptor(&mut self, encryptor: Arc<dyn Encryptor>) {
        self.encryptors.insert(encryptor.id().to_string(), encryptor);
    }

    pub fn source(&self, id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.sources.get(id).cloned()
    }

    pub fn destination(&self, id: &str) -> Option<Arc<dyn DestinationAdapter>> {
        self.destinations.get(id).cloned()
    }

    pub fn encryptor(&self, id: &str) -> Option<Arc<dyn Encryptor>> {
        self.encryptors.get(id).cloned()
    }
}

pub struct Registry {
    sources: HashMap<String, SourceFactory>,
    destinations: HashMap<String, DestinationFactory>,
}

impl Default for Registry {
    /// A registry knowing every built-in database and destination kind.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_source("mysql", MySqlSource::create);
        registry.register_source("postgresql", PostgreSqlSource::create);
        registry.register_source("mongodb", MongoDbSource::create);
        registry.register_destination("directory", DirectoryDestination::create);
        registry.register_destination("s3", S3Destination::create);
        registry.register_destination("ssh", SshDestination::create);
        registry
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            sources: HashMap::new(),
            destinations: HashMap::new(),
        }
    }

    pub fn register_source(&mut self, kind: &str, factory: SourceFactory) {
        self.sources.insert(kind.to_string(), factory);
    }

    pub fn register_destination(&mut self, kind: &str, factory: DestinationFactory) {
        self.destinations.insert(kind.to_string(), factory);
    }

    /// Instantiates one adapter per configured database, destination and
    /// encryption recipe.
    pub fn build(&self, configuration: &Configuration) -> Result<Adapters, RunError> {
        let mut adapters = Adapters::new();

        for database in &configuration.databases {
            let kind = database.kind.as_str();
            let factory = self.sources.get(kind).ok_or_else(|| RunError::UnknownKind {
                family: "database",
                kind: kind.to_string(),
            })?;
            debug!("database '{}' uses the {} adapter", database.id, kind);
            adapters.insert_source(factory(database));
        }

        for destination in &configuration.destinations {
            let kind = destination.kind.as_str();
            let factory = self
                .destinations
                .get(kind)
                .ok_or_else(|| RunError::UnknownKind {
                    family: "destination",
                    kind: kind.to_string(),
                })?;
            debug!("destination '{}' uses the {} adapter", destination.id, kind);
            adapters.insert_destination(factory(destination));
        }

        for encryption in &configuration.encryptions {
            adapters.insert_encryptor(ExternalProgram::create(encryption));
        }

        Ok(adapters)
    }
}
