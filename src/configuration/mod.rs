use std::{
    fs::File,
    io::{BufReader, ErrorKind, Read},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use log::{debug, warn};
use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, XmlEvent as XmlReaderEvent};

pub mod archive;
pub mod compression;
pub mod credential;
pub mod database;
pub mod destination;
pub mod directory;
pub mod encryption;
pub mod program_parameter;

pub use archive::{Archive, DatabaseSelection, Selector};
pub use compression::Compression;
pub use credential::{Credential, EnvSecretResolver, SecretResolver};
pub use database::{Database, Kind as DatabaseKind};
pub use destination::{Destination, Kind as DestinationKind};
pub use directory::Directory;
pub use encryption::Encryption;
pub use program_parameter::ProgramParameter;

use crate::error::{ConfigError, ConfigReferenceError};
use crate::template::NameTemplate;

use credential::resolve_placeholder;

/// The backup settings document, read-only once loaded.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub archives: Vec<Archive>,
    pub databases: Vec<Database>,
    pub destinations: Vec<Destination>,
    pub encryptions: Vec<Encryption>,
    /// Number of archives processed at the same time.
    pub jobs: usize,
    pub working_directory: PathBuf,
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on" | "enabled")
}

fn parse_port(value: &str, attribute: &'static str) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        attribute,
        value: value.to_string(),
    })
}

fn parse_duration(value: &str, attribute: &'static str) -> Result<Duration, ConfigError> {
    parse_duration0::parse(value).map_err(|_| ConfigError::InvalidValue {
        attribute,
        value: value.to_string(),
    })
}

fn expand_home(filename: &str) -> String {
    match dirs::home_dir() {
        Some(home_dir) if filename == "~" || filename.starts_with("~/") => {
            format!("{}{}", home_dir.display(), &filename[1..])
        }
        _ => filename.to_string(),
    }
}

fn read_database(attributes: Vec<OwnedAttribute>) -> Result<Database, ConfigError> {
    let mut database = Database::new();
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "id" => database.id = attr.value,
            "kind" => database.kind = DatabaseKind::from_str(&attr.value)?,
            "username" => database.credential.username = attr.value,
            "password" => database.credential.password = attr.value,
            "host" => database.host = Some(attr.value).filter(|host| !host.is_empty()),
            "port" => database.port = Some(parse_port(&attr.value, "database port")?),
            "tool-directory" if !attr.value.is_empty() => {
                database.tool_directory = Some(PathBuf::from(expand_home(&attr.value)))
            }
            _ => {}
        }
    }
    Ok(database)
}

fn read_destination(attributes: Vec<OwnedAttribute>) -> Result<Destination, ConfigError> {
    let mut destination = Destination::new();
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "bucket" => destination.s3_bucket = attr.value,
            "id" => destination.id = attr.value,
            "kind" => destination.kind = DestinationKind::from_str(&attr.value)?,
            "max-archive-age" => match parse_duration0::parse(&attr.value) {
                Ok(duration) => destination.max_archive_age = Some(duration),
                Err(_) => warn!("ignoring invalid max-archive-age '{}'", attr.value),
            },
            "password" => destination.password = attr.value,
            "path" => destination.path = attr.value,
            "port" => destination.port = parse_port(&attr.value, "destination port")?,
            "region" => destination.s3_region = Destination::parse_region(&attr.value)?,
            "server" => destination.server = attr.value,
            "username" => destination.username = attr.value,
            _ => {}
        }
    }
    Ok(destination)
}

fn read_encryption(attributes: Vec<OwnedAttribute>) -> Encryption {
    let mut encryption = Encryption::new();
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "cipher" => encryption.cipher = attr.value,
            "extension" => encryption.extension = attr.value,
            "id" => encryption.id = attr.value,
            "password" => encryption.password = attr.value,
            "program" => encryption.program = attr.value,
            _ => {}
        }
    }
    encryption
}

fn read_parameter(attributes: Vec<OwnedAttribute>) -> ProgramParameter {
    let mut parameter = ProgramParameter::new();
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "assign-sign" => parameter.assign_sign = attr.value,
            "longname" => parameter.longname = Some(attr.value),
            "shortname" => parameter.shortname = Some(attr.value),
            "value" => parameter.value = Some(attr.value),
            _ => {}
        }
    }
    parameter
}

fn read_archive(attributes: Vec<OwnedAttribute>) -> Result<Archive, ConfigError> {
    let mut archive = Archive::new();
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "compression" => archive.compression = Compression::from_str(&attr.value)?,
            "destination" => {
                for id in attr.value.split(',') {
                    archive.add_destination(id);
                }
            }
            "encryption" => {
                archive.encryption = Some(attr.value).filter(|id| !id.is_empty());
            }
            "name" => archive.name = NameTemplate::new(attr.value),
            "timeout" => archive.timeout = Some(parse_duration(&attr.value, "archive timeout")?),
            _ => {}
        }
    }
    Ok(archive)
}

fn read_selector(
    archive: &mut Archive,
    attributes: Vec<OwnedAttribute>,
    selection_db_id: &str,
) -> Result<(), ConfigError> {
    let mut db_id = selection_db_id.to_string();
    let mut selector = Selector::exact("");
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "db-id" => db_id = attr.value,
            "name" => selector.name = attr.value,
            "name-is-regex" => selector.name_is_regex = parse_bool(&attr.value),
            _ => {}
        }
    }

    if db_id.is_empty() {
        return Err(ConfigError::invalid("no db-id was given in configuration"));
    }
    if selector.name.is_empty() {
        return Err(ConfigError::invalid("no db-name was given in configuration"));
    }
    archive.add_selector(&db_id, selector);
    Ok(())
}

fn read_directory(attributes: Vec<OwnedAttribute>) -> Directory {
    let mut directory = Directory::new();
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "name" => directory.name = attr.value,
            "user" => directory.user = Some(attr.value),
            "group" => directory.group = Some(attr.value),
            _ => {}
        }
    }
    directory
}

impl Configuration {
    pub const BUFFER_SIZE: usize = 32576;

    pub fn new() -> Configuration {
        Configuration {
            archives: Vec::new(),
            databases: Vec::new(),
            destinations: Vec::new(),
            encryptions: Vec::new(),
            jobs: 1,
            working_directory: PathBuf::new(),
        }
    }

    /// Reads, resolves and validates the settings file `filename`.
    pub fn load(filename: &str) -> Result<Configuration, ConfigError> {
        let real_filename = expand_home(filename);
        let file = File::open(&real_filename).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ConfigError::NotFound {
                path: real_filename.clone(),
            },
            _ => ConfigError::Io(err),
        })?;

        let mut configuration = Configuration::from_reader(file)?;
        configuration.prepare(&EnvSecretResolver)?;
        Ok(configuration)
    }

    /// Parses a settings document without resolving secrets or references.
    pub fn from_reader<R: Read>(reader: R) -> Result<Configuration, ConfigError> {
        let mut configuration = Configuration::new();
        let mut path: Vec<String> = Vec::new();
        let mut archive: Option<Archive> = None;
        let mut database: Option<Database> = None;
        let mut destination: Option<Destination> = None;
        let mut encryption: Option<Encryption> = None;
        let mut selection_db_id = String::new();

        for event in EventReader::new(BufReader::new(reader)) {
            match event? {
                XmlReaderEvent::StartElement {
                    name, attributes, ..
                } => {
                    let element = name.local_name;
                    let parent = path.last().map(String::as_str).unwrap_or_default();
                    match (parent, element.as_str()) {
                        ("", "backup-configuration") => configuration.read_root(attributes)?,
                        ("databases", "database") => match archive.as_mut() {
                            Some(archive) => read_selector(archive, attributes, &selection_db_id)?,
                            None => database = Some(read_database(attributes)?),
                        },
                        ("archive", "database") => {
                            if let Some(archive) = archive.as_mut() {
                                read_selector(archive, attributes, "")?;
                            }
                        }
                        ("archive", "databases") => {
                            selection_db_id = attributes
                                .into_iter()
                                .find(|attr| attr.name.local_name == "db-id")
                                .map(|attr| attr.value)
                                .unwrap_or_default();
                        }
                        ("destinations", "destination") | ("archive", "destination") => {
                            match archive.as_mut() {
                                Some(archive) => {
                                    for attr in attributes {
                                        if attr.name.local_name == "id" {
                                            archive.add_destination(&attr.value);
                                        }
                                    }
                                }
                                None => destination = Some(read_destination(attributes)?),
                            }
                        }
                        ("encryptions", "encryption") => {
                            encryption = Some(read_encryption(attributes));
                        }
                        ("parameters", "parameter") => {
                            if let Some(encryption) = encryption.as_mut() {
                                encryption.parameters.push(read_parameter(attributes));
                            }
                        }
                        ("decrypt-parameters", "parameter") => {
                            if let Some(encryption) = encryption.as_mut() {
                                encryption.decrypt_parameters.push(read_parameter(attributes));
                            }
                        }
                        ("archives", "archive") => archive = Some(read_archive(attributes)?),
                        ("directories", "directory") => {
                            let directory = read_directory(attributes);
                            if let Some(archive) = archive.as_mut() {
                                if !directory.name.is_empty() {
                                    archive.directories.push(directory);
                                }
                            }
                        }
                        _ => debug!("ignoring element <{}>", element),
                    }
                    path.push(element);
                }
                XmlReaderEvent::EndElement { name } => {
                    path.pop();
                    match name.local_name.as_str() {
                        "database" => {
                            if let Some(database) = database.take() {
                                configuration.add_database(database)?;
                            }
                        }
                        "destination" => {
                            if let Some(destination) = destination.take() {
                                configuration.add_destination(destination)?;
                            }
                        }
                        "encryption" => {
                            if let Some(encryption) = encryption.take() {
                                configuration.add_encryption(encryption)?;
                            }
                        }
                        "archive" => {
                            if let Some(archive) = archive.take() {
                                configuration.archives.push(archive);
                            }
                        }
                        "databases" => selection_db_id.clear(),
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if configuration.working_directory.as_os_str().is_empty() {
            return Err(ConfigError::invalid("the working-directory must be set"));
        }
        Ok(configuration)
    }

    fn read_root(&mut self, attributes: Vec<OwnedAttribute>) -> Result<(), ConfigError> {
        for attr in attributes {
            match attr.name.local_name.as_str() {
                "working-directory" => {
                    self.working_directory = PathBuf::from(expand_home(&attr.value));
                }
                "jobs" => {
                    self.jobs = attr
                        .value
                        .parse::<usize>()
                        .ok()
                        .filter(|jobs| *jobs > 0)
                        .ok_or(ConfigError::InvalidValue {
                            attribute: "jobs",
                            value: attr.value.clone(),
                        })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn add_database(&mut self, database: Database) -> Result<(), ConfigError> {
        if database.id.is_empty() {
            return Err(ConfigError::invalid("a database without id was given"));
        }
        if self.database(&database.id).is_some() {
            return Err(ConfigError::DuplicateId {
                family: "database",
                id: database.id,
            });
        }
        self.databases.push(database);
        Ok(())
    }

    fn add_destination(&mut self, destination: Destination) -> Result<(), ConfigError> {
        if destination.id.is_empty() {
            return Err(ConfigError::invalid("a destination without id was given"));
        }
        if self.destination(&destination.id).is_some() {
            return Err(ConfigError::DuplicateId {
                family: "destination",
                id: destination.id,
            });
        }
        match destination.kind {
            DestinationKind::S3 if destination.s3_bucket.is_empty() => {
                return Err(ConfigError::invalid(
                    "the destination-bucket must be set for kind: s3",
                ));
            }
            DestinationKind::SSH if destination.server.is_empty() => {
                return Err(ConfigError::invalid(
                    "the destination-server must be set for kind: ssh",
                ));
            }
            DestinationKind::Directory if destination.path.is_empty() => {
                return Err(ConfigError::invalid(
                    "the destination-path must be set for kind: directory",
                ));
            }
            _ => {}
        }
        self.destinations.push(destination);
        Ok(())
    }

    fn add_encryption(&mut self, encryption: Encryption) -> Result<(), ConfigError> {
        if encryption.id.is_empty() {
            return Err(ConfigError::invalid("an encryption without id was given"));
        }
        if self.encryption(&encryption.id).is_some() {
            return Err(ConfigError::DuplicateId {
                family: "encryption",
                id: encryption.id,
            });
        }
        self.encryptions.push(encryption);
        Ok(())
    }

    /// Resolves secrets, expands the openssl shorthand and validates the
    /// archives and every reference they make.
    pub fn prepare(&mut self, resolver: &dyn SecretResolver) -> Result<(), ConfigError> {
        self.resolve_secrets(resolver)?;
        for encryption in &mut self.encryptions {
            encryption.apply_openssl_shorthand();
            if encryption.program.is_empty() || encryption.parameters.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "encryption '{}' needs a program and parameters, or a cipher and password",
                    encryption.id
                )));
            }
        }
        self.check_archives()?;
        self.validate()?;
        Ok(())
    }

    pub fn resolve_secrets(&mut self, resolver: &dyn SecretResolver) -> Result<(), ConfigError> {
        for database in &mut self.databases {
            database.credential.resolve_secrets(resolver)?;
        }
        for destination in &mut self.destinations {
            destination.username = resolve_placeholder(&destination.username, resolver)?;
            destination.password = resolve_placeholder(&destination.password, resolver)?;
        }
        for encryption in &mut self.encryptions {
            encryption.password = resolve_placeholder(&encryption.password, resolver)?;
            let parameters = encryption
                .parameters
                .iter_mut()
                .chain(encryption.decrypt_parameters.iter_mut());
            for parameter in parameters {
                if let Some(value) = parameter.value.as_mut() {
                    *value = resolve_placeholder(value, resolver)?;
                }
            }
        }
        Ok(())
    }

    fn check_archives(&self) -> Result<(), ConfigError> {
        for archive in &self.archives {
            let name = archive.name.as_str();
            if name.is_empty() {
                return Err(ConfigError::invalid("an archive without name was given"));
            }
            archive
                .name
                .validate()
                .map_err(|err| ConfigError::invalid(err.to_string()))?;
            if archive.destinations.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "archive '{}' has no destination",
                    name
                )));
            }
            if archive.databases.is_empty() && archive.directories.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "archive '{}' selects neither databases nor directories",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Checks that every database, destination and encryption an archive
    /// refers to is declared.
    pub fn validate(&self) -> Result<(), ConfigReferenceError> {
        for archive in &self.archives {
            let dangling = |family: &'static str, id: &str| ConfigReferenceError {
                archive: archive.name.as_str().to_string(),
                family,
                id: id.to_string(),
            };

            for selection in &archive.databases {
                if self.database(&selection.db_id).is_none() {
                    return Err(dangling("database", &selection.db_id));
                }
            }
            for id in &archive.destinations {
                if self.destination(id).is_none() {
                    return Err(dangling("destination", id));
                }
            }
            if let Some(id) = &archive.encryption {
                if self.encryption(id).is_none() {
                    return Err(dangling("encryption", id));
                }
            }
        }
        Ok(())
    }

    pub fn database(&self, id: &str) -> Option<&Database> {
        self.databases.iter().find(|database| database.id == id)
    }

    pub fn destination(&self, id: &str) -> Option<&Destination> {
        self.destinations
            .iter()
            .find(|destination| destination.id == id)
    }

    pub fn encryption(&self, id: &str) -> Option<&Encryption> {
        self.encryptions
            .iter()
            .find(|encryption| encryption.id == id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SETTINGS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<backup-configuration working-directory="/var/tmp/archiver" jobs="2">
    <databases>
        <database id="main" kind="mysql" username="backup" password="[DB_PASSWORD]" port="3307"/>
        <database id="docs" kind="mongodb" tool-directory="/opt/mongodb/bin"/>
    </databases>
    <destinations>
        <destination id="local" kind="directory" path="/srv/backups" max-archive-age="30 days"/>
        <destination id="bucket" kind="s3" bucket="archives" region="storj-eu1"/>
    </destinations>
    <encryptions>
        <encryption id="aes" cipher="aes-256-cbc" password="[ENC_PASSWORD]"/>
        <encryption id="gpg" program="gpg" extension=".gpg">
            <parameters>
                <parameter longname="batch"/>
                <parameter longname="output" value="{filename}.gpg" assign-sign=" "/>
                <parameter longname="symmetric" value="{filename}" assign-sign=" "/>
            </parameters>
        </encryption>
    </encryptions>
    <archives>
        <archive name="nightly-{date:weekday}" compression="tar.gz" encryption="aes" destination="local, bucket" timeout="2h 30m">
            <databases db-id="main">
                <database name="shop"/>
                <database name="log_.*" name-is-regex="yes"/>
            </databases>
            <database db-id="docs" name="*"/>
            <directories>
                <directory name="/srv/www" user="www-data" group="www-data"/>
            </directories>
        </archive>
        <archive name="etc">
            <destination id="local"/>
            <directories>
                <directory name="/etc"/>
            </directories>
        </archive>
    </archives>
</backup-configuration>
"#;

    struct MapResolver(HashMap<&'static str, &'static str>);

    impl SecretResolver for MapResolver {
        fn resolve(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|value| value.to_string())
        }
    }

    fn resolver() -> MapResolver {
        MapResolver(HashMap::from([
            ("DB_PASSWORD", "db-secret"),
            ("ENC_PASSWORD", "enc-secret"),
        ]))
    }

    fn parse(document: &str) -> Result<Configuration, ConfigError> {
        let mut configuration = Configuration::from_reader(document.as_bytes())?;
        configuration.prepare(&resolver())?;
        Ok(configuration)
    }

    #[test]
    fn test_parse_settings() {
        let configuration = parse(SETTINGS).unwrap();

        assert_eq!(configuration.working_directory, PathBuf::from("/var/tmp/archiver"));
        assert_eq!(configuration.jobs, 2);
        assert_eq!(configuration.databases.len(), 2);
        let main = configuration.database("main").unwrap();
        assert_eq!(main.kind, DatabaseKind::MySql);
        assert_eq!(main.credential.password, "db-secret");
        assert_eq!(main.port, Some(3307));
        assert_eq!(main.tool_directory, None);
        let docs = configuration.database("docs").unwrap();
        assert_eq!(docs.tool("mongodump"), PathBuf::from("/opt/mongodb/bin/mongodump"));
        assert_eq!(
            configuration.destination("local").unwrap().max_archive_age,
            Some(Duration::from_secs(30 * 24 * 60 * 60))
        );

        let aes = configuration.encryption("aes").unwrap();
        assert_eq!(aes.program, "openssl");
        assert!(Encryption::render_arguments(&aes.parameters, std::path::Path::new("a"))
            .contains(&String::from("enc-secret")));
        let gpg = configuration.encryption("gpg").unwrap();
        assert_eq!(gpg.parameters.len(), 3);
        assert!(gpg.decrypt_parameters.is_empty());

        let nightly = &configuration.archives[0];
        assert_eq!(nightly.name.as_str(), "nightly-{date:weekday}");
        assert_eq!(nightly.compression, Compression::TarGz);
        assert_eq!(nightly.encryption.as_deref(), Some("aes"));
        assert_eq!(nightly.destinations, vec!["local", "bucket"]);
        assert_eq!(nightly.timeout, Some(Duration::from_secs(9000)));
        assert_eq!(nightly.databases.len(), 2);
        assert_eq!(nightly.databases[0].db_id, "main");
        assert_eq!(
            nightly.databases[0].selectors,
            vec![Selector::exact("shop"), Selector::regex("log_.*")]
        );
        assert_eq!(nightly.databases[1].selectors, vec![Selector::exact("*")]);
        assert_eq!(nightly.directories[0].user.as_deref(), Some("www-data"));

        let etc = &configuration.archives[1];
        assert_eq!(etc.compression, Compression::TarBZ2);
        assert_eq!(etc.destinations, vec!["local"]);
        assert_eq!(etc.encryption, None);
    }

    #[test]
    fn test_dangling_reference_is_reported() {
        let document = SETTINGS.replace("destination=\"local, bucket\"", "destination=\"local, tape\"");
        let err = parse(&document).unwrap_err();
        match err {
            ConfigError::Reference(reference) => {
                assert_eq!(reference.archive, "nightly-{date:weekday}");
                assert_eq!(reference.family, "destination");
                assert_eq!(reference.id, "tape");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_left_to_the_registry() {
        let document = SETTINGS.replace("kind=\"mongodb\"", "kind=\"oracle\"");
        let configuration = parse(&document).unwrap();
        let docs = configuration.database("docs").unwrap();
        assert_eq!(docs.kind, DatabaseKind::Other(String::from("oracle")));

        let err = crate::registry::Registry::default()
            .build(&configuration)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            crate::error::RunError::UnknownKind { family: "database", kind } if kind == "oracle"
        ));
    }

    #[test]
    fn test_empty_kind_is_rejected() {
        let document = SETTINGS.replace("kind=\"mongodb\"", "kind=\"\"");
        assert!(matches!(
            Configuration::from_reader(document.as_bytes()),
            Err(ConfigError::InvalidValue { attribute: "database kind", .. })
        ));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let document = SETTINGS.replace("id=\"docs\"", "id=\"main\"");
        assert!(matches!(
            Configuration::from_reader(document.as_bytes()),
            Err(ConfigError::DuplicateId { family: "database", .. })
        ));
    }

    #[test]
    fn test_unresolved_secret_is_rejected() {
        let mut configuration = Configuration::from_reader(SETTINGS.as_bytes()).unwrap();
        let err = configuration
            .prepare(&MapResolver(HashMap::new()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedSecret { .. }));
    }

    #[test]
    fn test_archive_without_sources_is_rejected() {
        let document = SETTINGS.replace(
            "<directories>\n                <directory name=\"/etc\"/>\n            </directories>",
            "",
        );
        assert!(matches!(parse(&document), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_unknown_placeholder_is_rejected() {
        let document = SETTINGS.replace("name=\"etc\"", "name=\"etc-{date:century}\"");
        assert!(matches!(parse(&document), Err(ConfigError::Invalid { .. })));
    }
}
