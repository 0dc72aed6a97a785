use std::str::FromStr;
use std::time::Duration;

use rusoto_core::Region;

use crate::error::ConfigError;

#[derive(Clone, Debug)]
pub struct Destination {
    pub kind: Kind,
    pub id: String,
    /// Accepted for compatibility with older configurations. Archives are never pruned.
    pub max_archive_age: Option<Duration>,
    pub password: String,
    pub path: String,
    pub port: u16,
    pub s3_bucket: String,
    pub s3_region: Region,
    pub server: String,
    pub username: String,
}

impl Destination {
    pub fn new() -> Destination {
        Destination {
            kind: Kind::Directory,
            id: String::new(),
            max_archive_age: None,
            password: String::new(),
            path: String::new(),
            port: 22,
            s3_bucket: String::new(),
            s3_region: Region::EuCentral1,
            server: String::new(),
            username: String::new(),
        }
    }

    pub fn parse_region(value: &str) -> Result<Region, ConfigError> {
        match value {
            "storj-eu1" => Ok(Region::Custom {
                name: "StorjEu1".to_string(),
                endpoint: "https://gateway.storjshare.io".to_string(),
            }),
            region => Region::from_str(region).map_err(|_| ConfigError::InvalidValue {
                attribute: "destination region",
                value: region.to_string(),
            }),
        }
    }
}

/// Kinds without a built-in variant are kept verbatim for the adapter registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Directory,
    S3,
    SSH,
    Other(String),
}

impl Kind {
    pub fn as_str(&self) -> &str {
        match self {
            Kind::Directory => "directory",
            Kind::S3 => "s3",
            Kind::SSH => "ssh",
            Kind::Other(kind) => kind,
        }
    }
}

impl FromStr for Kind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "directory" => Ok(Kind::Directory),
            "s3" => Ok(Kind::S3),
            "ssh" => Ok(Kind::SSH),
            "" => Err(ConfigError::InvalidValue {
                attribute: "destination kind",
                value: String::new(),
            }),
            kind => Ok(Kind::Other(kind.to_string())),
        }
    }
}
