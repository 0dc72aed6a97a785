use std::env;

use regex::Regex;

use crate::error::ConfigError;

#[derive(Clone, Debug, Default)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new() -> Credential {
        Credential::default()
    }

    pub fn resolve_secrets(&mut self, resolver: &dyn SecretResolver) -> Result<(), ConfigError> {
        self.username = resolve_placeholder(&self.username, resolver)?;
        self.password = resolve_placeholder(&self.password, resolver)?;
        Ok(())
    }
}

/// Turns `[NAME]` placeholders of the configuration into real secrets.
pub trait SecretResolver {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Looks secrets up in the process environment, `[DB_PASSWORD]` reads `$DB_PASSWORD`.
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

/// Values that are not exactly one `[NAME]` placeholder are returned unchanged.
pub fn resolve_placeholder(value: &str, resolver: &dyn SecretResolver) -> Result<String, ConfigError> {
    lazy_static! {
        static ref REGEX_SECRET: Regex = Regex::new(r"^\[([A-Za-z0-9_.\-]+)\]$").unwrap();
    }

    match REGEX_SECRET.captures(value) {
        Some(caps) => {
            let name = &caps[1];
            resolver
                .resolve(name)
                .ok_or_else(|| ConfigError::UnresolvedSecret {
                    name: name.to_string(),
                })
        }
        None => Ok(value.to_string()),
    }
}
