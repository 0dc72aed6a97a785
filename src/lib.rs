#[macro_use]
extern crate lazy_static;

pub mod backup;
pub mod configuration;
pub mod destination;
pub mod encryptor;
pub mod error;
pub mod formatter;
pub mod helper;
pub mod registry;
pub mod restore;
pub mod source;
pub mod template;

#[cfg(test)]
mod testing;

pub use backup::{Backup, RunReport};
pub use configuration::Configuration;
pub use helper::process::Cancellation;
pub use registry::Registry;
pub use restore::{Restore, RestoreReport};
