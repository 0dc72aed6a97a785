//! Destination adapters durably store a finished archive.
//!
//! Every adapter makes the final object appear atomically: it writes under a
//! temporary name, verifies the stored size and only then exposes the final
//! name. `retrieve_latest` is the restore counterpart.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::DeliveryError;

pub mod directory;
pub mod s3;
pub mod ssh;

pub use directory::DirectoryDestination;
pub use s3::S3Destination;
pub use ssh::SshDestination;

/// Receipt of one successful delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub destination: String,
    /// Where the object ended up, e.g. a path or an `s3://` url.
    pub location: String,
    pub size: u64,
}

#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Stores `file` under `object_name`. Either the complete object becomes
    /// visible under that name or nothing does.
    async fn deliver(&self, file: &Path, object_name: &str) -> Result<Delivery, DeliveryError>;

    /// Downloads the newest stored object whose name starts with `prefix`
    /// and ends with `suffix` into `target_dir`.
    async fn retrieve_latest(
        &self,
        prefix: &str,
        suffix: &str,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>, DeliveryError>;
}

/// Whether a stored object `name` could have been produced by an archive
/// with this literal `prefix` and extension `suffix`.
pub fn is_candidate(name: &str, prefix: &str, suffix: &str) -> bool {
    !name.starts_with('.')
        && name.len() >= prefix.len() + suffix.len()
        && name.starts_with(prefix)
        && name.ends_with(suffix)
}

/// The name with the newest modification stamp, ties broken by name.
pub fn pick_newest<T: Ord>(candidates: Vec<(String, T)>) -> Option<String> {
    candidates
        .into_iter()
        .max_by(|(left_name, left), (right_name, right)| {
            left.cmp(right).then_with(|| left_name.cmp(right_name))
        })
        .map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_candidate() {
        assert!(is_candidate("nightly-2024-05-01.tar.bz2", "nightly-", ".tar.bz2"));
        assert!(!is_candidate("nightly-2024-05-01.tar.bz2.enc", "nightly-", ".tar.bz2"));
        assert!(!is_candidate("weekly-2024-05-01.tar.bz2", "nightly-", ".tar.bz2"));
        assert!(!is_candidate(".nightly-2024.tar.bz2.part", "", ".tar.bz2"));
        assert!(is_candidate("etc.tar.bz2", "etc", ".tar.bz2"));
        assert!(!is_candidate("etc.tar.bz2", "etc.tar", ".bz2.enc"));
    }

    #[test]
    fn test_pick_newest() {
        let candidates = vec![
            (String::from("a-Mon.tar"), 10),
            (String::from("a-Wed.tar"), 30),
            (String::from("a-Tue.tar"), 20),
        ];
        assert_eq!(pick_newest(candidates), Some(String::from("a-Wed.tar")));

        let tie = vec![(String::from("b"), 1), (String::from("c"), 1)];
        assert_eq!(pick_newest(tie), Some(String::from("c")));

        assert_eq!(pick_newest::<u64>(Vec::new()), None);
    }
}
