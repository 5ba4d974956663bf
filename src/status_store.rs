// ============================================================================
// KNOWN CACHE STATUSES
// ============================================================================
// Every cache status any run has seen, one per line. Seeding these at
// startup keeps each squid_cache_status_total series present from the first
// scrape after a restart, before traffic with that status comes back.
// ============================================================================

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::persist::{atomic_write, RetryPolicy};

/// Sorted set of cache statuses backed by a newline-separated file
#[derive(Debug)]
pub struct KnownStatuses {
    path: PathBuf,
    statuses: BTreeSet<String>,
    retry: RetryPolicy,
    unsaved: bool,
}

impl KnownStatuses {
    /// Read the file at `path`. A missing file is an empty set.
    pub fn load(path: impl Into<PathBuf>, retry: RetryPolicy) -> io::Result<Self> {
        let path = path.into();
        let statuses = match fs::read_to_string(&path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e),
        };

        debug!(
            target: "squid_exporter::status_store",
            path = %path.display(),
            count = statuses.len(),
            "Loaded known cache statuses"
        );

        Ok(Self {
            path,
            statuses,
            retry,
            unsaved: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.statuses.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Add statuses, returning how many were new
    pub fn extend<'a>(&mut self, statuses: impl IntoIterator<Item = &'a str>) -> usize {
        let added = statuses
            .into_iter()
            .filter(|s| self.statuses.insert(s.to_string()))
            .count();
        if added > 0 {
            self.unsaved = true;
        }
        added
    }

    /// Write the set if it changed since the last successful save.
    /// Returns whether a write happened.
    pub fn save(&mut self) -> io::Result<bool> {
        if !self.unsaved {
            return Ok(false);
        }

        let mut contents = String::new();
        for status in &self.statuses {
            contents.push_str(status);
            contents.push('\n');
        }
        self.retry
            .run("save_known_statuses", || atomic_write(&self.path, contents.as_bytes()))?;

        self.unsaved = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownStatuses::load(dir.path().join("known"), RetryPolicy::once()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_and_reload_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("known");

        let mut store = KnownStatuses::load(&path, RetryPolicy::once()).unwrap();
        assert_eq!(store.extend(["TCP_MISS", "TCP_HIT", "TCP_MISS"]), 2);
        assert!(store.save().unwrap());
        assert!(!store.save().unwrap());

        assert_eq!(fs::read_to_string(&path).unwrap(), "TCP_HIT\nTCP_MISS\n");
        let reloaded = KnownStatuses::load(&path, RetryPolicy::once()).unwrap();
        assert_eq!(reloaded.iter().collect::<Vec<_>>(), vec!["TCP_HIT", "TCP_MISS"]);
    }

    #[test]
    fn test_blank_lines_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known");
        fs::write(&path, "TCP_DENIED\n\n  \nNONE\n").unwrap();

        let store = KnownStatuses::load(&path, RetryPolicy::once()).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_failed_save_is_retried_next_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known");
        fs::create_dir(&path).unwrap();

        let mut store = KnownStatuses::load(dir.path().join("other"), RetryPolicy::once()).unwrap();
        store.path = path.clone();
        store.extend(["TCP_HIT"]);
        assert!(store.save().is_err());

        fs::remove_dir(&path).unwrap();
        assert!(store.save().unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "TCP_HIT\n");
    }
}
