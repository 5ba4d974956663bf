// ============================================================================
// POSITION TRACKER
// ============================================================================
// Remembers how far into the access log the last pass got, so a restart
// resumes instead of re-counting. Rotation is detected by inode change,
// truncation by the stored offset running past the end of the file.
// ============================================================================

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PositionError, PositionResult};
use crate::persist::{atomic_write, RetryPolicy};

// ----------------------------------------------------------------------------
// Persisted Record
// ----------------------------------------------------------------------------

/// The persisted resume point for one log file.
///
/// Field names on disk are `filename`, `position`, `inode` and
/// `last_updated`, so existing position files keep working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub filename: String,
    #[serde(rename = "position")]
    pub offset: u64,
    pub inode: u64,
    #[serde(rename = "last_updated")]
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(filename: impl Into<String>, offset: u64, inode: u64) -> Self {
        Self {
            filename: filename.into(),
            offset,
            inode,
            updated_at: Utc::now(),
        }
    }
}

/// Inode of an open file, 0 where the platform has no such concept.
pub fn file_inode(meta: &Metadata) -> u64 {
    #[cfg(unix)]
    {
        std::os::unix::fs::MetadataExt::ino(meta)
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0
    }
}

// ----------------------------------------------------------------------------
// Resume Decision
// ----------------------------------------------------------------------------

/// Why a pass starts where it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeReason {
    /// No position recorded yet
    Fresh,
    /// Continuing from the stored offset
    Resumed,
    /// The file at the path has a new inode
    Rotated,
    /// The file shrank below the stored offset
    Truncated,
    /// The stored position belongs to another log file
    FileChanged,
}

impl ResumeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeReason::Fresh => "fresh",
            ResumeReason::Resumed => "resumed",
            ResumeReason::Rotated => "rotated",
            ResumeReason::Truncated => "truncated",
            ResumeReason::FileChanged => "file_changed",
        }
    }
}

/// Where the next scan starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub offset: u64,
    pub reason: ResumeReason,
}

impl ResumePoint {
    /// Decide the starting offset from the stored position and what the
    /// opened file looks like now.
    pub fn resolve(stored: Option<&Position>, filename: &str, inode: u64, file_len: u64) -> Self {
        let reason = match stored {
            None => ResumeReason::Fresh,
            Some(pos) if pos.filename != filename => ResumeReason::FileChanged,
            Some(pos) if pos.inode != 0 && inode != 0 && pos.inode != inode => ResumeReason::Rotated,
            Some(pos) if pos.offset > file_len => ResumeReason::Truncated,
            Some(_) => ResumeReason::Resumed,
        };

        let offset = match (reason, stored) {
            (ResumeReason::Resumed, Some(pos)) => pos.offset,
            _ => 0,
        };

        Self { offset, reason }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self.reason, ResumeReason::Rotated | ResumeReason::Truncated)
    }
}

// ----------------------------------------------------------------------------
// Tracker
// ----------------------------------------------------------------------------

/// Owns the position file.
///
/// A failed save keeps the new position in memory and marks the tracker
/// dirty; until a later save succeeds, `load` returns the in-memory copy
/// rather than the stale one on disk.
#[derive(Debug)]
pub struct PositionTracker {
    path: PathBuf,
    current: Option<Position>,
    dirty: bool,
    retry: RetryPolicy,
}

impl PositionTracker {
    pub fn new(path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            current: None,
            dirty: false,
            retry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored position. A missing file means no position yet.
    pub fn load(&mut self) -> PositionResult<Option<Position>> {
        if self.dirty {
            debug!(
                target: "squid_exporter::position",
                path = %self.path.display(),
                "Using in-memory position, last save did not reach disk"
            );
            return Ok(self.current.clone());
        }

        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.current = None;
                return Ok(None);
            }
            Err(source) => {
                return Err(PositionError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let position: Position =
            serde_json::from_slice(&raw).map_err(|e| PositionError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;

        self.current = Some(position.clone());
        Ok(Some(position))
    }

    /// Single-attempt save, used for periodic checkpoints.
    pub fn save(&mut self, filename: &str, offset: u64, inode: u64) -> PositionResult<()> {
        self.persist(Position::new(filename, offset, inode), RetryPolicy::once())
    }

    /// Save with the configured retry policy, used at the end of a pass.
    pub fn save_with_retry(&mut self, filename: &str, offset: u64, inode: u64) -> PositionResult<()> {
        let retry = self.retry;
        self.persist(Position::new(filename, offset, inode), retry)
    }

    fn persist(&mut self, position: Position, retry: RetryPolicy) -> PositionResult<()> {
        let encoded = serde_json::to_vec_pretty(&position).map_err(|e| PositionError::Write {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        self.current = Some(position);
        let result = retry.run("save_position", || atomic_write(&self.path, &encoded));

        match result {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(source) => {
                self.dirty = true;
                warn!(
                    target: "squid_exporter::position",
                    path = %self.path.display(),
                    error = %source,
                    "Position kept in memory only"
                );
                Err(PositionError::Write {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }

    pub fn current_offset(&self) -> u64 {
        self.current.as_ref().map_or(0, |p| p.offset)
    }

    pub fn current_inode(&self) -> u64 {
        self.current.as_ref().map_or(0, |p| p.inode)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::time::Duration;

    fn stored(offset: u64, inode: u64) -> Position {
        Position::new("/var/log/squid/access.log", offset, inode)
    }

    #[test]
    fn test_load_missing_file_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = PositionTracker::new(dir.path().join("position.json"), RetryPolicy::once());

        assert_eq!(tracker.load().unwrap(), None);
        assert_eq!(tracker.current_offset(), 0);
        assert_eq!(tracker.current_inode(), 0);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position.json");
        let mut tracker = PositionTracker::new(&path, RetryPolicy::once());
        tracker.save("/var/log/squid/access.log", 4096, 77).unwrap();

        let mut reopened = PositionTracker::new(&path, RetryPolicy::once());
        let position = reopened.load().unwrap().unwrap();
        assert_eq!(position.offset, 4096);
        assert_eq!(position.inode, 77);
        assert_eq!(reopened.current_offset(), 4096);
        assert_eq!(reopened.current_inode(), 77);
    }

    #[test]
    fn test_reads_legacy_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position.json");
        fs::write(
            &path,
            r#"{"filename":"/var/log/squid/access.log","position":123,"inode":9,"last_updated":"2024-01-02T03:04:05Z"}"#,
        )
        .unwrap();

        let mut tracker = PositionTracker::new(&path, RetryPolicy::once());
        let position = tracker.load().unwrap().unwrap();
        assert_eq!(position.offset, 123);
        assert_eq!(position.inode, 9);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position.json");
        fs::write(&path, b"{not json").unwrap();

        let mut tracker = PositionTracker::new(&path, RetryPolicy::once());
        assert!(matches!(tracker.load(), Err(PositionError::Corrupt { .. })));
    }

    #[test]
    fn test_failed_save_keeps_position_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the file makes every rename fail
        let path = dir.path().join("position.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("blocker"), b"x").unwrap();

        let mut tracker = PositionTracker::new(&path, RetryPolicy::new(2, Duration::ZERO));
        assert!(tracker.save_with_retry("access.log", 900, 5).is_err());
        assert!(tracker.is_dirty());

        let position = tracker.load().unwrap().unwrap();
        assert_eq!(position.offset, 900);
        assert_eq!(position.inode, 5);
    }

    #[rstest]
    #[case::first_run(None, 42, 1000, 0, ResumeReason::Fresh)]
    #[case::same_file(Some(stored(500, 42)), 42, 1000, 500, ResumeReason::Resumed)]
    #[case::at_end_of_file(Some(stored(1000, 42)), 42, 1000, 1000, ResumeReason::Resumed)]
    #[case::rotated(Some(stored(500, 42)), 43, 1000, 0, ResumeReason::Rotated)]
    #[case::truncated(Some(stored(500, 42)), 42, 100, 0, ResumeReason::Truncated)]
    #[case::legacy_zero_inode(Some(stored(500, 0)), 43, 1000, 500, ResumeReason::Resumed)]
    fn test_resume_point(
        #[case] position: Option<Position>,
        #[case] inode: u64,
        #[case] file_len: u64,
        #[case] offset: u64,
        #[case] reason: ResumeReason,
    ) {
        let point = ResumePoint::resolve(position.as_ref(), "/var/log/squid/access.log", inode, file_len);
        assert_eq!(point, ResumePoint { offset, reason });
    }

    #[test]
    fn test_resume_point_other_file_starts_over() {
        let position = Position::new("/var/log/squid/old.log", 500, 42);
        let point = ResumePoint::resolve(Some(&position), "/var/log/squid/access.log", 42, 1000);
        assert_eq!(point.offset, 0);
        assert_eq!(point.reason, ResumeReason::FileChanged);
        assert!(!point.is_reset());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_inode_changes_on_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(&path, b"a\n").unwrap();
        let first = file_inode(&fs::metadata(&path).unwrap());

        let rotated = dir.path().join("access.log.1");
        fs::rename(&path, &rotated).unwrap();
        fs::write(&path, b"b\n").unwrap();
        let second = file_inode(&fs::metadata(&path).unwrap());

        assert_ne!(first, 0);
        assert_ne!(first, second);
    }
}
