// ============================================================================
// PERSISTENCE LAYER
// ============================================================================
// Durable writes for the files this process owns: the position record, the
// known cache statuses and the optional metrics textfile. Readers never
// observe a partial file. Reads and writes alike retry on a fixed delay.
// ============================================================================

use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::constants::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};

// ----------------------------------------------------------------------------
// Atomic Replace
// ----------------------------------------------------------------------------

/// Replace `path` with `contents` atomically.
///
/// The data goes to a temporary file in the destination's directory, is
/// flushed to disk, and is then renamed over the destination. The rename is
/// only atomic when both names live on the same filesystem, which is why the
/// temporary file is never placed in a system temp directory.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir)?;

    let tmp = temp_path(path)?;
    if let Err(e) = write_then_rename(&tmp, path, contents) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    sync_dir(&dir);
    Ok(())
}

fn write_then_rename(tmp: &Path, dest: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, dest)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn temp_path(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let tmp_name = format!(".{}.{}.tmp", name.to_string_lossy(), std::process::id());
    Ok(parent_dir(path).join(tmp_name))
}

/// Persist the rename itself. Best effort: not every platform lets a
/// directory be opened for syncing.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

// ----------------------------------------------------------------------------
// Bounded Retry
// ----------------------------------------------------------------------------

/// Fixed-delay retry for transient I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// A policy that tries exactly once
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds or the attempts are exhausted, sleeping
    /// between attempts. Blocks the calling thread, so callers on the async
    /// runtime must be on the blocking pool.
    pub fn run<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(
                        target: "squid_exporter::persist",
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");

        atomic_write(&path, b"squid_connections_total 1\n").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["metrics.prom".to_string()]);
    }

    #[test]
    fn test_atomic_write_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("position.json");

        atomic_write(&path, b"{}").unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_atomic_write_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        // Destination is a non-empty directory, so the rename must fail
        let dest = dir.path().join("occupied");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("file"), b"x").unwrap();

        assert!(atomic_write(&dest, b"data").is_err());

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut calls = 0;

        let result: Result<u32, String> = policy.run("test", || {
            calls += 1;
            if calls < 3 {
                Err("busy".to_string())
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_retry_gives_up_after_attempts() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let mut calls = 0;

        let result: Result<(), String> = policy.run("test", || {
            calls += 1;
            Err(format!("failure {}", calls))
        });

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_retry_zero_attempts_still_tries_once() {
        let policy = RetryPolicy {
            attempts: 0,
            delay: Duration::ZERO,
        };
        let mut calls = 0;
        let _: Result<(), &str> = policy.run("test", || {
            calls += 1;
            Err("nope")
        });
        assert_eq!(calls, 1);
    }
}
