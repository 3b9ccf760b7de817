//! Server log capture: reading and resetting between test cases.
//!
//! The logging collector writes a primary log file plus rotated
//! per-session files under `pg_log/` in the data directory. Tests want
//! two things from them: one concatenated text stream, and a cheap way
//! to reset to an empty diagnostic window without restarting the server.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Glob matching the collector's rotated log files.
const ROTATED_PATTERN: &str = "postgresql-*.log";

/// The growable, append-only log state of one running instance.
#[derive(Debug, Clone)]
pub struct LogArchive {
    /// Primary log file (`pg_ctl -l` target).
    primary: PathBuf,
    /// Directory of rotated per-session files.
    rotated_dir: PathBuf,
}

impl LogArchive {
    #[must_use]
    pub fn new(primary: PathBuf, rotated_dir: PathBuf) -> Self {
        Self {
            primary,
            rotated_dir,
        }
    }

    /// Concatenate the primary file and all rotated files into one blob.
    ///
    /// Rotated files are sorted by name so ordering is deterministic.
    /// Missing files and directories read as empty.
    pub fn read(&self) -> Result<String> {
        let mut chunks = String::new();
        if self.primary.exists() {
            chunks.push_str(&read_file(&self.primary)?);
        }
        for path in self.rotated_files()? {
            chunks.push_str(&read_file(&path)?);
        }
        Ok(chunks)
    }

    /// Empty the primary log in place and delete rotated files.
    ///
    /// Used between independent test cases; the server keeps its open
    /// handle on the primary file, so it is truncated rather than
    /// removed. Already-missing paths are success.
    pub fn truncate(&self) -> Result<()> {
        if self.primary.exists() {
            fs::write(&self.primary, "").map_err(|e| {
                Error::io(format!("truncating log {}", self.primary.display()), e)
            })?;
        }
        for path in self.rotated_files()? {
            fs::remove_file(&path)
                .map_err(|e| Error::io(format!("removing rotated log {}", path.display()), e))?;
        }
        Ok(())
    }

    /// Rotated log files, sorted by name.
    fn rotated_files(&self) -> Result<Vec<PathBuf>> {
        if !self.rotated_dir.exists() {
            return Ok(Vec::new());
        }
        let pattern = self.rotated_dir.join(ROTATED_PATTERN);
        let pattern = pattern.to_string_lossy();
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| {
                Error::io(
                    format!("bad log glob {pattern}"),
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
                )
            })?
            .filter_map(std::result::Result::ok)
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(format!("reading log {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(dir: &std::path::Path) -> LogArchive {
        LogArchive::new(dir.join("postgres.log"), dir.join("pg_log"))
    }

    #[test]
    fn test_read_missing_everything_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(archive(dir.path()).read().unwrap(), "");
    }

    #[test]
    fn test_read_concatenates_primary_and_rotated_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let logs = archive(dir.path());
        fs::write(dir.path().join("postgres.log"), "primary\n").unwrap();
        let rotated = dir.path().join("pg_log");
        fs::create_dir_all(&rotated).unwrap();
        fs::write(rotated.join("postgresql-2.log"), "two\n").unwrap();
        fs::write(rotated.join("postgresql-1.log"), "one\n").unwrap();
        fs::write(rotated.join("unrelated.txt"), "noise\n").unwrap();

        assert_eq!(logs.read().unwrap(), "primary\none\ntwo\n");
    }

    #[test]
    fn test_truncate_then_read_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let logs = archive(dir.path());
        fs::write(dir.path().join("postgres.log"), "old noise\n").unwrap();
        let rotated = dir.path().join("pg_log");
        fs::create_dir_all(&rotated).unwrap();
        fs::write(rotated.join("postgresql-1.log"), "rotated noise\n").unwrap();

        logs.truncate().unwrap();
        assert_eq!(logs.read().unwrap(), "");
        // Primary stays in place (the server holds an open handle).
        assert!(dir.path().join("postgres.log").exists());
        assert!(!rotated.join("postgresql-1.log").exists());
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let logs = archive(dir.path());
        logs.truncate().unwrap();
        logs.truncate().unwrap();
    }

    #[test]
    fn test_new_entries_appear_after_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let logs = archive(dir.path());
        fs::write(dir.path().join("postgres.log"), "old\n").unwrap();
        logs.truncate().unwrap();
        fs::write(dir.path().join("postgres.log"), "fresh entry\n").unwrap();
        assert_eq!(logs.read().unwrap(), "fresh entry\n");
    }
}
