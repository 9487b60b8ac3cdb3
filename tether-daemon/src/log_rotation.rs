//! Size-based rotation of the daemon log.
//!
//! `daemon.log` rolls to `daemon.log.1`, older copies shift up by one and
//! anything beyond the retention count is deleted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// How large the live log may grow and how many rolled copies are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for RotationPolicy {
    /// 10 MiB, five copies.
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

impl RotationPolicy {
    /// Roll `log` if it has reached `max_bytes`. Returns whether it rolled.
    /// A log that does not exist yet is left alone.
    pub fn rotate(&self, log: &Path) -> io::Result<bool> {
        let size = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes || self.keep == 0 {
            return Ok(false);
        }

        remove_if_present(&rolled(log, self.keep))?;
        for n in (1..self.keep).rev() {
            let from = rolled(log, n);
            if from.exists() {
                fs::rename(&from, rolled(log, n + 1))?;
            }
        }
        fs::rename(log, rolled(log, 1))?;
        fs::File::create(log)?;
        Ok(true)
    }
}

/// Rotation pass run by the daemon's housekeeping task. Failures are logged.
pub fn rotate_logs(home: &Path) {
    let log = crate::paths::log_path(home);
    match RotationPolicy::default().rotate(&log) {
        Ok(true) => tracing::info!(path = %log.display(), "log file rotated"),
        Ok(false) => {}
        Err(err) => tracing::warn!(path = %log.display(), error = %err, "log rotation failed"),
    }
}

/// `daemon.log` + 2 -> `daemon.log.2`
fn rolled(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const SMALL: RotationPolicy = RotationPolicy {
        max_bytes: 64,
        keep: 3,
    };

    fn write(path: &Path, bytes: usize, fill: u8) {
        fs::write(path, vec![fill; bytes]).unwrap();
    }

    #[test]
    fn small_log_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write(&log, 10, b'a');
        assert!(!SMALL.rotate(&log).unwrap());
        assert!(!rolled(&log, 1).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(!SMALL.rotate(&dir.path().join("daemon.log")).unwrap());
    }

    #[test]
    fn oversized_log_rolls_and_restarts_empty() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        write(&log, 100, b'a');
        assert!(SMALL.rotate(&log).unwrap());
        assert_eq!(fs::metadata(&log).unwrap().len(), 0);
        assert_eq!(fs::read(rolled(&log, 1)).unwrap(), vec![b'a'; 100]);
    }

    #[test]
    fn retention_drops_the_oldest_copy() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("daemon.log");
        for (round, fill) in [b'1', b'2', b'3', b'4', b'5'].into_iter().enumerate() {
            write(&log, 100 + round, fill);
            SMALL.rotate(&log).unwrap();
        }
        assert_eq!(fs::read(rolled(&log, 1)).unwrap()[0], b'5');
        assert_eq!(fs::read(rolled(&log, 3)).unwrap()[0], b'3');
        assert!(!rolled(&log, 4).exists());
    }

    #[test]
    fn default_policy_is_ten_mib_five_copies() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.max_bytes, 10 * 1024 * 1024);
        assert_eq!(policy.keep, 5);
    }
}
