//! Disk headroom enforcement for the results volume.
//!
//! Before anything is written below the results directory, the reclaimer
//! checks that a fixed amount of space is still available. If not, it deletes
//! whole query directories, oldest modification time first, until the headroom
//! is restored. Directories of queries that are still running are never
//! evicted.
//!
//! Free space is measured through the [`SpaceProbe`] trait so callers can
//! substitute their own accounting.

use crate::error::{Result, SiftError};
use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Reports available bytes on the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by the filesystem's own statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Outcome of a headroom check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Bytes available after the check
    pub available: u64,

    /// Query directories removed to get there, oldest first
    pub removed: Vec<PathBuf>,
}

/// Keeps the results volume above its headroom threshold.
pub struct SpaceReclaimer {
    root: PathBuf,
    headroom: u64,
    probe: Arc<dyn SpaceProbe>,
    in_use: DashMap<String, usize>,
}

impl std::fmt::Debug for SpaceReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceReclaimer")
            .field("root", &self.root)
            .field("headroom", &self.headroom)
            .field("in_use", &self.in_use.len())
            .finish()
    }
}

impl SpaceReclaimer {
    /// Create a reclaimer for the query directories below `root`.
    pub fn new(root: impl AsRef<Path>, headroom: u64) -> Self {
        SpaceReclaimer {
            root: root.as_ref().to_path_buf(),
            headroom,
            probe: Arc::new(FsSpaceProbe),
            in_use: DashMap::new(),
        }
    }

    /// Use a different way of measuring free space.
    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn headroom(&self) -> u64 {
        self.headroom
    }

    /// Protect a query directory from eviction. Calls nest.
    pub fn mark_in_use(&self, name: &str) {
        *self.in_use.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Undo one [`SpaceReclaimer::mark_in_use`].
    pub fn release(&self, name: &str) {
        self.in_use.remove_if_mut(name, |_, count| {
            *count -= 1;
            *count == 0
        });
    }

    pub fn is_in_use(&self, name: &str) -> bool {
        self.in_use.contains_key(name)
    }

    fn available(&self) -> Result<u64> {
        let available = self.probe.available_bytes(&self.root)?;
        debug!(path = %self.root.display(), available, "Available bytes on results volume");
        Ok(available)
    }

    /// Make sure the headroom is available, evicting old query directories
    /// if needed.
    ///
    /// Fails with [`SiftError::SpaceExhausted`] if every evictable directory
    /// is gone and there is still not enough space.
    pub fn ensure_headroom(&self) -> Result<ReclaimReport> {
        fs::create_dir_all(&self.root)?;

        let mut report = ReclaimReport {
            available: self.available()?,
            removed: Vec::new(),
        };
        if report.available >= self.headroom {
            return Ok(report);
        }

        info!(
            path = %self.root.display(),
            available = report.available,
            headroom = self.headroom,
            "Not enough headroom, deleting old query results"
        );

        for dir in self.eviction_candidates()? {
            info!(path = %dir.display(), "Removing query results to make space");
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %e, "Could not remove query results");
                continue;
            }
            report.removed.push(dir);

            report.available = self.available()?;
            if report.available >= self.headroom {
                return Ok(report);
            }
        }

        Err(SiftError::SpaceExhausted {
            path: self.root.clone(),
            available: report.available,
            headroom: self.headroom,
        })
    }

    /// Query directories not in use, oldest modification time first.
    fn eviction_candidates(&self) -> Result<Vec<PathBuf>> {
        let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_dir() {
                continue;
            }
            if self.is_in_use(&entry.file_name().to_string_lossy()) {
                debug!(path = %entry.path().display(), "Skipping running query");
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, entry.path()));
        }
        candidates.sort();
        Ok(candidates.into_iter().map(|(_, path)| path).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Pretends every existing query directory occupies `per_dir` bytes of
    /// a volume with `capacity` bytes.
    struct DirCountProbe {
        capacity: u64,
        per_dir: u64,
    }

    impl SpaceProbe for DirCountProbe {
        fn available_bytes(&self, path: &Path) -> io::Result<u64> {
            let dirs = fs::read_dir(path)?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .count() as u64;
            Ok(self.capacity.saturating_sub(dirs * self.per_dir))
        }
    }

    fn probe(capacity: u64, per_dir: u64) -> Arc<DirCountProbe> {
        Arc::new(DirCountProbe { capacity, per_dir })
    }

    fn make_dirs(root: &Path, names: &[&str]) {
        for name in names {
            fs::create_dir_all(root.join(name)).unwrap();
            fs::write(root.join(name).join("page_0.json"), b"[]").unwrap();
            // Distinct modification times
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_enough_space_removes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        make_dirs(temp_dir.path(), &["old", "new"]);

        let reclaimer = SpaceReclaimer::new(temp_dir.path(), 10).with_probe(probe(100, 10));
        let report = reclaimer.ensure_headroom().unwrap();
        assert!(report.removed.is_empty());
        assert!(temp_dir.path().join("old").exists());
    }

    #[test]
    fn test_evicts_oldest_first_until_headroom() {
        let temp_dir = TempDir::new().unwrap();
        make_dirs(temp_dir.path(), &["first", "second", "third"]);

        // 3 dirs * 30 = 90 used, 10 available; need 50 -> remove two.
        let reclaimer = SpaceReclaimer::new(temp_dir.path(), 50).with_probe(probe(100, 30));
        let report = reclaimer.ensure_headroom().unwrap();

        assert_eq!(
            report.removed,
            vec![temp_dir.path().join("first"), temp_dir.path().join("second")]
        );
        assert_eq!(report.available, 70);
        assert!(temp_dir.path().join("third").exists());
    }

    #[test]
    fn test_skips_directories_in_use() {
        let temp_dir = TempDir::new().unwrap();
        make_dirs(temp_dir.path(), &["running", "finished"]);

        let reclaimer = SpaceReclaimer::new(temp_dir.path(), 70).with_probe(probe(100, 30));
        reclaimer.mark_in_use("running");
        let report = reclaimer.ensure_headroom().unwrap();

        assert_eq!(report.removed, vec![temp_dir.path().join("finished")]);
        assert!(temp_dir.path().join("running").exists());
    }

    #[test]
    fn test_exhausted() {
        let temp_dir = TempDir::new().unwrap();
        make_dirs(temp_dir.path(), &["only"]);

        let reclaimer = SpaceReclaimer::new(temp_dir.path(), 500).with_probe(probe(100, 30));
        let result = reclaimer.ensure_headroom();
        assert!(matches!(
            result,
            Err(SiftError::SpaceExhausted {
                available: 100,
                headroom: 500,
                ..
            })
        ));
        assert!(!temp_dir.path().join("only").exists());
    }

    #[test]
    fn test_in_use_nests() {
        let reclaimer = SpaceReclaimer::new("/nonexistent", 0);
        reclaimer.mark_in_use("q");
        reclaimer.mark_in_use("q");
        reclaimer.release("q");
        assert!(reclaimer.is_in_use("q"));
        reclaimer.release("q");
        assert!(!reclaimer.is_in_use("q"));
        reclaimer.release("q");
        assert!(!reclaimer.is_in_use("q"));
    }

    #[test]
    fn test_creates_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("qr");
        let reclaimer = SpaceReclaimer::new(&root, 0).with_probe(probe(100, 1));
        reclaimer.ensure_headroom().unwrap();
        assert!(root.is_dir());
    }
}
