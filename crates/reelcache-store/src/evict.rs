#![forbid(unsafe_code)]

//! Age and size eviction over the cache directory.
//!
//! The filesystem is the source of truth: every pass rescans the root
//! directory and groups files by stem. Eviction runs in two passes:
//! - entries whose newest file is older than `max_cache_age` are removed
//! - if the rest still exceeds `max_cache_size`, the oldest entries are
//!   removed until the total drops to half the limit
//!
//! Entries with an open [`RangeCacheFile`](reelcache_storage::RangeCacheFile)
//! are never candidates.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::key::stem_of_file_name;

/// Outcome of [`VideoCache::delete_old_files`](crate::VideoCache::delete_old_files).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries deleted.
    pub removed: usize,
    /// Bytes those entries occupied.
    pub freed_bytes: u64,
    /// Entries that qualified but were kept because they are open.
    pub skipped_open: usize,
}

/// Files sharing one stem.
#[derive(Clone, Debug)]
pub(crate) struct CacheEntry {
    pub stem: String,
    pub files: Vec<PathBuf>,
    pub size: u64,
    pub modified: SystemTime,
}

/// Group the files under `root` by stem. A missing root is an empty cache.
pub(crate) fn scan(root: &Path) -> io::Result<Vec<CacheEntry>> {
    let dir = match fs::read_dir(root) {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut by_stem: HashMap<String, CacheEntry> = HashMap::new();
    for item in dir {
        let item = item?;
        let name = item.file_name();
        let Some(stem) = name.to_str().and_then(stem_of_file_name) else {
            continue;
        };
        // Vanished between read_dir and stat: someone else removed it.
        let meta = match item.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let entry = by_stem
            .entry(stem.to_owned())
            .or_insert_with(|| CacheEntry {
                stem: stem.to_owned(),
                files: Vec::new(),
                size: 0,
                modified: SystemTime::UNIX_EPOCH,
            });
        entry.files.push(item.path());
        entry.size = entry.size.saturating_add(meta.len());
        entry.modified = entry.modified.max(modified);
    }

    Ok(by_stem.into_values().collect())
}

/// Pick entries to delete. Returns the victims and how many qualifying
/// entries were skipped because they are open.
pub(crate) fn select_victims(
    mut entries: Vec<CacheEntry>,
    now: SystemTime,
    max_age: Duration,
    max_size: Option<u64>,
    is_open: impl Fn(&str) -> bool,
) -> (Vec<CacheEntry>, usize) {
    entries.sort_by_key(|e| e.modified);

    let mut victims = Vec::new();
    let mut kept = Vec::new();
    let mut skipped = 0;

    for entry in entries {
        let age = now.duration_since(entry.modified).unwrap_or_default();
        if age <= max_age {
            kept.push(entry);
        } else if is_open(&entry.stem) {
            skipped += 1;
            kept.push(entry);
        } else {
            victims.push(entry);
        }
    }

    let Some(limit) = max_size else {
        return (victims, skipped);
    };
    let mut total = kept.iter().map(|e| e.size).fold(0u64, u64::saturating_add);
    if total <= limit {
        return (victims, skipped);
    }

    let target = limit / 2;
    for entry in kept {
        if total <= target {
            break;
        }
        // Already counted by the age pass.
        let expired = now.duration_since(entry.modified).unwrap_or_default() > max_age;
        if is_open(&entry.stem) {
            if !expired {
                skipped += 1;
            }
            continue;
        }
        total = total.saturating_sub(entry.size);
        victims.push(entry);
    }

    (victims, skipped)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn entry(stem: &str, size: u64, age: Duration, now: SystemTime) -> CacheEntry {
        CacheEntry {
            stem: stem.to_owned(),
            files: Vec::new(),
            size,
            modified: now - age,
        }
    }

    fn stems(v: &[CacheEntry]) -> Vec<&str> {
        v.iter().map(|e| e.stem.as_str()).collect()
    }

    #[test]
    fn age_pass_removes_expired_only() {
        let now = SystemTime::now();
        let entries = vec![
            entry("fresh", 10, HOUR, now),
            entry("stale", 10, 48 * HOUR, now),
        ];
        let (victims, skipped) = select_victims(entries, now, 24 * HOUR, None, |_| false);
        assert_eq!(stems(&victims), vec!["stale"]);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn size_pass_trims_oldest_to_half_the_limit() {
        let now = SystemTime::now();
        let entries = vec![
            entry("c", 40, HOUR, now),
            entry("a", 40, 3 * HOUR, now),
            entry("b", 40, 2 * HOUR, now),
        ];
        // 120 > 100; stop once total <= 50.
        let (victims, _) = select_victims(entries, now, 24 * HOUR, Some(100), |_| false);
        assert_eq!(stems(&victims), vec!["a", "b"]);
    }

    #[test]
    fn under_the_limit_keeps_everything() {
        let now = SystemTime::now();
        let entries = vec![entry("a", 40, HOUR, now), entry("b", 40, HOUR, now)];
        let (victims, skipped) = select_victims(entries, now, 24 * HOUR, Some(100), |_| false);
        assert!(victims.is_empty());
        assert_eq!(skipped, 0);
    }

    #[rstest]
    #[case(None)]
    #[case(Some(10))]
    fn open_entries_are_skipped(#[case] max_size: Option<u64>) {
        let now = SystemTime::now();
        let entries = vec![
            entry("open", 100, 48 * HOUR, now),
            entry("closed", 100, 48 * HOUR, now),
        ];
        let (victims, skipped) =
            select_victims(entries, now, 24 * HOUR, max_size, |stem| stem == "open");
        assert_eq!(stems(&victims), vec!["closed"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn scan_groups_files_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let stem = "0123456789abcdef0123456789abcdef";
        fs::write(dir.path().join(format!("{stem}.mp4")), [0u8; 30]).unwrap();
        fs::write(dir.path().join(format!("{stem}.idx")), [0u8; 5]).unwrap();
        fs::write(dir.path().join("notes.txt"), b"not ours").unwrap();

        let entries = scan(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stem, stem);
        assert_eq!(entries[0].size, 35);
        assert_eq!(entries[0].files.len(), 2);
    }

    #[test]
    fn scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(&dir.path().join("absent")).unwrap().is_empty());
    }
}
