//! Integration tests for `VideoCache`.

mod common;

use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime},
};

use reelcache_store::{
    ByteRange, CacheConfig, CacheState, ResponseHeaders, StorageError, StoreError, VideoCache,
};
use rstest::rstest;
use tempfile::TempDir;

use common::{pattern, temp_dir, tracing_setup};

const CLIP: &str = "https://cdn.example.com/videos/clip.mp4?sig=abc";
const OTHER: &str = "https://cdn.example.com/videos/other.mp4";
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn cache_in(dir: &TempDir) -> VideoCache {
    VideoCache::new(CacheConfig::new(dir.path().join("videos")))
}

fn fill(cache: &VideoCache, key: &str, len: usize) {
    let file = cache.open_file(key).unwrap();
    file.store_response_metadata(len as u64, ResponseHeaders::new());
    file.store_data(&pattern(0, len), 0, true).unwrap();
}

fn age_files(cache: &VideoCache, key: &str, by: Duration) {
    let paths = cache.paths_for(key);
    let when = SystemTime::now() - by;
    for path in [&paths.data, &paths.index] {
        set_mtime(path, when);
    }
}

fn set_mtime(path: &Path, when: SystemTime) {
    fs::OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn open_file_lays_out_data_and_index(_tracing_setup: (), temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    let file = cache.open_file(CLIP).unwrap();
    let paths = cache.paths_for(CLIP);

    assert_eq!(file.data_path(), paths.data);
    assert_eq!(file.index_path(), paths.index);
    assert_eq!(paths.data.extension().unwrap(), "mp4");
    assert!(paths.data.exists());
    assert!(paths.index.exists());
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn open_file_shares_live_handle(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    let downloader = cache.open_file(CLIP).unwrap();
    let player = cache.open_file(CLIP).unwrap();

    downloader.store_data(b"moov", 0, false).unwrap();
    assert_eq!(
        player.cached_subrange(ByteRange::new(0, 10)),
        Some(ByteRange::new(0, 4))
    );
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn is_cached_tracks_completion_across_instances(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    assert!(!cache.is_cached(CLIP).unwrap());

    {
        let file = cache.open_file(CLIP).unwrap();
        file.store_response_metadata(8, ResponseHeaders::new());
        file.store_data(b"abcd", 0, true).unwrap();
        assert!(!cache.is_cached(CLIP).unwrap());
        file.store_data(b"efgh", 4, true).unwrap();
        assert!(cache.is_cached(CLIP).unwrap());
    }

    // Closed: answered from the index on disk.
    let fresh = cache_in(&temp_dir);
    assert!(fresh.is_cached(CLIP).unwrap());
    assert_eq!(fresh.open_file(CLIP).unwrap().state(), CacheState::Complete);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn is_cached_survives_length_change_after_close(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    {
        let file = cache.open_file(CLIP).unwrap();
        file.store_response_metadata(8, ResponseHeaders::new());
        file.store_data(&pattern(0, 8), 0, false).unwrap();
        assert!(!file.store_response_metadata(16, ResponseHeaders::new()));
    }

    let fresh = cache_in(&temp_dir);
    assert!(fresh.is_cached(CLIP).unwrap());
    let file = fresh.open_file(CLIP).unwrap();
    assert_eq!(file.file_length(), 16);
    assert_eq!(file.state(), CacheState::Complete);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn remove_invalidates_open_handles(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    let file = cache.open_file(CLIP).unwrap();
    file.store_data(b"data", 0, false).unwrap();

    cache.remove(CLIP).unwrap();
    assert!(!cache.paths_for(CLIP).data.exists());
    assert!(matches!(
        file.store_data(b"more", 4, false),
        Err(StorageError::Removed)
    ));
    drop(file);

    // A fresh open starts empty.
    assert_eq!(cache.open_file(CLIP).unwrap().state(), CacheState::Empty);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn delete_old_files_removes_expired_closed_entries(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    fill(&cache, CLIP, 100);
    fill(&cache, OTHER, 100);
    age_files(&cache, CLIP, 8 * DAY);

    let report = cache.delete_old_files().unwrap();
    assert_eq!(report.removed, 1);
    assert!(report.freed_bytes >= 100);
    assert!(!cache.paths_for(CLIP).data.exists());
    assert!(cache.paths_for(OTHER).data.exists());
    assert_eq!(cache.count().unwrap(), 1);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn delete_old_files_skips_open_entries(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    fill(&cache, CLIP, 100);
    let playing = cache.open_file(CLIP).unwrap();
    age_files(&cache, CLIP, 8 * DAY);

    let report = cache.delete_old_files().unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.skipped_open, 1);
    assert_eq!(playing.read_data(ByteRange::new(0, 4)).unwrap().len(), 4);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn size_limit_trims_oldest_to_half(temp_dir: TempDir) {
    let cache = VideoCache::new(
        CacheConfig::new(temp_dir.path().join("videos")).with_max_cache_size(10_000),
    );
    let keys: Vec<String> = (0..4)
        .map(|i| format!("https://cdn.example.com/v/{i}.mp4"))
        .collect();
    for (i, key) in keys.iter().enumerate() {
        fill(&cache, key, 3_000);
        age_files(&cache, key, Duration::from_secs(3600 * (10 - i as u64)));
    }
    assert!(cache.size().unwrap() > 10_000);
    assert!(!cache.has_free_space_for(1).unwrap());

    let report = cache.delete_old_files().unwrap();
    assert!(cache.size().unwrap() <= 5_000);
    assert_eq!(report.removed, 3);
    // The newest entry survives.
    assert!(cache.paths_for(&keys[3]).data.exists());
    assert!(cache.has_free_space_for(1_000).unwrap());
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn clear_keeps_open_entries(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    fill(&cache, CLIP, 10);
    fill(&cache, OTHER, 10);
    let _open = cache.open_file(OTHER).unwrap();

    assert_eq!(cache.clear().unwrap(), 1);
    assert_eq!(cache.count().unwrap(), 1);
    assert!(cache.paths_for(OTHER).index.exists());
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn calculate_size_matches_scan(temp_dir: TempDir) {
    let cache = cache_in(&temp_dir);
    assert_eq!(cache.calculate_size().await.unwrap(), (0, 0));

    fill(&cache, CLIP, 1_000);
    fill(&cache, OTHER, 2_000);

    let (count, size) = cache.calculate_size().await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(size, cache.size().unwrap());
    assert!(size >= 3_000);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn unopenable_root_is_an_io_error(temp_dir: TempDir) {
    let blocker = temp_dir.path().join("file");
    fs::write(&blocker, b"x").unwrap();
    let cache = VideoCache::new(CacheConfig::new(blocker.join("videos")));

    assert!(matches!(
        cache.open_file(CLIP),
        Err(StoreError::Storage(StorageError::Io(_)))
    ));
}
