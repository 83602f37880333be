//! Integration tests for `RangeCacheFile`.

mod common;

use std::{sync::Arc, thread, time::Duration};

use reelcache_storage::{
    ByteRange, CacheFileOptions, CacheState, Gap, RangeCacheFile, ResponseHeaders,
};
use rstest::rstest;
use tempfile::TempDir;

use common::{pattern, temp_dir, tracing_setup};

const CHUNK: usize = 4096;

fn open(dir: &TempDir, name: &str) -> RangeCacheFile {
    RangeCacheFile::open(CacheFileOptions::new(
        dir.path().join(format!("{name}.mp4")),
        dir.path().join(format!("{name}.idx")),
    ))
    .unwrap()
}

#[rstest]
#[timeout(Duration::from_secs(10))]
fn reader_never_sees_unwritten_bytes(_tracing_setup: (), temp_dir: TempDir) {
    const CHUNKS: usize = 64;
    let total = (CHUNK * CHUNKS) as u64;

    let writer = Arc::new(open(&temp_dir, "concurrent"));
    writer.store_response_metadata(total, ResponseHeaders::new());
    let reader = writer.share();

    let producer = {
        let writer = Arc::clone(&writer);
        thread::spawn(move || {
            for i in 0..CHUNKS {
                let offset = (i * CHUNK) as u64;
                writer
                    .store_data(&pattern(offset, CHUNK), offset, false)
                    .unwrap();
            }
        })
    };

    let mut position = 0u64;
    while position < total {
        let Some(cached) = reader.cached_subrange(ByteRange::new(position, total - position))
        else {
            thread::yield_now();
            continue;
        };
        // Fragments only ever grow by whole chunks.
        assert_eq!(cached.end() % CHUNK as u64, 0, "partial chunk visible: {cached}");

        let data = reader.read_data(cached).unwrap();
        assert_eq!(data.len() as u64, cached.length);
        assert_eq!(&data[..], &pattern(cached.offset, data.len())[..]);
        position = cached.end();
    }

    producer.join().unwrap();
    assert_eq!(reader.state(), CacheState::Complete);
    assert_eq!(reader.first_gap_from(0), None);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn interrupted_download_resumes_from_first_gap(temp_dir: TempDir) {
    let total = (CHUNK * 4) as u64;
    {
        let file = open(&temp_dir, "resume");
        file.store_response_metadata(
            total,
            ResponseHeaders::new()
                .with("Content-Type", "video/mp4")
                .with("Content-Range", format!("bytes 0-{}/{total}", CHUNK - 1)),
        );
        file.store_data(&pattern(0, CHUNK), 0, false).unwrap();
        file.store_data(&pattern(2 * CHUNK as u64, CHUNK), 2 * CHUNK as u64, false)
            .unwrap();
        file.synchronize().unwrap();
    }

    let file = open(&temp_dir, "resume");
    assert_eq!(file.state(), CacheState::PartiallyCached);
    assert_eq!(file.metadata().headers.total_length(), Some(total));

    let gap = file.first_gap_from(0).unwrap();
    assert_eq!(gap, Gap::Bounded(ByteRange::new(CHUNK as u64, CHUNK as u64)));

    file.store_data(&pattern(gap.offset(), CHUNK), gap.offset(), false)
        .unwrap();
    let gap = file.first_gap_from(0).unwrap();
    assert_eq!(gap.offset(), 3 * CHUNK as u64);

    file.store_data(&pattern(gap.offset(), CHUNK), gap.offset(), true)
        .unwrap();
    assert!(file.is_complete());

    let all = file.read_data(ByteRange::new(0, total)).unwrap();
    assert_eq!(&all[..], &pattern(0, total as usize)[..]);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn player_reads_sequentially_through_cursor(temp_dir: TempDir) {
    let file = open(&temp_dir, "cursor");
    let body = pattern(0, 10_000);
    file.store_response_metadata(body.len() as u64, ResponseHeaders::new());
    file.store_data(&body, 0, false).unwrap();

    let mut out = Vec::new();
    while !file.is_eof() {
        let chunk = file.read_data_with_length(CHUNK).unwrap();
        assert!(!chunk.is_empty());
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out, body);
    assert!(file.read_data_with_length(CHUNK).unwrap().is_empty());
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn unknown_length_leaves_trailing_gap_open(temp_dir: TempDir) {
    let file = open(&temp_dir, "live");
    file.store_data(&pattern(0, 100), 0, false).unwrap();

    assert!(!file.is_file_length_valid());
    assert_eq!(file.first_gap_from(0), Some(Gap::Open { offset: 100 }));
    assert_eq!(file.state(), CacheState::PartiallyCached);
    assert!(!file.is_eof());
}

#[rstest]
#[timeout(Duration::from_secs(5))]
fn many_deferred_stores_persist(temp_dir: TempDir) {
    {
        let file = open(&temp_dir, "burst");
        for i in 0..200u64 {
            // Every other 16-byte slot.
            file.store_data(&[1; 16], i * 32, false).unwrap();
        }
        file.synchronize().unwrap();
    }

    let file = open(&temp_dir, "burst");
    assert_eq!(file.fragments().len(), 200);
    assert_eq!(file.cached_bytes(), 200 * 16);
}
