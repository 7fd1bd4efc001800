//! Tests for the commit log.

use super::*;
use crate::message::{Message, Mode, Op};
use serde_json::json;
use std::io::Write;
use tempfile::TempDir;

fn sync_set(ns: &str, i: u64) -> MessageSet {
    MessageSet::sync(Message::from_value(Op::Insert, ns, json!({"_id": i, "n": i})))
}

fn fill(log: &CommitLog, n: u64) -> Vec<u64> {
    (0..n).map(|i| log.append(&sync_set("orders", i)).unwrap()).collect()
}

fn read_all(log: &CommitLog, from: u64) -> Vec<Entry> {
    log.read_from(from).unwrap().collect::<Result<Vec<_>>>().unwrap()
}

fn offsets_from(log: &CommitLog, from: u64) -> Vec<u64> {
    read_all(log, from).iter().map(|e| e.offset).collect()
}

fn active_segment(dir: &Path) -> PathBuf {
    let bases = segment_bases(dir).unwrap();
    Segment::path_for(dir, *bases.last().unwrap())
}

#[test]
fn test_round_trip_with_increasing_offsets() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();

    let offsets = fill(&log, 25);
    assert_eq!(offsets, (0..25).collect::<Vec<_>>());
    assert_eq!(log.next_offset(), 25);

    let entries = read_all(&log, 0);
    assert_eq!(entries.len(), 25);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.offset, i as u64);
        assert_eq!(entry.key, "orders");
        assert_eq!(entry.op, Op::Insert);
        assert_eq!(entry.mode, Mode::Sync);
        assert_eq!(entry.data.get("n"), Some(&json!(i)));
    }
}

#[test]
fn test_read_from_skips_earlier_entries() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    fill(&log, 10);

    let offsets: Vec<u64> = offsets_from(&log, 7);
    assert_eq!(offsets, vec![7, 8, 9]);
    assert!(read_all(&log, 10).is_empty());
}

#[test]
fn test_reopen_continues_offsets() {
    let dir = TempDir::new().unwrap();
    {
        let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        fill(&log, 3);
    }
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    assert_eq!(log.next_offset(), 3);
    assert_eq!(log.append(&sync_set("orders", 3)).unwrap(), 3);
    assert_eq!(read_all(&log, 0).len(), 4);
}

#[test]
fn test_torn_final_entry_is_skipped() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    fill(&log, 4);

    let whole = segment::encode_frame(4, &segment::encode_payload(&sync_set("orders", 4)).unwrap())
        .unwrap();
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(active_segment(dir.path()))
        .unwrap();
    file.write_all(&whole[..whole.len() / 2]).unwrap();
    drop(file);

    let entries = read_all(&log, 0);
    assert_eq!(entries.len(), 4);
    assert_eq!(entries.last().unwrap().offset, 3);
}

#[test]
fn test_open_truncates_torn_tail() {
    let dir = TempDir::new().unwrap();
    {
        let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
        fill(&log, 2);
    }
    let path = active_segment(dir.path());
    let clean_len = fs::metadata(&path).unwrap().len();
    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap();
    drop(file);

    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
    assert_eq!(log.next_offset(), 2);

    assert_eq!(log.append(&sync_set("orders", 2)).unwrap(), 2);
    let offsets: Vec<u64> = offsets_from(&log, 0);
    assert_eq!(offsets, vec![0, 1, 2]);
}

#[test]
fn test_segments_roll_over() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), 200).unwrap();
    fill(&log, 12);

    let bases = segment_bases(dir.path()).unwrap();
    assert!(bases.len() > 1);
    assert_eq!(bases[0], 0);
    assert!(bases.windows(2).all(|w| w[0] < w[1]));

    let offsets: Vec<u64> = offsets_from(&log, 0);
    assert_eq!(offsets, (0..12).collect::<Vec<_>>());
    let tail: Vec<u64> = offsets_from(&log, 9);
    assert_eq!(tail, vec![9, 10, 11]);

    drop(log);
    let log = CommitLog::open(dir.path(), 200).unwrap();
    assert_eq!(log.next_offset(), 12);
}

#[test]
fn test_damaged_sealed_segment_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), 200).unwrap();
    fill(&log, 12);

    let first = Segment::path_for(dir.path(), 0);
    let mut bytes = fs::read(&first).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0xff;
    fs::write(&first, bytes).unwrap();

    let read: Result<Vec<Entry>> = log.read_from(0).unwrap().collect();
    assert!(matches!(read, Err(Error::Corrupt { .. })));
}

#[test]
fn test_zero_segment_size_is_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(CommitLog::open(dir.path(), 0), Err(Error::Config(_))));
}

#[test]
fn test_checkpoint_lives_beside_segments() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    fill(&log, 1);
    Checkpoint::new(0).store(log.dir()).unwrap();

    drop(log);
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    assert_eq!(log.next_offset(), 1);
    assert_eq!(Checkpoint::load(log.dir()).unwrap().unwrap().next(), 1);
}

#[test]
fn test_stray_bytes_after_last_frame_are_cut_before_appending() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    fill(&log, 3);

    // What a write that failed halfway leaves behind.
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(active_segment(dir.path()))
        .unwrap();
    file.write_all(&[0x5a; 10]).unwrap();
    drop(file);

    assert_eq!(log.append(&sync_set("orders", 3)).unwrap(), 3);
    assert_eq!(log.append(&sync_set("orders", 4)).unwrap(), 4);
    assert_eq!(offsets_from(&log, 0), vec![0, 1, 2, 3, 4]);

    drop(log);
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    assert_eq!(log.next_offset(), 5);
}

#[test]
fn test_read_stops_at_offset_next_when_created() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), DEFAULT_MAX_SEGMENT_BYTES).unwrap();
    fill(&log, 3);

    let mut entries = log.read_from(1).unwrap();
    assert_eq!(entries.next().unwrap().unwrap().offset, 1);
    log.append(&sync_set("orders", 3)).unwrap();
    let rest: Vec<u64> = entries.map(|e| e.unwrap().offset).collect();
    assert_eq!(rest, vec![2]);
}

#[test]
fn test_release_deletes_confirmed_sealed_segments() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), 200).unwrap();
    fill(&log, 12);
    let bases = segment_bases(dir.path()).unwrap();
    assert!(bases.len() > 2);

    // Nothing below the second segment's base is released early.
    assert_eq!(log.release(bases[1] - 1).unwrap(), 0);
    assert_eq!(log.release(bases[2]).unwrap(), 2);
    assert_eq!(segment_bases(dir.path()).unwrap(), bases[2..].to_vec());
    assert_eq!(offsets_from(&log, bases[2]), (bases[2]..12).collect::<Vec<_>>());

    // The active segment stays no matter how far the mark is.
    log.release(u64::MAX).unwrap();
    assert_eq!(segment_bases(dir.path()).unwrap().last(), bases.last());
    assert_eq!(log.append(&sync_set("orders", 12)).unwrap(), 12);
}

#[test]
fn test_release_keeps_newest_entry_per_namespace() {
    let dir = TempDir::new().unwrap();
    let log = CommitLog::open(dir.path(), 200).unwrap();
    for (i, ns) in ["users", "orders", "users", "orders", "carts", "users"].iter().enumerate() {
        log.append(&sync_set(ns, i as u64)).unwrap();
    }
    fill(&log, 6);
    let released = log.release(log.next_offset()).unwrap();
    assert!(released > 0);

    let retained = log.retained().unwrap();
    let keys: Vec<&str> = retained.iter().map(|e| e.key.as_str()).collect();
    assert!(keys.contains(&"users"));
    assert!(keys.contains(&"carts"));
    assert!(retained.windows(2).all(|w| w[0].offset < w[1].offset));
    let users = retained.iter().find(|e| e.key == "users").unwrap();
    assert_eq!(users.offset, 5);

    drop(log);
    let log = CommitLog::open(dir.path(), 200).unwrap();
    assert_eq!(log.retained().unwrap().len(), retained.len());
}
