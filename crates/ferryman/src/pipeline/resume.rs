//! Per-namespace resume points rebuilt from the commit log.

use std::collections::HashMap;

use crate::commitlog::{CommitLog, Entry};
use crate::error::Result;
use crate::message::MessageSet;

/// Last logged message of one namespace.
#[derive(Debug)]
pub struct ResumeData {
    /// Commit log offset of the message.
    pub offset: u64,
    /// Namespace the message belongs to.
    pub namespace: String,
    /// The message as it was logged.
    pub msg: MessageSet,
}

/// Resume points keyed by namespace.
pub type ResumeMap = HashMap<String, ResumeData>;

/// Replays the log from `from` and keeps the newest entry of each namespace.
///
/// Namespaces whose entries were all released only survive through the
/// log's retained snapshot, which is consulted first.
pub fn load(log: &CommitLog, from: u64) -> Result<ResumeMap> {
    let mut resume = ResumeMap::new();
    for entry in log.retained()? {
        if entry.offset >= from {
            keep(&mut resume, entry);
        }
    }
    for entry in log.read_from(from)? {
        keep(&mut resume, entry?);
    }
    Ok(resume)
}

fn keep(resume: &mut ResumeMap, entry: Entry) {
    let namespace = entry.key.clone();
    resume.insert(
        namespace.clone(),
        ResumeData {
            offset: entry.offset,
            namespace,
            msg: entry.into_message_set(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::DEFAULT_MAX_SEGMENT_BYTES;
    use crate::message::{Message, Mode, Op};
    use serde_json::json;
    use tempfile::TempDir;

    fn log_with(dir: &TempDir, records: &[(&str, i64)]) -> CommitLog {
        log_sized(dir, records, DEFAULT_MAX_SEGMENT_BYTES)
    }

    fn log_sized(dir: &TempDir, records: &[(&str, i64)], segment_bytes: u64) -> CommitLog {
        let log = CommitLog::open(dir.path(), segment_bytes).unwrap();
        for (ns, n) in records {
            let set = MessageSet::sync(Message::from_value(Op::Update, *ns, json!({"n": n})));
            log.append(&set).unwrap();
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, &[]);
        assert!(load(&log, 0).unwrap().is_empty());
    }

    #[test]
    fn test_latest_entry_per_namespace() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, &[("a", 1), ("b", 2), ("a", 3), ("c", 4), ("b", 5)]);

        let resume = load(&log, 0).unwrap();
        assert_eq!(resume.len(), 3);
        let a = &resume["a"];
        assert_eq!(a.offset, 2);
        assert_eq!(a.namespace, "a");
        assert_eq!(a.msg.msg.data.get("n"), Some(&json!(3)));
        assert_eq!(a.msg.mode, Mode::Sync);
        assert_eq!(a.msg.msg.op, Op::Update);
        assert_eq!(resume["b"].offset, 4);
    }

    #[test]
    fn test_load_from_offset() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, &[("a", 1), ("b", 2), ("c", 3)]);

        let resume = load(&log, 2).unwrap();
        assert_eq!(resume.len(), 1);
        assert!(resume.contains_key("c"));
    }

    #[test]
    fn test_released_namespaces_still_resume() {
        let dir = TempDir::new().unwrap();
        let mut records = vec![("legacy", 0)];
        records.extend((1..12).map(|n| ("orders", n)));
        let log = log_sized(&dir, &records, 200);
        assert!(log.release(log.next_offset()).unwrap() > 0);

        let resume = load(&log, 0).unwrap();
        assert_eq!(resume["legacy"].offset, 0);
        assert_eq!(resume["orders"].offset, 11);
        assert_eq!(resume["orders"].msg.msg.data.get("n"), Some(&json!(11)));
    }
}
