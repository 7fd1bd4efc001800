//! Append-only log of sync-mode messages.
//!
//! Continuous sources mark their records [`Mode::Sync`](crate::message::Mode::Sync).
//! The pipeline appends each of them here before handing it to the sink, so
//! a restart can redeliver whatever the sink had not confirmed yet.
//!
//! The log is a directory of segment files named after their first offset
//! (`00000000000000000000.log`, ...). Offsets start at zero, increase by one
//! per entry and are never reused. See [`segment`] for the frame format.
//!
//! Once the checkpoint passes a sealed segment, [`CommitLog::release`]
//! deletes it. The newest entry of every namespace in a released segment is
//! kept in `resume.snapshot` (same frame format), so resume points survive.

mod checkpoint;
pub mod segment;

pub use checkpoint::{Checkpoint, CHECKPOINT_FILE};
pub use segment::Entry;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::message::MessageSet;
use segment::{encode_frame, encode_payload, Segment, SegmentScan};

/// Size after which a new segment is started.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 1 << 30;

/// Newest entry per namespace of the released segments.
pub const RESUME_SNAPSHOT_FILE: &str = "resume.snapshot";

struct Active {
    segment: Segment,
    next_offset: u64,
}

/// Commit log rooted at a directory.
pub struct CommitLog {
    dir: PathBuf,
    max_segment_bytes: u64,
    active: Mutex<Active>,
    release_turn: Mutex<()>,
}

impl CommitLog {
    /// Opens or creates the log in `dir`.
    ///
    /// The newest segment is validated and a torn tail left by a crash is
    /// truncated. Older segments are trusted until read.
    pub fn open(dir: impl Into<PathBuf>, max_segment_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        if max_segment_bytes == 0 {
            return Err(Error::Config(
                "commit log max_segment_bytes must be positive".to_string(),
            ));
        }
        fs::create_dir_all(&dir).map_err(|e| {
            Error::CommitLog(format!("cannot create {}: {e}", dir.display()))
        })?;

        let bases = segment_bases(&dir)?;
        let active = match bases.last() {
            Some(&base) => {
                let (segment, last) = Segment::recover(&dir, base)?;
                let next_offset = last.map_or(base, |l| l + 1);
                Active {
                    segment,
                    next_offset,
                }
            }
            None => Active {
                segment: Segment::create(&dir, 0)?,
                next_offset: 0,
            },
        };
        info!(
            dir = %dir.display(),
            segments = bases.len().max(1),
            next_offset = active.next_offset,
            "commit log opened"
        );

        Ok(Self {
            dir,
            max_segment_bytes,
            active: Mutex::new(active),
            release_turn: Mutex::new(()),
        })
    }

    /// Directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Offset the next append will receive.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.active.lock().next_offset
    }

    /// Appends `set` and returns its offset once the entry is on disk.
    pub fn append(&self, set: &MessageSet) -> Result<u64> {
        let payload = encode_payload(set)?;
        let mut active = self.active.lock();
        let offset = active.next_offset;
        let frame = encode_frame(offset, &payload)?;

        if active.segment.size() > 0
            && active.segment.size() + frame.len() as u64 > self.max_segment_bytes
        {
            debug!(base = offset, "rolling commit log segment");
            active.segment = Segment::create(&self.dir, offset)?;
        }
        active.segment.append(&frame)?;
        active.next_offset = offset + 1;
        Ok(offset)
    }

    /// Streams every entry with `offset >= from`, in order.
    ///
    /// The iterator stops at the offset that was next when it was created,
    /// so entries appended meanwhile are not included. A torn final entry of
    /// the newest segment is skipped; damage anywhere else is an
    /// [`Error::Corrupt`].
    pub fn read_from(&self, from: u64) -> Result<Entries> {
        let (active_base, end) = {
            let active = self.active.lock();
            (active.segment.base, active.next_offset)
        };
        let bases = segment_bases(&self.dir)?;
        let first = bases.partition_point(|base| *base <= from).saturating_sub(1);
        Ok(Entries {
            dir: self.dir.clone(),
            from,
            end,
            active_base,
            bases: bases[first..].to_vec().into_iter(),
            current: None,
        })
    }

    /// Newest entry per namespace among the released segments, oldest
    /// first.
    pub fn retained(&self) -> Result<Vec<Entry>> {
        let path = self.dir.join(RESUME_SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut scan = SegmentScan::open(path, true)?;
        let mut entries = Vec::new();
        while let Some(entry) = scan.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Deletes the sealed segments whose entries all lie below `before`,
    /// usually the first unconfirmed offset. Returns how many went.
    pub fn release(&self, before: u64) -> Result<usize> {
        let _turn = self.release_turn.lock();
        // The newest segment is never in the first position of a pair.
        let bases = segment_bases(&self.dir)?;
        let released: Vec<u64> = bases
            .windows(2)
            .filter(|pair| pair[1] <= before)
            .map(|pair| pair[0])
            .collect();
        if released.is_empty() {
            return Ok(0);
        }

        let mut latest: HashMap<String, Entry> = self
            .retained()?
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        for base in &released {
            let mut scan = SegmentScan::open(Segment::path_for(&self.dir, *base), true)?;
            while let Some(entry) = scan.next_entry()? {
                latest.insert(entry.key.clone(), entry);
            }
        }
        let mut kept: Vec<Entry> = latest.into_values().collect();
        kept.sort_unstable_by_key(|entry| entry.offset);
        self.write_snapshot(&kept)?;

        for base in &released {
            fs::remove_file(Segment::path_for(&self.dir, *base))?;
        }
        info!(
            segments = released.len(),
            before,
            namespaces = kept.len(),
            "released confirmed commit log segments"
        );
        Ok(released.len())
    }

    fn write_snapshot(&self, entries: &[Entry]) -> Result<()> {
        let path = self.dir.join(RESUME_SNAPSHOT_FILE);
        let tmp = path.with_extension("snapshot.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for entry in entries {
                let payload = encode_payload(&entry.clone().into_message_set())?;
                file.write_all(&encode_frame(entry.offset, &payload)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Streaming iterator returned by [`CommitLog::read_from`].
pub struct Entries {
    dir: PathBuf,
    from: u64,
    end: u64,
    active_base: u64,
    bases: std::vec::IntoIter<u64>,
    current: Option<SegmentScan>,
}

impl Entries {
    fn stop(&mut self) {
        self.current = None;
        self.bases = Vec::new().into_iter();
    }
}

impl Iterator for Entries {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let base = self.bases.next()?;
                let sealed = base != self.active_base;
                match SegmentScan::open(Segment::path_for(&self.dir, base), sealed) {
                    Ok(scan) => self.current = Some(scan),
                    Err(e) => {
                        self.stop();
                        return Some(Err(e));
                    }
                }
            }
            let scan = self.current.as_mut()?;
            match scan.next_entry() {
                Ok(Some(entry)) if entry.offset >= self.end => {
                    self.stop();
                    return None;
                }
                Ok(Some(entry)) if entry.offset >= self.from => return Some(Ok(entry)),
                Ok(Some(_)) => {}
                Ok(None) => self.current = None,
                Err(e) => {
                    self.stop();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Base offsets of the segment files in `dir`, ascending.
fn segment_bases(dir: &Path) -> Result<Vec<u64>> {
    let mut bases = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(base) = entry.file_name().to_str().and_then(Segment::parse_name) {
            bases.push(base);
        }
    }
    bases.sort_unstable();
    Ok(bases)
}

#[cfg(test)]
#[path = "commitlog_tests.rs"]
mod tests;
