//! Segment files and the entry frame format.
//!
//! ```text
//! ┌────────────┬──────────┬───────────┬──────────────────┐
//! │ offset u64 │ size u32 │ crc32 u32 │ payload[size]    │
//! └────────────┴──────────┴───────────┴──────────────────┘
//!
//! payload:
//! ┌──────────────┬───────┬─────────┬─────────────┬─────┬──────────────┐
//! │ timestamp i64│ op u8 │ mode u8 │ key_len u32 │ key │ value (JSON) │
//! └──────────────┴───────┴─────────┴─────────────┴─────┴──────────────┘
//! ```
//!
//! All integers are little-endian. The CRC covers the payload only.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::{Data, Message, MessageSet, Mode, Op};

/// Bytes before the payload of every frame.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Fixed-size part of a payload: timestamp, op, mode and key length.
const PAYLOAD_PREFIX_SIZE: usize = 14;

/// Largest payload accepted when reading. Anything bigger is a damaged
/// length field.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// One logged message.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Position in the log.
    pub offset: u64,
    /// Unix millis the reader produced the message at.
    pub timestamp: i64,
    /// Operation.
    pub op: Op,
    /// Delivery mode.
    pub mode: Mode,
    /// Namespace of the message.
    pub key: String,
    /// Message payload.
    pub data: Data,
}

impl Entry {
    /// Rebuilds the message set the entry was logged from.
    #[must_use]
    pub fn into_message_set(self) -> MessageSet {
        MessageSet {
            msg: Message::new(self.op, self.key, self.data),
            timestamp: self.timestamp,
            mode: self.mode,
        }
    }

    fn decode(offset: u64, payload: &[u8]) -> std::result::Result<Self, String> {
        if payload.len() < PAYLOAD_PREFIX_SIZE {
            return Err(format!("payload of {} bytes is too short", payload.len()));
        }
        let timestamp = i64::from_le_bytes(fixed(&payload[0..8]));
        let op = Op::from_code(payload[8]).ok_or_else(|| format!("unknown op {}", payload[8]))?;
        let mode =
            Mode::from_code(payload[9]).ok_or_else(|| format!("unknown mode {}", payload[9]))?;
        let key_len = u32::from_le_bytes(fixed(&payload[10..14])) as usize;
        let key_end = PAYLOAD_PREFIX_SIZE
            .checked_add(key_len)
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| format!("key length {key_len} overruns payload"))?;
        let key = std::str::from_utf8(&payload[PAYLOAD_PREFIX_SIZE..key_end])
            .map_err(|e| format!("key is not utf-8: {e}"))?
            .to_string();
        let data: Data = serde_json::from_slice(&payload[key_end..])
            .map_err(|e| format!("value is not a JSON object: {e}"))?;
        Ok(Self {
            offset,
            timestamp,
            op,
            mode,
            key,
            data,
        })
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Encodes the payload of a message set.
pub fn encode_payload(set: &MessageSet) -> Result<Vec<u8>> {
    let key = set.msg.namespace.as_bytes();
    let key_len = u32::try_from(key.len())
        .map_err(|_| Error::CommitLog(format!("namespace of {} bytes is too long", key.len())))?;
    let value = serde_json::to_vec(&set.msg.data)?;

    let mut payload = Vec::with_capacity(PAYLOAD_PREFIX_SIZE + key.len() + value.len());
    payload.extend_from_slice(&set.timestamp.to_le_bytes());
    payload.push(set.msg.op.code());
    payload.push(set.mode.code());
    payload.extend_from_slice(&key_len.to_le_bytes());
    payload.extend_from_slice(key);
    payload.extend_from_slice(&value);
    Ok(payload)
}

/// Wraps a payload in a frame.
pub fn encode_frame(offset: u64, payload: &[u8]) -> Result<Vec<u8>> {
    let size = u32::try_from(payload.len())
        .ok()
        .filter(|size| *size <= MAX_PAYLOAD_SIZE)
        .ok_or_else(|| Error::CommitLog(format!("entry of {} bytes is too large", payload.len())))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&offset.to_le_bytes());
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Result of reading one frame.
#[derive(Debug)]
pub(crate) enum Frame {
    /// A complete, valid entry.
    Entry(Entry),
    /// Clean end of file.
    End,
    /// Truncated or damaged bytes; nothing after them is trusted.
    Damaged { offset: Option<u64>, reason: String },
}

/// Sequential frame reader tracking the end of the last valid frame.
pub(crate) struct FrameReader<R> {
    inner: R,
    valid_len: u64,
}

impl<R: Read> FrameReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            valid_len: 0,
        }
    }

    /// Bytes covered by the frames read so far.
    pub(crate) fn valid_len(&self) -> u64 {
        self.valid_len
    }

    pub(crate) fn next_frame(&mut self) -> io::Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match fill(&mut self.inner, &mut header)? {
            0 => return Ok(Frame::End),
            n if n < FRAME_HEADER_SIZE => {
                return Ok(Frame::Damaged {
                    offset: None,
                    reason: format!("torn header ({n} of {FRAME_HEADER_SIZE} bytes)"),
                })
            }
            _ => {}
        }
        let offset = u64::from_le_bytes(fixed(&header[0..8]));
        let size = u32::from_le_bytes(fixed(&header[8..12]));
        let crc = u32::from_le_bytes(fixed(&header[12..16]));
        if size > MAX_PAYLOAD_SIZE {
            return Ok(Frame::Damaged {
                offset: Some(offset),
                reason: format!("payload size {size} exceeds limit"),
            });
        }

        let mut payload = vec![0u8; size as usize];
        let read = fill(&mut self.inner, &mut payload)?;
        if read < payload.len() {
            return Ok(Frame::Damaged {
                offset: Some(offset),
                reason: format!("torn payload ({read} of {size} bytes)"),
            });
        }
        if crc32fast::hash(&payload) != crc {
            return Ok(Frame::Damaged {
                offset: Some(offset),
                reason: "crc mismatch".to_string(),
            });
        }
        match Entry::decode(offset, &payload) {
            Ok(entry) => {
                self.valid_len += (FRAME_HEADER_SIZE + payload.len()) as u64;
                Ok(Frame::Entry(entry))
            }
            Err(reason) => Ok(Frame::Damaged {
                offset: Some(offset),
                reason,
            }),
        }
    }
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A segment file, named after the offset of its first entry.
pub(crate) struct Segment {
    pub(crate) base: u64,
    path: PathBuf,
    file: File,
    size: u64,
}

impl Segment {
    pub(crate) fn path_for(dir: &Path, base: u64) -> PathBuf {
        dir.join(format!("{base:020}.log"))
    }

    /// Base offset encoded in a segment file name.
    pub(crate) fn parse_name(name: &str) -> Option<u64> {
        let stem = name.strip_suffix(".log")?;
        if stem.len() != 20 {
            return None;
        }
        stem.parse().ok()
    }

    /// Creates an empty segment.
    pub(crate) fn create(dir: &Path, base: u64) -> Result<Self> {
        let path = Self::path_for(dir, base);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            base,
            path,
            file,
            size,
        })
    }

    /// Opens an existing segment for appending.
    ///
    /// Frames are validated from the start; a torn or damaged tail is cut
    /// off so later appends stay readable. Returns the segment and the
    /// offset of its last valid entry.
    pub(crate) fn recover(dir: &Path, base: u64) -> Result<(Self, Option<u64>)> {
        let mut segment = Self::create(dir, base)?;
        let mut reader = FrameReader::new(BufReader::new(File::open(&segment.path)?));
        let mut last = None;
        let damage = loop {
            match reader.next_frame()? {
                Frame::Entry(entry) => {
                    let expected = last.map_or(base, |l: u64| l + 1);
                    if entry.offset != expected {
                        break Some(format!(
                            "offset {} out of sequence, expected {expected}",
                            entry.offset
                        ));
                    }
                    last = Some(entry.offset);
                }
                Frame::End => break None,
                Frame::Damaged { reason, .. } => break Some(reason),
            }
        };

        if let Some(reason) = damage {
            let valid = reader.valid_len();
            warn!(
                segment = %segment.path.display(),
                valid_bytes = valid,
                dropped_bytes = segment.size.saturating_sub(valid),
                reason = %reason,
                "truncating damaged commit log tail"
            );
            segment.file.set_len(valid)?;
            segment.file.sync_all()?;
            segment.size = valid;
        }
        Ok((segment, last))
    }

    /// Writes a whole frame and flushes it to disk.
    ///
    /// The file never keeps bytes past the last whole frame: a failed write
    /// is cut back before the error is returned, and anything found beyond
    /// the tracked size is cut before the next frame goes in.
    pub(crate) fn append(&mut self, frame: &[u8]) -> Result<()> {
        use std::io::Write;
        let on_disk = self.file.metadata()?.len();
        if on_disk != self.size {
            warn!(
                segment = %self.path.display(),
                dropped_bytes = on_disk.saturating_sub(self.size),
                "cutting bytes past the last whole frame"
            );
            self.file.set_len(self.size)?;
        }
        let written = self
            .file
            .write_all(frame)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            self.file.set_len(self.size)?;
            return Err(e.into());
        }
        self.size += frame.len() as u64;
        Ok(())
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

/// Entry-by-entry reader over one segment file.
///
/// A damaged frame ends the scan. When `sealed` is set the segment is not
/// the active one, so damage is reported as [`Error::Corrupt`]; otherwise it
/// is a torn tail and the scan stops quietly.
pub(crate) struct SegmentScan {
    path: PathBuf,
    sealed: bool,
    reader: FrameReader<BufReader<File>>,
}

impl SegmentScan {
    pub(crate) fn open(path: PathBuf, sealed: bool) -> Result<Self> {
        let reader = FrameReader::new(BufReader::new(File::open(&path)?));
        Ok(Self {
            path,
            sealed,
            reader,
        })
    }

    /// Next entry, or `None` at the end of the readable frames.
    pub(crate) fn next_entry(&mut self) -> Result<Option<Entry>> {
        match self.reader.next_frame()? {
            Frame::Entry(entry) => Ok(Some(entry)),
            Frame::End => Ok(None),
            Frame::Damaged { offset, reason } => {
                if self.sealed {
                    return Err(Error::Corrupt {
                        offset: offset.unwrap_or_default(),
                        reason: format!("{}: {reason}", self.path.display()),
                    });
                }
                warn!(segment = %self.path.display(), reason = %reason, "skipping torn commit log tail");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn set(ns: &str, value: serde_json::Value) -> MessageSet {
        let mut set = MessageSet::sync(Message::from_value(Op::Update, ns, value));
        set.timestamp = 1_700_000_000_000;
        set
    }

    fn frame(offset: u64, set: &MessageSet) -> Vec<u8> {
        encode_frame(offset, &encode_payload(set).unwrap()).unwrap()
    }

    #[test]
    fn test_frame_layout() {
        let bytes = frame(7, &set("users", json!({"a": 1})));
        assert_eq!(u64::from_le_bytes(fixed(&bytes[0..8])), 7);
        let size = u32::from_le_bytes(fixed(&bytes[8..12])) as usize;
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + size);
        let payload = &bytes[FRAME_HEADER_SIZE..];
        assert_eq!(u32::from_le_bytes(fixed(&bytes[12..16])), crc32fast::hash(payload));
        assert_eq!(payload[8], Op::Update.code());
        assert_eq!(payload[9], Mode::Sync.code());
        assert_eq!(&payload[14..19], b"users");
        assert_eq!(&payload[19..], br#"{"a":1}"#);
    }

    #[test]
    fn test_reader_decodes_entries() {
        let mut bytes = frame(0, &set("a", json!({"x": 1})));
        bytes.extend(frame(1, &set("b", json!({"y": [1, 2]}))));
        let mut reader = FrameReader::new(Cursor::new(bytes.clone()));

        let Frame::Entry(first) = reader.next_frame().unwrap() else {
            panic!("entry expected");
        };
        assert_eq!(first.offset, 0);
        assert_eq!(first.key, "a");
        assert_eq!(first.timestamp, 1_700_000_000_000);

        let Frame::Entry(second) = reader.next_frame().unwrap() else {
            panic!("entry expected");
        };
        let restored = second.into_message_set();
        assert_eq!(restored.mode, Mode::Sync);
        assert_eq!(restored.msg.op, Op::Update);
        assert_eq!(restored.msg.data.get("y"), Some(&json!([1, 2])));

        assert!(matches!(reader.next_frame().unwrap(), Frame::End));
        assert_eq!(reader.valid_len(), bytes.len() as u64);
    }

    #[test]
    fn test_torn_and_corrupt_frames() {
        let whole = frame(0, &set("a", json!({"x": 1})));

        let mut reader = FrameReader::new(Cursor::new(whole[..10].to_vec()));
        assert!(matches!(reader.next_frame().unwrap(), Frame::Damaged { offset: None, .. }));

        let mut reader = FrameReader::new(Cursor::new(whole[..whole.len() - 1].to_vec()));
        assert!(matches!(reader.next_frame().unwrap(), Frame::Damaged { offset: Some(0), .. }));

        let mut flipped = whole.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        let mut reader = FrameReader::new(Cursor::new(flipped));
        match reader.next_frame().unwrap() {
            Frame::Damaged { reason, .. } => assert_eq!(reason, "crc mismatch"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reader.valid_len(), 0);
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(
            Segment::path_for(Path::new("/log"), 42),
            Path::new("/log/00000000000000000042.log")
        );
        assert_eq!(Segment::parse_name("00000000000000000042.log"), Some(42));
        assert_eq!(Segment::parse_name("42.log"), None);
        assert_eq!(Segment::parse_name("checkpoint.json"), None);
    }
}
