//! Write-ahead log of replicated operations (oplog)
//!
//! Every write lands in the oplog before it is acknowledged. Entries written
//! by a retryable-write transaction carry the session, the transaction number,
//! the statement id and a link to the previous write of the same transaction,
//! which lets the history of a transaction be walked backward from its most
//! recent write.
//!
//! ## File format
//! ```text
//! [len: u32][ts: u64][header_crc: u32][bincode(OplogFrame)]  repeated
//! ```
//! The header checksum covers `len` and `ts`; each frame holds the entry and a
//! CRC32 checksum of the serialized entry.
//!
//! ## Recovery
//! Opening an existing log scans it front to back:
//! - a record whose payload fails its checksum is skipped, but its timestamp
//!   still counts as used so it is never handed out again
//! - a record cut short by the end of the file is a torn tail and is truncated
//! - a header that does not verify before the end of the file is corruption,
//!   and opening fails without touching the file

use crate::config::{DurabilityLevel, OplogConfig};
use crate::storage::checksum::Checksum;
use crate::types::{SessionId, StmtId, TxnNumber, WriteTimestamp};
use crate::{Result, SessionError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of oplog entries for history walks
pub trait OplogReader: Send + Sync {
    /// Look up the entry written at `ts`
    fn find_entry(&self, ts: WriteTimestamp) -> Result<Option<OplogEntry>>;
}

/// Operation kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Noop,
}

/// One oplog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OplogEntry {
    pub ts: WriteTimestamp,
    pub session_id: Option<SessionId>,
    pub txn_number: Option<TxnNumber>,
    pub stmt_id: Option<StmtId>,
    /// Previous write of the same transaction (None or null ends the chain)
    pub prev_write_ts_in_txn: Option<WriteTimestamp>,
    pub op: OpKind,
    pub namespace: String,
    pub document: Vec<u8>,
}

/// An entry before the log assigns its timestamp
#[derive(Debug, Clone)]
pub struct OplogDraft {
    pub session_id: Option<SessionId>,
    pub txn_number: Option<TxnNumber>,
    pub stmt_id: Option<StmtId>,
    pub prev_write_ts_in_txn: Option<WriteTimestamp>,
    pub op: OpKind,
    pub namespace: String,
    pub document: Vec<u8>,
}

impl OplogDraft {
    /// A write outside any session
    pub fn new(op: OpKind, namespace: impl Into<String>, document: Vec<u8>) -> Self {
        Self {
            session_id: None,
            txn_number: None,
            stmt_id: None,
            prev_write_ts_in_txn: None,
            op,
            namespace: namespace.into(),
            document,
        }
    }

    /// Tag the write as statement `stmt_id` of a session transaction
    pub fn in_transaction(
        mut self,
        session_id: SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
        prev_write_ts_in_txn: WriteTimestamp,
    ) -> Self {
        self.session_id = Some(session_id);
        self.txn_number = Some(txn_number);
        self.stmt_id = Some(stmt_id);
        self.prev_write_ts_in_txn = Some(prev_write_ts_in_txn);
        self
    }

    fn into_entry(self, ts: WriteTimestamp) -> OplogEntry {
        OplogEntry {
            ts,
            session_id: self.session_id,
            txn_number: self.txn_number,
            stmt_id: self.stmt_id,
            prev_write_ts_in_txn: self.prev_write_ts_in_txn,
            op: self.op,
            namespace: self.namespace,
            document: self.document,
        }
    }
}

/// On-disk frame: entry plus checksum of its serialized form
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OplogFrame {
    entry: OplogEntry,
    checksum: u32,
}

/// `len` + `ts` + `header_crc`
const FRAME_HEADER_LEN: u64 = 4 + 8 + 4;

/// Fixed-size frame header, checksummed on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    len: u32,
    ts: WriteTimestamp,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN as usize] {
        let mut buf = [0u8; FRAME_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..12].copy_from_slice(&self.ts.value().to_le_bytes());
        let crc = Checksum::compute(&buf[0..12]);
        buf[12..16].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; FRAME_HEADER_LEN as usize]) -> Option<Self> {
        let crc = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        if Checksum::verify(&buf[0..12], crc).is_err() {
            return None;
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&buf[4..12]);
        Some(Self {
            len,
            ts: WriteTimestamp::new(u64::from_le_bytes(ts_bytes)),
        })
    }
}

/// Mutable file state, guarded by the log mutex
struct OplogFile {
    file: File,
    /// ts -> offset of the frame header
    index: BTreeMap<WriteTimestamp, u64>,
    last_ts: WriteTimestamp,
    end_offset: u64,
}

/// Background flush thread (Periodic mode)
struct FlushThread {
    handle: Option<thread::JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
}

pub struct OpLog {
    path: PathBuf,
    inner: Arc<Mutex<OplogFile>>,
    config: OplogConfig,
    flush_thread: Option<FlushThread>,
}

impl OpLog {
    /// Open the log at `path`, creating it if missing and recovering it otherwise
    pub fn open<P: AsRef<Path>>(path: P, config: OplogConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let (index, last_ts, end_offset) = Self::recover(&mut file)?;

        let inner = Arc::new(Mutex::new(OplogFile {
            file,
            index,
            last_ts,
            end_offset,
        }));

        let flush_thread = Self::start_flush_thread_if_needed(&config, inner.clone());

        Ok(Self {
            path,
            inner,
            config,
            flush_thread,
        })
    }

    /// Scan the file, rebuild the index and drop a torn tail
    fn recover(file: &mut File) -> Result<(BTreeMap<WriteTimestamp, u64>, WriteTimestamp, u64)> {
        let file_len = file.metadata()?.len();
        let mut index = BTreeMap::new();
        let mut last_ts = WriteTimestamp::NULL;
        let mut offset = 0u64;
        let mut corrupted_count = 0;

        file.seek(SeekFrom::Start(0))?;

        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < FRAME_HEADER_LEN {
                warn!(offset, remaining, "oplog recovery: partial header at end of file, truncating");
                break;
            }

            let mut header_buf = [0u8; FRAME_HEADER_LEN as usize];
            file.read_exact(&mut header_buf)?;
            let header = FrameHeader::decode(&header_buf).ok_or_else(|| {
                SessionError::Corruption(format!(
                    "oplog frame header at offset {} does not verify",
                    offset
                ))
            })?;

            // A verified header is trusted, so its ts is used even if the payload is lost
            last_ts = last_ts.max(header.ts);

            let frame_len = FRAME_HEADER_LEN + header.len as u64;
            if frame_len > remaining {
                warn!(offset, ts = %header.ts, "oplog recovery: partial write at end of file, truncating");
                break;
            }

            let mut buf = vec![0u8; header.len as usize];
            file.read_exact(&mut buf)?;

            let frame_offset = offset;
            offset += frame_len;

            match Self::decode_frame(&buf) {
                Ok(entry) if entry.ts == header.ts => {
                    index.insert(entry.ts, frame_offset);
                }
                _ => {
                    corrupted_count += 1;
                    warn!(offset = frame_offset, ts = %header.ts, "oplog recovery: skipped corrupted record");
                }
            }
        }

        if corrupted_count > 0 {
            warn!(corrupted_count, "oplog recovery: skipped corrupted records");
        }

        if offset < file_len {
            // Appends must not land after a torn record
            file.set_len(offset)?;
        }

        Ok((index, last_ts, offset))
    }

    fn decode_frame(buf: &[u8]) -> Result<OplogEntry> {
        let frame: OplogFrame = bincode::deserialize(buf)?;
        let entry_data = bincode::serialize(&frame.entry)?;
        Checksum::verify(&entry_data, frame.checksum)?;
        Ok(frame.entry)
    }

    fn start_flush_thread_if_needed(
        config: &OplogConfig,
        inner: Arc<Mutex<OplogFile>>,
    ) -> Option<FlushThread> {
        if let DurabilityLevel::Periodic { interval_ms } = config.durability_level {
            let should_stop = Arc::new(AtomicBool::new(false));
            let should_stop_clone = should_stop.clone();
            let interval = Duration::from_millis(interval_ms);

            let handle = thread::spawn(move || {
                while !should_stop_clone.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    let guard = inner.lock();
                    if let Err(err) = guard.file.sync_data() {
                        warn!(error = %err, "oplog periodic flush failed");
                    }
                }
            });

            Some(FlushThread {
                handle: Some(handle),
                should_stop,
            })
        } else {
            None
        }
    }

    /// Append an entry and return the timestamp assigned to it
    pub fn append(&self, draft: OplogDraft) -> Result<WriteTimestamp> {
        let mut inner = self.inner.lock();

        let ts = inner.last_ts.next().ok_or_else(|| {
            SessionError::InvalidArgument("oplog timestamp space exhausted".to_string())
        })?;
        let entry = draft.into_entry(ts);

        let entry_data = bincode::serialize(&entry)?;
        let checksum = Checksum::compute(&entry_data);
        let encoded = bincode::serialize(&OplogFrame { entry, checksum })?;

        let header = FrameHeader {
            len: Checksum::frame_len(encoded.len())?,
            ts,
        };

        let mut buffer = Vec::with_capacity(FRAME_HEADER_LEN as usize + encoded.len());
        buffer.extend_from_slice(&header.encode());
        buffer.extend_from_slice(&encoded);
        inner.file.write_all(&buffer)?;

        if self.config.durability_level.requires_immediate_sync() {
            inner.file.sync_data()?;
        }

        let offset = inner.end_offset;
        inner.index.insert(ts, offset);
        inner.end_offset += buffer.len() as u64;
        inner.last_ts = ts;

        debug!(%ts, "oplog append");
        Ok(ts)
    }

    /// fsync the log file
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    pub fn last_ts(&self) -> WriteTimestamp {
        self.inner.lock().last_ts
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_frame_at(&self, offset: u64) -> Result<OplogEntry> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut header_buf = [0u8; FRAME_HEADER_LEN as usize];
        file.read_exact(&mut header_buf)?;
        let header = FrameHeader::decode(&header_buf).ok_or_else(|| {
            SessionError::Corruption(format!("oplog frame header at offset {} does not verify", offset))
        })?;

        let mut buf = vec![0u8; header.len as usize];
        file.read_exact(&mut buf)?;

        Self::decode_frame(&buf)
    }
}

impl OplogReader for OpLog {
    fn find_entry(&self, ts: WriteTimestamp) -> Result<Option<OplogEntry>> {
        // Indexed frames are complete and immutable, so the read needs no lock
        let offset = match self.inner.lock().index.get(&ts) {
            Some(offset) => *offset,
            None => return Ok(None),
        };

        self.read_frame_at(offset).map(Some)
    }
}

impl Drop for OpLog {
    fn drop(&mut self) {
        if let Some(mut flush_thread) = self.flush_thread.take() {
            flush_thread.should_stop.store(true, Ordering::Relaxed);
            if let Some(handle) = flush_thread.handle.take() {
                let _ = handle.join();
            }
        }

        let inner = self.inner.lock();
        let _ = inner.file.sync_data();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn testing_config() -> OplogConfig {
        OplogConfig {
            durability_level: DurabilityLevel::NoSync,
        }
    }

    fn insert(doc: &[u8]) -> OplogDraft {
        OplogDraft::new(OpKind::Insert, "app.orders", doc.to_vec())
    }

    #[test]
    fn test_append_assigns_increasing_timestamps() {
        let temp_dir = TempDir::new().unwrap();
        let oplog = OpLog::open(temp_dir.path().join("oplog"), testing_config()).unwrap();

        let ts1 = oplog.append(insert(b"a")).unwrap();
        let ts2 = oplog.append(insert(b"b")).unwrap();

        assert!(!ts1.is_null());
        assert!(ts2 > ts1);
        assert_eq!(oplog.last_ts(), ts2);
        assert_eq!(oplog.len(), 2);
    }

    #[test]
    fn test_find_entry() {
        let temp_dir = TempDir::new().unwrap();
        let oplog = OpLog::open(temp_dir.path().join("oplog"), testing_config()).unwrap();
        let session_id = SessionId::generate();

        let ts = oplog
            .append(insert(b"doc").in_transaction(session_id, 5, 0, WriteTimestamp::NULL))
            .unwrap();

        let entry = oplog.find_entry(ts).unwrap().unwrap();
        assert_eq!(entry.ts, ts);
        assert_eq!(entry.session_id, Some(session_id));
        assert_eq!(entry.txn_number, Some(5));
        assert_eq!(entry.stmt_id, Some(0));
        assert_eq!(entry.document, b"doc".to_vec());

        assert!(oplog.find_entry(ts.next().unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_reopen_recovers_index() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("oplog");

        let (ts1, ts2) = {
            let oplog = OpLog::open(&path, testing_config()).unwrap();
            (
                oplog.append(insert(b"a")).unwrap(),
                oplog.append(insert(b"b")).unwrap(),
            )
        };

        let oplog = OpLog::open(&path, testing_config()).unwrap();
        assert_eq!(oplog.len(), 2);
        assert_eq!(oplog.last_ts(), ts2);
        assert_eq!(oplog.find_entry(ts1).unwrap().unwrap().document, b"a".to_vec());

        // Appends continue after the recovered tail
        let ts3 = oplog.append(insert(b"c")).unwrap();
        assert!(ts3 > ts2);
    }

    #[test]
    fn test_partial_tail_write_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("oplog");

        let (ts1, torn_ts, complete_len) = {
            let oplog = OpLog::open(&path, testing_config()).unwrap();
            let ts1 = oplog.append(insert(b"complete")).unwrap();
            let complete_len = std::fs::metadata(&path).unwrap().len();
            let torn_ts = oplog.append(insert(b"torn record")).unwrap();
            (ts1, torn_ts, complete_len)
        };

        // Simulate a crash midway through the second record
        let full_len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(full_len - 3)
            .unwrap();

        let oplog = OpLog::open(&path, testing_config()).unwrap();
        assert_eq!(oplog.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), complete_len);
        assert!(oplog.find_entry(ts1).unwrap().is_some());

        let ts2 = oplog.append(insert(b"after crash")).unwrap();
        assert!(ts2 > torn_ts);
        assert_eq!(
            oplog.find_entry(ts2).unwrap().unwrap().document,
            b"after crash".to_vec()
        );
    }

    #[test]
    fn test_partial_header_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("oplog");

        let ts1 = {
            let oplog = OpLog::open(&path, testing_config()).unwrap();
            oplog.append(insert(b"complete")).unwrap()
        };

        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB; 7]).unwrap();
        }

        let oplog = OpLog::open(&path, testing_config()).unwrap();
        assert_eq!(oplog.len(), 1);
        assert_eq!(oplog.append(insert(b"next")).unwrap(), ts1.next().unwrap());
    }

    #[test]
    fn test_corrupted_length_fails_open_and_keeps_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("oplog");

        let second_offset = {
            let oplog = OpLog::open(&path, testing_config()).unwrap();
            oplog.append(insert(b"one")).unwrap();
            let second_offset = std::fs::metadata(&path).unwrap().len();
            oplog.append(insert(b"two")).unwrap();
            oplog.append(insert(b"three")).unwrap();
            second_offset
        };

        let mut bytes = std::fs::read(&path).unwrap();
        let original_len = bytes.len();
        bytes[second_offset as usize] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let result = OpLog::open(&path, testing_config());
        assert!(matches!(result, Err(SessionError::Corruption(_))));

        // Later records are still on disk
        let after = std::fs::read(&path).unwrap();
        assert_eq!(after.len(), original_len);
        assert!(after.windows(5).any(|w| w == b"three"));
    }

    #[test]
    fn test_corrupted_record_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("oplog");

        {
            let oplog = OpLog::open(&path, testing_config()).unwrap();
            oplog.append(insert(b"first")).unwrap();
            oplog.append(insert(b"second")).unwrap();
        }

        // Flip the last payload byte of the first record's document
        let mut bytes = std::fs::read(&path).unwrap();
        let pos = bytes
            .windows(5)
            .position(|w| w == b"first")
            .unwrap();
        bytes[pos + 4] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let oplog = OpLog::open(&path, testing_config()).unwrap();
        assert_eq!(oplog.len(), 1);
        assert!(oplog.find_entry(WriteTimestamp::new(1)).unwrap().is_none());
        assert!(oplog.find_entry(WriteTimestamp::new(2)).unwrap().is_some());
    }

    #[test]
    fn test_lost_tail_record_timestamp_is_not_reused() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("oplog");
        let session_a = SessionId::generate();

        let lost_ts = {
            let oplog = OpLog::open(&path, testing_config()).unwrap();
            let ts1 = oplog
                .append(insert(b"a-stmt-0").in_transaction(session_a, 1, 0, WriteTimestamp::NULL))
                .unwrap();
            oplog
                .append(insert(b"a-stmt-1").in_transaction(session_a, 1, 1, ts1))
                .unwrap()
        };

        let mut bytes = std::fs::read(&path).unwrap();
        let pos = bytes
            .windows(8)
            .position(|w| w == b"a-stmt-1")
            .unwrap();
        bytes[pos] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let oplog = OpLog::open(&path, testing_config()).unwrap();
        assert_eq!(oplog.last_ts(), lost_ts);
        assert!(oplog.find_entry(lost_ts).unwrap().is_none());

        let session_b = SessionId::generate();
        let new_ts = oplog
            .append(insert(b"b-stmt-1").in_transaction(session_b, 1, 1, WriteTimestamp::NULL))
            .unwrap();
        assert!(new_ts > lost_ts);
        assert!(oplog.find_entry(lost_ts).unwrap().is_none());
    }

    #[test]
    fn test_append_fails_when_timestamps_are_exhausted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("oplog");

        // A single frame already holding the last possible timestamp
        let entry = insert(b"last").into_entry(WriteTimestamp::new(u64::MAX));
        let checksum = Checksum::compute(&bincode::serialize(&entry).unwrap());
        let payload = bincode::serialize(&OplogFrame { entry, checksum }).unwrap();
        let header = FrameHeader {
            len: payload.len() as u32,
            ts: WriteTimestamp::new(u64::MAX),
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&payload);
        std::fs::write(&path, &bytes).unwrap();

        let oplog = OpLog::open(&path, testing_config()).unwrap();
        assert_eq!(oplog.last_ts(), WriteTimestamp::new(u64::MAX));

        let err = oplog.append(insert(b"overflow")).unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
        assert_eq!(oplog.len(), 1);
    }

    #[test]
    fn test_synchronous_and_periodic_modes() {
        let temp_dir = TempDir::new().unwrap();

        let sync_log = OpLog::open(
            temp_dir.path().join("sync"),
            OplogConfig {
                durability_level: DurabilityLevel::Synchronous,
            },
        )
        .unwrap();
        sync_log.append(insert(b"x")).unwrap();

        let periodic_log = OpLog::open(
            temp_dir.path().join("periodic"),
            OplogConfig {
                durability_level: DurabilityLevel::periodic(5),
            },
        )
        .unwrap();
        let ts = periodic_log.append(insert(b"y")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(periodic_log.find_entry(ts).unwrap().is_some());
    }
}
