//! Write-ahead log
//!
//! The durable, authoritative record of every message transition. Records are
//! self-delimiting — `[len u32 BE][crc32 u32 BE][json payload]` — and a write
//! returns only after the bytes have reached stable storage. The message
//! store is a projection of this log and can always be rebuilt from it.
//!
//! On startup the log is scanned front to back; a record that fails its CRC
//! (a torn tail from a crash mid-write) ends the scan. Replay keeps the
//! latest state per `message_id` and republishes whatever is not terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{EngineError, Result};

const WAL_FILE_NAME: &str = "engine.wal";
const RECORD_HEADER_BYTES: usize = 8;

/// One appended transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    pub envelope: Envelope,
    pub recorded_at: DateTime<Utc>,
}

struct WalInner {
    file: File,
}

/// Append-only durable log. `fsync` is serialised by the internal lock.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    /// Opens (creating if needed) the log under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| EngineError::durability(format!("create wal dir: {e}")))?;
        let path = dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::durability(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            inner: Mutex::new(WalInner { file }),
        })
    }

    /// Appends one envelope transition and flushes it to stable storage
    /// before returning. Failure here is fatal for the message: the caller
    /// must NACK upstream.
    pub fn append_sync(&self, envelope: &Envelope) -> Result<()> {
        let record = WalRecord {
            envelope: envelope.clone(),
            recorded_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&record)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| EngineError::durability("record exceeds u32 length"))?;
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(RECORD_HEADER_BYTES + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&payload);

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::durability("wal lock poisoned"))?;
        inner
            .file
            .write_all(&frame)
            .map_err(|e| EngineError::durability(format!("append: {e}")))?;
        inner
            .file
            .sync_data()
            .map_err(|e| EngineError::durability(format!("fsync: {e}")))?;
        Ok(())
    }

    /// Async wrapper: the fsync happens on the blocking pool.
    pub async fn append(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        let wal = Arc::clone(self);
        tokio::task::spawn_blocking(move || wal.append_sync(&envelope))
            .await
            .map_err(|e| EngineError::durability(format!("append task: {e}")))?
    }

    /// Scans the log and returns every decodable record in write order.
    /// A corrupt record ends the scan: everything after a torn write is
    /// unreachable by construction.
    pub fn scan(&self) -> Result<Vec<WalRecord>> {
        let mut data = Vec::new();
        File::open(&self.path)
            .map_err(|e| EngineError::durability(format!("open for scan: {e}")))?
            .read_to_end(&mut data)
            .map_err(|e| EngineError::durability(format!("scan read: {e}")))?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while data.len() - offset >= RECORD_HEADER_BYTES {
            let len =
                u32::from_be_bytes(data[offset..offset + 4].try_into().expect("4 bytes")) as usize;
            let crc = u32::from_be_bytes(data[offset + 4..offset + 8].try_into().expect("4 bytes"));
            let body_start = offset + RECORD_HEADER_BYTES;

            if data.len() - body_start < len {
                warn!(offset, "wal ends with a torn record; truncating scan");
                break;
            }
            let payload = &data[body_start..body_start + len];
            if crc32fast::hash(payload) != crc {
                warn!(offset, "wal record failed crc; truncating scan");
                break;
            }
            match serde_json::from_slice::<WalRecord>(payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(offset, error = %e, "undecodable wal record; truncating scan");
                    break;
                }
            }
            offset = body_start + len;
        }

        debug!(count = records.len(), "wal scan complete");
        Ok(records)
    }

    /// Replay set: for each message whose *latest* recorded state is not
    /// terminal, the latest envelope, ordered by the write position of that
    /// latest record. Replaying a log of terminal records is a no-op.
    /// At-most-once messages are never redelivered.
    pub fn replay(&self) -> Result<Vec<Envelope>> {
        let records = self.scan()?;

        let mut latest: std::collections::HashMap<crate::domain::MessageId, usize> =
            std::collections::HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            latest.insert(record.envelope.message_id, idx);
        }

        let mut indices: Vec<usize> = latest.into_values().collect();
        indices.sort_unstable();

        Ok(indices
            .into_iter()
            .map(|idx| records[idx].envelope.clone())
            .filter(|envelope| {
                !envelope.state.is_terminal()
                    && envelope.delivery_mode == crate::domain::DeliveryMode::AtLeastOnce
            })
            .collect())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageState;
    use crate::envelope::Payload;

    fn envelope(state: MessageState) -> Envelope {
        Envelope::new("hl7.message", Payload::hl7(b"MSH|^~\\&|A|B".to_vec())).with_state(state)
    }

    #[test_log::test]
    fn append_then_scan_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        let env = envelope(MessageState::Received);
        wal.append_sync(&env).unwrap();
        wal.append_sync(&env.clone().with_state(MessageState::Enqueued))
            .unwrap();

        let records = wal.scan().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].envelope.message_id, env.message_id);
        assert_eq!(records[1].envelope.state, MessageState::Enqueued);
    }

    #[test_log::test]
    fn replay_keeps_latest_state_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        let first = envelope(MessageState::Received);
        let second = envelope(MessageState::Received);

        wal.append_sync(&first).unwrap();
        wal.append_sync(&second).unwrap();
        wal.append_sync(&first.clone().with_state(MessageState::Delivered))
            .unwrap();

        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].message_id, second.message_id);
    }

    #[test_log::test]
    fn replay_of_all_terminal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        for state in [
            MessageState::Delivered,
            MessageState::Failed,
            MessageState::Expired,
            MessageState::DeadLettered,
        ] {
            wal.append_sync(&envelope(state)).unwrap();
        }

        assert!(wal.replay().unwrap().is_empty());
    }

    #[test_log::test]
    fn replay_preserves_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        let envs: Vec<Envelope> = (0..5).map(|_| envelope(MessageState::Enqueued)).collect();
        for env in &envs {
            wal.append_sync(env).unwrap();
        }

        let replayed = wal.replay().unwrap();
        let ids: Vec<_> = replayed.iter().map(|e| e.message_id).collect();
        let expected: Vec<_> = envs.iter().map(|e| e.message_id).collect();
        assert_eq!(ids, expected);
    }

    #[test_log::test]
    fn at_most_once_messages_are_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        let mut fire_and_forget = envelope(MessageState::Enqueued);
        fire_and_forget.delivery_mode = crate::domain::DeliveryMode::AtMostOnce;
        wal.append_sync(&fire_and_forget).unwrap();
        wal.append_sync(&envelope(MessageState::Enqueued)).unwrap();

        let replayed = wal.replay().unwrap();
        assert_eq!(replayed.len(), 1);
        assert_ne!(replayed[0].message_id, fire_and_forget.message_id);
    }

    #[test_log::test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        wal.append_sync(&envelope(MessageState::Enqueued)).unwrap();

        // Simulate a crash mid-write: garbage header at the tail.
        {
            let mut file = OpenOptions::new().append(true).open(wal.path()).unwrap();
            file.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3]).unwrap();
        }

        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.scan().unwrap().len(), 1);
    }

    #[test_log::test]
    fn corrupt_crc_truncates_scan() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        wal.append_sync(&envelope(MessageState::Enqueued)).unwrap();
        let good_len = std::fs::metadata(wal.path()).unwrap().len();
        wal.append_sync(&envelope(MessageState::Enqueued)).unwrap();

        // Flip a payload byte in the second record.
        let mut data = std::fs::read(wal.path()).unwrap();
        let idx = good_len as usize + RECORD_HEADER_BYTES + 4;
        data[idx] ^= 0xFF;
        std::fs::write(wal.path(), &data).unwrap();

        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.scan().unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn async_append_goes_through_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path()).unwrap());
        wal.append(envelope(MessageState::Received)).await.unwrap();
        assert_eq!(wal.scan().unwrap().len(), 1);
    }
}
