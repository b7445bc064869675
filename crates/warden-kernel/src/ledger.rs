//! Durable, append-only, hash-chained ledger.
//!
//! One canonical-JSON entry per LF-delimited line. Every append writes,
//! flushes, and fsyncs before returning; a checkpoint file recording the
//! last `(seq, entry_hash)` is rewritten (atomically, fsynced) every
//! [`checkpoint interval`](crate::config::DEFAULT_CHECKPOINT_INTERVAL)
//! entries. On open, the writer recovers by scanning forward from the
//! start, truncating a corrupt or partial final line; corruption anywhere
//! else is fatal and left for an operator.
//!
//! A single OS-level exclusive lock guards the file: a second writer gets
//! [`LedgerError::Locked`] instead of interleaved lines.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use warden_core::chain::{self, EventType, LedgerEntry, LineError};
use warden_core::hashing::Digest;

use crate::fs_atomic;

/// Last-known-good marker persisted beside the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Sequence number of the last entry covered.
    pub seq: u64,
    /// Its entry hash.
    pub entry_hash: Digest,
}

/// Ledger failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Another process holds the ledger lock.
    #[error("ledger is locked by another writer: {}", path.display())]
    Locked {
        /// The contended path.
        path: PathBuf,
    },

    /// An entry before the tail failed to decode or chain.
    #[error("corrupt ledger entry at line {line}: {message}")]
    CorruptEntry {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// An append would reuse a sequence number or an outdated head.
    #[error("stale append: expected seq {expected_seq} on {expected_prev}, ledger is at seq {actual_seq}")]
    StaleAppend {
        /// Sequence the caller expected to write.
        expected_seq: u64,
        /// Head hash the caller chained from.
        expected_prev: Digest,
        /// Sequence the ledger would actually assign.
        actual_seq: u64,
    },

    /// The entry could not be encoded.
    #[error(transparent)]
    Encode(#[from] LineError),

    /// The append (or recovery) hit an I/O failure; the episode must abort.
    #[error("ledger append failed during {context}: {source}")]
    AppendFailed {
        /// What was being attempted.
        context: &'static str,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint persistence failed.
    #[error("checkpoint write failed: {0}")]
    Checkpoint(#[from] fs_atomic::FsAtomicError),
}

fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> LedgerError {
    move |source| LedgerError::AppendFailed { context, source }
}

/// Exclusive append handle over one ledger file.
#[derive(Debug)]
pub struct Ledger {
    file: File,
    path: PathBuf,
    checkpoint_path: PathBuf,
    checkpoint_interval: u64,
    next_seq: u64,
    head: Digest,
}

impl Ledger {
    /// Opens (creating if needed) and recovers a ledger, taking the
    /// exclusive writer lock.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Locked`] when another writer holds the file,
    /// [`LedgerError::CorruptEntry`] for non-tail corruption, or an I/O
    /// error.
    pub fn open(
        path: &Path,
        checkpoint_path: &Path,
        checkpoint_interval: u64,
    ) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err("create run_logs directory"))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(io_err("open ledger file"))?;

        file.try_lock_exclusive().map_err(|_| LedgerError::Locked {
            path: path.to_path_buf(),
        })?;

        let mut ledger = Self {
            file,
            path: path.to_path_buf(),
            checkpoint_path: checkpoint_path.to_path_buf(),
            checkpoint_interval: checkpoint_interval.max(1),
            next_seq: 0,
            head: Digest::ZERO,
        };
        ledger.recover()?;
        Ok(ledger)
    }

    /// Scans the file forward, truncating a bad tail and positioning the
    /// writer after the last good entry.
    fn recover(&mut self) -> Result<(), LedgerError> {
        let raw = fs::read(&self.path).map_err(io_err("read ledger for recovery"))?;

        let mut offset: usize = 0;
        let mut good_end: usize = 0;
        let mut line_no: usize = 0;
        let mut expected_seq: u64 = 0;
        let mut head = Digest::ZERO;

        while offset < raw.len() {
            let Some(nl) = raw[offset..].iter().position(|&b| b == b'\n') else {
                // Partial final line: truncate it away.
                warn!(
                    path = %self.path.display(),
                    at = offset,
                    "truncating partial ledger tail"
                );
                break;
            };
            let line_end = offset + nl;
            line_no += 1;

            let check = std::str::from_utf8(&raw[offset..line_end])
                .map_err(|e| e.to_string())
                .and_then(|text| chain::decode_line(text).map_err(|e| e.to_string()))
                .and_then(|entry| verify_next(&entry, expected_seq, &head).map(|()| entry));

            match check {
                Ok(entry) => {
                    head = entry.entry_hash;
                    expected_seq += 1;
                    good_end = line_end + 1;
                    offset = line_end + 1;
                },
                Err(message) => {
                    let is_tail = raw[line_end + 1..].iter().all(|&b| b == b'\n');
                    if is_tail {
                        warn!(
                            path = %self.path.display(),
                            line = line_no,
                            %message,
                            "truncating corrupt ledger tail"
                        );
                        break;
                    }
                    return Err(LedgerError::CorruptEntry {
                        line: line_no,
                        message,
                    });
                },
            }
        }

        if good_end < raw.len() {
            self.file
                .set_len(good_end as u64)
                .map_err(io_err("truncate corrupt tail"))?;
            self.file
                .sync_all()
                .map_err(io_err("fsync after truncation"))?;
        }

        self.next_seq = expected_seq;
        self.head = head;

        match Self::read_checkpoint(&self.checkpoint_path) {
            Some(cp) if cp.seq >= self.next_seq && self.next_seq > 0 => {
                warn!(
                    checkpoint_seq = cp.seq,
                    ledger_seq = self.next_seq,
                    "checkpoint is ahead of the recovered ledger"
                );
            },
            _ => {},
        }

        debug!(
            path = %self.path.display(),
            next_seq = self.next_seq,
            "ledger recovered"
        );
        Ok(())
    }

    /// The sequence number the next append will receive.
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Hash of the current last entry ([`Digest::ZERO`] when empty).
    #[must_use]
    pub const fn head(&self) -> Digest {
        self.head
    }

    /// Appends one event, fsyncing before returning.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on encoding or I/O failure; the caller must
    /// treat the episode as unfinished.
    pub fn append(
        &mut self,
        event_type: EventType,
        payload: Value,
        ts_micros: u64,
    ) -> Result<LedgerEntry, LedgerError> {
        let expected_seq = self.next_seq;
        let expected_prev = self.head;
        self.append_checked(expected_seq, &expected_prev, event_type, payload, ts_micros)
    }

    /// Appends one event, refusing duplicate sequence numbers and stale
    /// heads.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StaleAppend`] when `expected_seq` or
    /// `expected_prev` no longer match the ledger head, or any append
    /// failure.
    pub fn append_checked(
        &mut self,
        expected_seq: u64,
        expected_prev: &Digest,
        event_type: EventType,
        payload: Value,
        ts_micros: u64,
    ) -> Result<LedgerEntry, LedgerError> {
        if expected_seq != self.next_seq || *expected_prev != self.head {
            return Err(LedgerError::StaleAppend {
                expected_seq,
                expected_prev: *expected_prev,
                actual_seq: self.next_seq,
            });
        }

        let entry = chain::make_entry(expected_seq, ts_micros, self.head, event_type, payload)?;
        let mut line = chain::encode_line(&entry)?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .map_err(io_err("write entry"))?;
        self.file.flush().map_err(io_err("flush entry"))?;
        self.file.sync_all().map_err(io_err("fsync entry"))?;

        self.next_seq = entry.seq + 1;
        self.head = entry.entry_hash;

        if self.next_seq % self.checkpoint_interval == 0 {
            let cp = Checkpoint {
                seq: entry.seq,
                entry_hash: entry.entry_hash,
            };
            fs_atomic::atomic_write_json(&self.checkpoint_path, &cp)?;
            debug!(seq = cp.seq, "ledger checkpoint written");
        }

        Ok(entry)
    }

    /// Reads and decodes every entry of a ledger file (no lock taken).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CorruptEntry`] on the first undecodable
    /// line; chain verification is the replay verifier's job.
    pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
        let raw = fs::read_to_string(path).map_err(io_err("read ledger file"))?;
        let mut entries = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = chain::decode_line(line).map_err(|e| LedgerError::CorruptEntry {
                line: idx + 1,
                message: e.to_string(),
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Loads the checkpoint marker, if one exists and parses.
    #[must_use]
    pub fn read_checkpoint(path: &Path) -> Option<Checkpoint> {
        fs_atomic::bounded_read_json(path, 4096).ok()
    }
}

fn verify_next(entry: &LedgerEntry, expected_seq: u64, head: &Digest) -> Result<(), String> {
    if entry.seq != expected_seq {
        return Err(format!("seq {} where {expected_seq} expected", entry.seq));
    }
    if entry.prev_hash != *head {
        return Err("prev_hash does not match ledger head".to_string());
    }
    let payload = warden_core::canonical::canonicalize_value(&entry.payload)
        .map_err(|e| e.to_string())?;
    let recomputed =
        chain::compute_entry_hash(&entry.prev_hash, entry.seq, entry.ts, entry.event_type, &payload);
    if recomputed != entry.entry_hash {
        return Err("entry hash does not reproduce".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn paths(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        (
            dir.path().join("run_logs/ledger.jsonl"),
            dir.path().join("run_logs/checkpoint"),
        )
    }

    #[test]
    fn appends_chain_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();

        let e0 = ledger
            .append(EventType::EpisodeBegin, json!({"episode_id": "e"}), 100)
            .unwrap();
        let e1 = ledger
            .append(EventType::EpisodeEnd, json!({"episode_id": "e"}), 200)
            .unwrap();
        assert_eq!(e0.seq, 0);
        assert_eq!(e0.prev_hash, Digest::ZERO);
        assert_eq!(e1.prev_hash, e0.entry_hash);

        let entries = Ledger::read_entries(&ledger_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(chain::verify_chain(entries.iter()).unwrap(), 2);
    }

    #[test]
    fn reopen_resumes_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        {
            let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
            ledger
                .append(EventType::EpisodeBegin, json!({"n": 1}), 1)
                .unwrap();
        }
        let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
        assert_eq!(ledger.next_seq(), 1);
        let e = ledger
            .append(EventType::EpisodeEnd, json!({"n": 2}), 2)
            .unwrap();
        assert_eq!(e.seq, 1);
        assert_eq!(
            chain::verify_chain(Ledger::read_entries(&ledger_path).unwrap().iter()).unwrap(),
            2
        );
    }

    #[test]
    fn partial_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        {
            let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
            ledger
                .append(EventType::EpisodeBegin, json!({"n": 1}), 1)
                .unwrap();
        }
        // Simulate a crash mid-append.
        {
            let mut f = OpenOptions::new().append(true).open(&ledger_path).unwrap();
            f.write_all(b"{\"seq\":1,\"ts\":2,\"prev").unwrap();
        }

        let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
        assert_eq!(ledger.next_seq(), 1);
        ledger
            .append(EventType::EpisodeEnd, json!({"n": 2}), 3)
            .unwrap();

        let entries = Ledger::read_entries(&ledger_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(chain::verify_chain(entries.iter()).unwrap(), 2);
    }

    #[test]
    fn corrupt_complete_tail_line_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        {
            let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
            ledger
                .append(EventType::EpisodeBegin, json!({"n": 1}), 1)
                .unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&ledger_path).unwrap();
            f.write_all(b"garbage line\n").unwrap();
        }
        let ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
        assert_eq!(ledger.next_seq(), 1);
    }

    #[test]
    fn corruption_before_the_tail_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        {
            let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
            ledger
                .append(EventType::EpisodeBegin, json!({"n": 1}), 1)
                .unwrap();
            ledger
                .append(EventType::EpisodeEnd, json!({"n": 2}), 2)
                .unwrap();
        }
        // Corrupt the first line while keeping the second intact.
        let text = fs::read_to_string(&ledger_path).unwrap();
        let mut lines: Vec<String> = text.lines().map(String::from).collect();
        lines[0] = lines[0].replace("episode_begin", "episode_BEGIN");
        fs::write(&ledger_path, lines.join("\n") + "\n").unwrap();

        let err = Ledger::open(&ledger_path, &cp_path, 64).unwrap_err();
        assert!(matches!(err, LedgerError::CorruptEntry { line: 1, .. }), "{err}");
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        let _first = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
        let second = Ledger::open(&ledger_path, &cp_path, 64);
        assert!(matches!(second, Err(LedgerError::Locked { .. })));
    }

    #[test]
    fn checkpoint_is_written_on_the_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        let mut ledger = Ledger::open(&ledger_path, &cp_path, 2).unwrap();

        ledger
            .append(EventType::EpisodeBegin, json!({"n": 0}), 1)
            .unwrap();
        assert!(Ledger::read_checkpoint(&cp_path).is_none());

        let e1 = ledger
            .append(EventType::EpisodeEnd, json!({"n": 1}), 2)
            .unwrap();
        let cp = Ledger::read_checkpoint(&cp_path).unwrap();
        assert_eq!(cp.seq, 1);
        assert_eq!(cp.entry_hash, e1.entry_hash);
    }

    #[test]
    fn stale_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger_path, cp_path) = paths(&dir);
        let mut ledger = Ledger::open(&ledger_path, &cp_path, 64).unwrap();
        let e0 = ledger
            .append(EventType::EpisodeBegin, json!({"n": 0}), 1)
            .unwrap();

        // Duplicate seq.
        let dup = ledger.append_checked(0, &Digest::ZERO, EventType::EpisodeEnd, json!({}), 2);
        assert!(matches!(dup, Err(LedgerError::StaleAppend { .. })));

        // Right seq, stale head.
        let stale = ledger.append_checked(1, &Digest::ZERO, EventType::EpisodeEnd, json!({}), 2);
        assert!(matches!(stale, Err(LedgerError::StaleAppend { .. })));

        // Correct linkage goes through.
        assert!(ledger
            .append_checked(1, &e0.entry_hash, EventType::EpisodeEnd, json!({}), 2)
            .is_ok());
    }
}
