//! Append-only audit trail.
//!
//! Every record is one JSON line carrying a sequence number and a SHA-256
//! hash chained to the previous record, so truncation or edits inside the live
//! file are detectable with [`AuditLog::verify_chain`].

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

/// Receiver of structured audit events. Recording never fails from the
/// caller's point of view; sinks log their own errors.
pub trait AuditSink: Send + Sync {
    fn record(&self, event_type: &str, details: serde_json::Value);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub details: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Durable JSON-lines audit log with size-based rotation.
pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

/// First broken link found by [`AuditLog::verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub seq: u64,
    pub reason: String,
}

impl AuditLog {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        if !path.exists() {
            return Ok((0, CHAIN_START.to_string()));
        }
        let reader = BufReader::new(File::open(path)?);
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEvent = serde_json::from_str(&line)?;
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn append(&self, event_type: &str, details: serde_json::Value) -> Result<AuditEvent> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let mut entry_value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event_type": event_type,
            "details": details,
            "prev_hash": state.last_hash,
        });
        let hash = Self::compute_hash(&entry_value);
        entry_value["hash"] = serde_json::Value::String(hash.clone());

        let line = entry_value.to_string();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;

        state.last_seq = seq;
        state.last_hash = hash;
        Ok(serde_json::from_value(entry_value)?)
    }

    fn rotate_if_needed(&self, state: &mut LogState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if !rotated.exists() {
                continue;
            }
            if i == MAX_ROTATIONS {
                fs::remove_file(&rotated)?;
            } else {
                fs::rename(&rotated, self.path_with_suffix(i + 1))?;
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1))?;
        // each file carries its own chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Newest-first, optionally filtered by `since` and capped at `limit`.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEvent = serde_json::from_str(&line)?;
            if let Some(since_ts) = &since {
                if entry.timestamp < *since_ts {
                    continue;
                }
            }
            entries.push(entry);
        }
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Re-derives every hash of the live file. `Ok(None)` means intact.
    pub fn verify_chain(&self) -> Result<Option<ChainBreak>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut expected_prev = CHAIN_START.to_string();
        let mut last_seq: Option<u64> = None;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut value: serde_json::Value = serde_json::from_str(&line)?;
            let seq = value["seq"].as_u64().unwrap_or_default();
            let stored = value
                .as_object_mut()
                .and_then(|m| m.remove("hash"))
                .and_then(|h| h.as_str().map(str::to_string))
                .ok_or_else(|| anyhow!("audit record without hash near seq {seq}"))?;

            if let Some(prev_seq) = last_seq {
                if seq != prev_seq + 1 {
                    return Ok(Some(ChainBreak {
                        seq,
                        reason: format!("sequence jumps from {prev_seq}"),
                    }));
                }
            }
            if value["prev_hash"].as_str() != Some(expected_prev.as_str()) {
                return Ok(Some(ChainBreak {
                    seq,
                    reason: "previous hash mismatch".to_string(),
                }));
            }
            if Self::compute_hash(&value) != stored {
                return Ok(Some(ChainBreak {
                    seq,
                    reason: "record hash mismatch".to_string(),
                }));
            }
            expected_prev = stored;
            last_seq = Some(seq);
        }
        Ok(None)
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let mut raw = self.path.as_os_str().to_os_string();
        raw.push(format!(".{index}"));
        PathBuf::from(raw)
    }
}

impl AuditSink for AuditLog {
    fn record(&self, event_type: &str, details: serde_json::Value) {
        if let Err(e) = self.append(event_type, details) {
            warn!(event_type, error = %e, path = %self.path.display(), "failed to write audit record");
        }
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event_type: &str, _details: serde_json::Value) {}
}

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event_type: &str, details: serde_json::Value) {
        let mut events = self.events.lock();
        let seq = events.len() as u64 + 1;
        events.push(AuditEvent {
            seq,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            details,
            prev_hash: String::new(),
            hash: String::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_and_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path, 512).unwrap();
        for i in 0..50 {
            let e = log
                .append("file_encrypted", serde_json::json!({"i": i}))
                .unwrap();
            assert!(!e.hash.is_empty());
            assert_eq!(e.seq as usize, i + 1);
        }
        assert!(path.with_file_name("audit.log.1").exists());
        assert!(!path.with_file_name("audit.log.6").exists());
        assert_eq!(log.verify_chain().unwrap(), None);
    }

    #[test]
    fn resumes_sequence_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let log = AuditLog::open(&path, 1 << 20).unwrap();
            log.append("a", serde_json::json!({})).unwrap();
            log.append("b", serde_json::json!({})).unwrap();
        }
        let log = AuditLog::open(&path, 1 << 20).unwrap();
        let e = log.append("c", serde_json::json!({})).unwrap();
        assert_eq!(e.seq, 3);
        assert_eq!(log.verify_chain().unwrap(), None);

        let recent = log.read_recent(None, Some(2)).unwrap();
        let kinds: Vec<_> = recent.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["c", "b"]);
    }

    #[test]
    fn edited_record_breaks_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path, 1 << 20).unwrap();
        log.append("file_encrypted", serde_json::json!({"size_bytes": 10}))
            .unwrap();
        log.append("file_encrypted", serde_json::json!({"size_bytes": 20}))
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("\"size_bytes\":10", "\"size_bytes\":11", 1)).unwrap();

        let broken = log.verify_chain().unwrap().unwrap();
        assert_eq!(broken.seq, 1);
        assert_eq!(broken.reason, "record hash mismatch");
    }

    #[test]
    fn sink_records_in_emission_order() {
        let sink = MemoryAuditSink::new();
        sink.record("one", serde_json::json!({"k": 1}));
        sink.record("two", serde_json::json!({}));
        sink.record("one", serde_json::json!({"k": 2}));
        assert_eq!(sink.count("one"), 2);
        let events = sink.events();
        assert_eq!(events[1].event_type, "two");
        assert_eq!(sink.of_type("one")[1].details["k"], 2);
    }
}
