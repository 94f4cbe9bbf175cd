//! Append-only write-ahead log of transaction phase transitions.
//!
//! One file per node, one entry per line:
//!
//! ```text
//! timestamp|transactionId|action|status|jsonPayload
//! ```
//!
//! Entries are never rewritten. Recovery folds them into one record per
//! transaction whose last status decides what has to be redone.

use ahash::AHashMap as HashMap;
use chrono::{SecondsFormat, Utc};
use log::{debug, error};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::WalError;

const FIELD_SEPARATOR: char = '|';

/// Phase recorded by a WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalStatus {
    Prepare,
    Ready,
    Commit,
    Abort,
    CommitError,
}

impl WalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalStatus::Prepare => "PREPARE",
            WalStatus::Ready => "READY",
            WalStatus::Commit => "COMMIT",
            WalStatus::Abort => "ABORT",
            WalStatus::CommitError => "COMMIT_ERROR",
        }
    }
}

impl fmt::Display for WalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARE" => Ok(WalStatus::Prepare),
            "READY" => Ok(WalStatus::Ready),
            "COMMIT" => Ok(WalStatus::Commit),
            "ABORT" => Ok(WalStatus::Abort),
            "COMMIT_ERROR" => Ok(WalStatus::CommitError),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    pub timestamp: String,
    pub transaction_id: String,
    pub action: String,
    pub status: WalStatus,
    pub payload: Value,
}

impl WalEntry {
    fn to_line(&self) -> Result<String, WalError> {
        let payload = serde_json::to_string(&self.payload).map_err(|e| WalError::InvalidField {
            field: "payload",
            value: e.to_string(),
        })?;
        Ok(format!(
            "{}|{}|{}|{}|{}\n",
            self.timestamp, self.transaction_id, self.action, self.status, payload
        ))
    }

    fn parse(line: &str, line_no: usize) -> Result<Self, WalError> {
        let corrupt = |reason: String| WalError::Corrupt {
            line: line_no,
            reason,
        };
        let mut fields = line.splitn(5, FIELD_SEPARATOR);
        let (Some(timestamp), Some(transaction_id), Some(action), Some(status), Some(payload)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(corrupt(format!("expected 5 fields in {line:?}")));
        };
        if transaction_id.is_empty() {
            return Err(corrupt("missing transaction id".to_string()));
        }
        let status = status.parse::<WalStatus>().map_err(corrupt)?;
        let payload = if payload.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(payload).map_err(|e| corrupt(format!("bad payload: {e}")))?
        };
        Ok(Self {
            timestamp: timestamp.to_string(),
            transaction_id: transaction_id.to_string(),
            action: action.to_string(),
            status,
            payload,
        })
    }
}

/// A status transition in a transaction's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub status: WalStatus,
    pub timestamp: String,
}

/// Everything the log knows about one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub last_status: WalStatus,
    /// Taken from the most recent entry with a non-empty action.
    pub action: String,
    /// Taken from the most recent entry with a non-empty payload.
    pub payload: Value,
    pub history: Vec<HistoryEntry>,
    /// Line index of the first entry; recovery replays in this order.
    pub first_seen: usize,
}

impl TransactionRecord {
    fn start(entry: &WalEntry, line_no: usize) -> Self {
        Self {
            transaction_id: entry.transaction_id.clone(),
            last_status: entry.status,
            action: String::new(),
            payload: Value::Null,
            history: Vec::new(),
            first_seen: line_no,
        }
    }

    fn fold(&mut self, entry: WalEntry) {
        self.history.push(HistoryEntry {
            status: entry.status,
            timestamp: entry.timestamp,
        });
        self.last_status = entry.status;
        if !entry.action.is_empty() {
            self.action = entry.action;
        }
        if !is_empty_payload(&entry.payload) {
            self.payload = entry.payload;
        }
    }

    /// Whether any entry of this transaction carries `status`.
    pub fn has_status(&self, status: WalStatus) -> bool {
        self.history.iter().any(|entry| entry.status == status)
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn check_field(field: &'static str, value: &str) -> Result<(), WalError> {
    if value.contains(FIELD_SEPARATOR) || value.contains('\n') || value.contains('\r') {
        return Err(WalError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// File-backed write-ahead log.
pub struct WriteAheadLog {
    path: PathBuf,
    file: Mutex<File>,
    fsync: bool,
}

impl WriteAheadLog {
    /// Opens (creating if needed) `<dir>/wal_<node>.log`.
    pub fn open(dir: &Path, node: &str, fsync: bool) -> Result<Self, WalError> {
        fs::create_dir_all(dir)?;
        let file_name = format!("wal_{}.log", sanitize(node));
        Self::open_file(dir.join(file_name), fsync)
    }

    /// Opens (creating if needed) the log at `path`.
    pub fn open_file(path: impl Into<PathBuf>, fsync: bool) -> Result<Self, WalError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Opened WAL at {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably appends one entry. Returns only after the bytes are written
    /// (and synced when fsync is enabled).
    pub fn write_log(
        &self,
        transaction_id: &str,
        action: &str,
        status: WalStatus,
        payload: &Value,
    ) -> Result<(), WalError> {
        check_field("transactionId", transaction_id)?;
        check_field("action", action)?;
        let mut file = self.file.lock();
        let entry = WalEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            transaction_id: transaction_id.to_string(),
            action: action.to_string(),
            status,
            payload: payload.clone(),
        };
        let line = entry.to_line()?;
        let written = file.write_all(line.as_bytes()).and_then(|_| {
            if self.fsync {
                file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            error!("Failed to write WAL entry for {}: {}", transaction_id, e);
            return Err(e.into());
        }
        debug!("WAL {} {} {}", transaction_id, action, status);
        Ok(())
    }

    /// Reads every entry in append order. Any malformed line is an error.
    pub fn entries(&self) -> Result<Vec<WalEntry>, WalError> {
        let _append = self.file.lock();
        let contents = fs::read_to_string(&self.path)?;
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| WalEntry::parse(line, index + 1))
            .collect()
    }

    /// Folds the whole log into one record per transaction id.
    pub fn recover_from_logs(&self) -> Result<HashMap<String, TransactionRecord>, WalError> {
        let mut records: HashMap<String, TransactionRecord> = HashMap::new();
        for (line_no, entry) in self.entries()?.into_iter().enumerate() {
            records
                .entry(entry.transaction_id.clone())
                .or_insert_with(|| TransactionRecord::start(&entry, line_no))
                .fold(entry);
        }
        Ok(records)
    }

    /// Distinct transaction ids in order of first appearance.
    pub fn transaction_ids(&self) -> Result<Vec<String>, WalError> {
        let mut seen = std::collections::HashSet::new();
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| seen.insert(entry.transaction_id.clone()))
            .map(|entry| entry.transaction_id)
            .collect())
    }

    /// The record of a single transaction, if the log mentions it.
    pub fn get_transaction_log(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>, WalError> {
        let mut record: Option<TransactionRecord> = None;
        for (line_no, entry) in self.entries()?.into_iter().enumerate() {
            if entry.transaction_id != transaction_id {
                continue;
            }
            record
                .get_or_insert_with(|| TransactionRecord::start(&entry, line_no))
                .fold(entry);
        }
        Ok(record)
    }
}

fn sanitize(node: &str) -> String {
    node.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
