use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;
use warden_types::{FeedbackRecord, Rating};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: parse error: {message}")]
    Parse { line: usize, message: String },
    #[error("line {line}: hash chain mismatch")]
    ChainBroken { line: usize },
    #[error("line {line}: chain hash invalid")]
    HashMismatch { line: usize },
}

/// A persisted feedback record with its link into the hash chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub record: FeedbackRecord,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendReceipt {
    pub record_id: Uuid,
    pub chain_hash: String,
    /// False when the record only made it into memory.
    pub persisted: bool,
}

struct LedgerState {
    last_hash: Option<String>,
    records: Vec<FeedbackRecord>,
}

/// Append-only store of user judgments, with an in-memory index for sampling.
pub struct FeedbackLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerState>,
}

impl FeedbackLedger {
    /// Opens (or starts) a JSONL ledger, loading existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            read_entries(&path)?
        } else {
            Vec::new()
        };
        let last_hash = entries.last().map(|e| e.chain_hash.clone());
        let records = entries.into_iter().map(|e| e.record).collect::<Vec<_>>();
        tracing::debug!(path = %path.display(), records = records.len(), "feedback ledger opened");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(LedgerState { last_hash, records }),
        })
    }

    /// A ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerState {
                last_hash: None,
                records: Vec::new(),
            }),
        }
    }

    /// Records a judgment. Never fails: a write error is logged and the record
    /// is still kept in memory for sampling.
    pub fn append(&self, record: FeedbackRecord) -> AppendReceipt {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut entry = LedgerEntry {
            record,
            prev_hash: state.last_hash.clone(),
            chain_hash: String::new(),
        };
        entry.chain_hash = hash_entry(&entry);

        let persisted = match &self.path {
            Some(path) => match write_entry(path, &entry) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "feedback not persisted");
                    false
                }
            },
            None => false,
        };
        // An unpersisted entry must not become the parent of a persisted one.
        if persisted || self.path.is_none() {
            state.last_hash = Some(entry.chain_hash.clone());
        }
        let receipt = AppendReceipt {
            record_id: entry.record.record_id,
            chain_hash: entry.chain_hash,
            persisted,
        };
        state.records.push(entry.record);
        receipt
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .clone()
    }

    /// Up to `k` positive records most similar to `request_text`, most similar
    /// first, newer first on ties. A later negative judgment on the same
    /// request/statement pair withdraws a positive one.
    pub fn sample_top_examples(&self, request_text: &str, k: usize) -> Vec<FeedbackRecord> {
        if k == 0 {
            return Vec::new();
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let query = tokens(request_text);

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut withdrawn: HashSet<(String, String)> = HashSet::new();
        let mut scored: Vec<(f32, usize, &FeedbackRecord)> = Vec::new();

        // Newest first, so the latest judgment on a pair decides.
        for (pos, record) in state.records.iter().enumerate().rev() {
            let key = pair_key(record);
            match record.rating {
                Rating::Negative => {
                    withdrawn.insert(key);
                }
                Rating::Positive => {
                    if withdrawn.contains(&key) || !seen.insert(key) {
                        continue;
                    }
                    let score = jaccard(&query, &tokens(&record.request_text));
                    if score > 0.0 {
                        scored.push((score, pos, record));
                    }
                }
            }
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        scored.into_iter().take(k).map(|(_, _, r)| r.clone()).collect()
    }
}

fn pair_key(record: &FeedbackRecord) -> (String, String) {
    (
        normalize(&record.request_text),
        normalize(&record.statement_text),
    )
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    inter / union
}

fn write_entry(path: &Path, entry: &LedgerEntry) -> Result<(), LedgerError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry).map_err(|e| LedgerError::Parse {
        line: 0,
        message: e.to_string(),
    })?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Reads every entry of a ledger file, in append order.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>, LedgerError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut entries = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| LedgerError::Parse {
            line: idx + 1,
            message: e.to_string(),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Walks the hash chain. Returns the number of verified entries.
pub fn verify_ledger(path: impl AsRef<Path>) -> Result<usize, LedgerError> {
    let mut prev: Option<String> = None;
    let entries = read_entries(path)?;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.prev_hash != prev {
            return Err(LedgerError::ChainBroken { line: idx + 1 });
        }
        if entry.chain_hash != hash_entry(entry) {
            return Err(LedgerError::HashMismatch { line: idx + 1 });
        }
        prev = Some(entry.chain_hash.clone());
    }
    Ok(entries.len())
}

fn hash_entry(entry: &LedgerEntry) -> String {
    let record = &entry.record;
    let mut h = Sha256::new();
    // Every field is length-prefixed so text cannot shift between fields.
    field(&mut h, record.record_id.to_string().as_bytes());
    field(&mut h, record.timestamp.to_rfc3339().as_bytes());
    field(&mut h, record.request_text.as_bytes());
    field(&mut h, record.statement_text.as_bytes());
    field(
        &mut h,
        match record.rating {
            Rating::Positive => b"positive",
            Rating::Negative => b"negative",
        },
    );
    optional_field(&mut h, record.correction.as_deref());
    optional_field(&mut h, entry.prev_hash.as_deref());
    format!("{:x}", h.finalize())
}

fn field(h: &mut Sha256, bytes: &[u8]) {
    h.update((bytes.len() as u64).to_le_bytes());
    h.update(bytes);
}

fn optional_field(h: &mut Sha256, value: Option<&str>) {
    match value {
        Some(text) => {
            h.update([1u8]);
            field(h, text.as_bytes());
        }
        None => h.update([0u8]),
    }
}
