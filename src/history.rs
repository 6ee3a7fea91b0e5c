use std::collections::{HashSet, VecDeque};

use case_catalog::CardRecord;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage::StoragePort;

const HISTORY_VERSION: u32 = 1;

/// A resolved card plus the time it was most recently scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryEntry {
    pub record: CardRecord,
    pub scanned_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDocument {
    version: u32,
    entries: Vec<HistoryEntry>,
}

/// Most-recent-first scan history with at most one entry per card id.
///
/// Rules:
/// - `upsert` removes any existing entry for the id and pushes the new one at the front.
/// - `scanned_at` is strictly decreasing from front to back; a timestamp that does not
///   advance past the current head is bumped to head + 1 ms.
/// - Every mutation hands the whole document to the storage port; save failures are
///   logged and the in-memory contents stay authoritative.
pub struct HistoryStore {
    entries: VecDeque<HistoryEntry>,
    storage: Option<Box<dyn StoragePort>>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            storage: None,
        }
    }

    /// Restore from `storage`, falling back to an empty history when nothing usable is saved.
    pub fn with_storage(storage: Box<dyn StoragePort>) -> Self {
        let entries = match storage.load() {
            Ok(Some(document)) => match decode(&document) {
                Ok(entries) => {
                    info!(entries = entries.len(), "restored scan history");
                    entries
                }
                Err(err) => {
                    warn!("discarding unreadable scan history: {err}");
                    VecDeque::new()
                }
            },
            Ok(None) => VecDeque::new(),
            Err(err) => {
                warn!("failed to load scan history: {err}");
                VecDeque::new()
            }
        };
        Self {
            entries,
            storage: Some(storage),
        }
    }

    pub fn upsert(&mut self, record: &CardRecord, at: DateTime<Utc>) -> HistoryEntry {
        let previous = self
            .entries
            .iter()
            .position(|entry| entry.record.id == record.id)
            .and_then(|idx| self.entries.remove(idx));

        let mut scanned_at = at;
        if let Some(head) = self.entries.front() {
            if scanned_at <= head.scanned_at {
                scanned_at = head.scanned_at + ChronoDuration::milliseconds(1);
                debug!(
                    id = %record.id,
                    requested = %at,
                    used = %scanned_at,
                    "scan time bumped past history head"
                );
            }
        }

        let entry = HistoryEntry {
            record: record.clone(),
            scanned_at,
        };
        self.entries.push_front(entry.clone());
        debug!(
            id = %record.id,
            rescan = previous.is_some(),
            count = self.entries.len(),
            "history updated"
        );
        self.persist();
        entry
    }

    /// Snapshot of the history, most recent first.
    pub fn list(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().find(|entry| entry.record.id == id)
    }

    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.clear();
        info!("scan history cleared");
        self.persist();
    }

    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = encode(&self.entries)
            .and_then(|document| storage.save(&document));
        if let Err(err) = result {
            warn!("failed to save scan history: {err}");
        }
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("entries", &self.entries.len())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

fn encode(entries: &VecDeque<HistoryEntry>) -> Result<String, StorageError> {
    let document = HistoryDocument {
        version: HISTORY_VERSION,
        entries: entries.iter().cloned().collect(),
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

fn decode(document: &str) -> Result<VecDeque<HistoryEntry>, StorageError> {
    let HistoryDocument { version, entries } = serde_json::from_str(document)?;
    if version != HISTORY_VERSION {
        return Err(StorageError::Version {
            found: version,
            expected: HISTORY_VERSION,
        });
    }
    Ok(normalize(entries))
}

/// Re-establish ordering and uniqueness on data that came from outside.
fn normalize(mut entries: Vec<HistoryEntry>) -> VecDeque<HistoryEntry> {
    entries.sort_by(|a, b| b.scanned_at.cmp(&a.scanned_at));
    let mut seen = HashSet::new();
    let mut entries: Vec<HistoryEntry> = entries
        .into_iter()
        .filter(|entry| seen.insert(entry.record.id.clone()))
        .collect();
    for idx in (0..entries.len().saturating_sub(1)).rev() {
        let older = entries[idx + 1].scanned_at;
        if entries[idx].scanned_at <= older {
            entries[idx].scanned_at = older + ChronoDuration::milliseconds(1);
        }
    }
    entries.into()
}
