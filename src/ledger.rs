use crate::error::StoreError;
use crate::store::FileStore;
use crate::types::{CaseId, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Attempts made so far for a case that is still being retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
}

/// Retry counts persisted across runs.
///
/// Only cases in the Retry state have an entry. An entry is dropped as soon
/// as the case reaches Processed or Pending, so a case requeued by hand starts
/// over from zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryLedger {
    #[serde(default)]
    stages: BTreeMap<Stage, BTreeMap<CaseId, AttemptRecord>>,
    #[serde(skip)]
    path: PathBuf,
}

impl RetryLedger {
    /// Load the ledger at `path`; a missing file is an empty ledger
    pub fn load(store: &dyn FileStore, path: &Path) -> Result<Self, StoreError> {
        let mut ledger = match store.read(path) {
            Ok(bytes) => serde_json::from_slice::<RetryLedger>(&bytes).map_err(|e| {
                StoreError::Parse {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?,
            Err(StoreError::NotFound(_)) => RetryLedger::default(),
            Err(e) => return Err(e),
        };
        ledger.path = path.to_path_buf();
        Ok(ledger)
    }

    /// Persist through the store's atomic write
    pub fn save(&self, store: &dyn FileStore) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(self).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            source: e,
        })?;
        store.write(&self.path, &content)
    }

    pub fn attempts(&self, stage: Stage, id: &CaseId) -> u32 {
        self.record(stage, id).map(|r| r.attempts).unwrap_or(0)
    }

    pub fn record(&self, stage: Stage, id: &CaseId) -> Option<&AttemptRecord> {
        self.stages.get(&stage).and_then(|cases| cases.get(id))
    }

    /// Count one more failed attempt, returning the new total
    pub fn record_failure(&mut self, stage: Stage, id: &CaseId, error: &str) -> u32 {
        let record = self
            .stages
            .entry(stage)
            .or_default()
            .entry(id.clone())
            .or_insert_with(|| AttemptRecord {
                attempts: 0,
                last_error: None,
                last_attempt_at: Utc::now(),
            });
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        record.last_attempt_at = Utc::now();
        record.attempts
    }

    /// Forget a case, returning whether it had an entry
    pub fn clear(&mut self, stage: Stage, id: &CaseId) -> bool {
        let Some(cases) = self.stages.get_mut(&stage) else {
            return false;
        };
        let removed = cases.remove(id).is_some();
        if cases.is_empty() {
            self.stages.remove(&stage);
        }
        removed
    }

    /// Cases of a stage currently waiting for another attempt
    pub fn retrying(&self, stage: Stage) -> usize {
        self.stages.get(&stage).map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn id() -> CaseId {
        CaseId::parse("50012345620254047102").unwrap()
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let store = MemoryStore::new();
        let ledger = RetryLedger::load(&store, Path::new("/work/.attempts.json")).unwrap();
        assert_eq!(ledger.attempts(Stage::Ocr, &id()), 0);
    }

    #[test]
    fn test_record_failure_counts_per_stage() {
        let mut ledger = RetryLedger::default();
        assert_eq!(ledger.record_failure(Stage::Report, &id(), "timeout"), 1);
        assert_eq!(ledger.record_failure(Stage::Report, &id(), "503"), 2);
        assert_eq!(ledger.attempts(Stage::Ocr, &id()), 0);

        let record = ledger.record(Stage::Report, &id()).unwrap();
        assert_eq!(record.last_error.as_deref(), Some("503"));
        assert_eq!(ledger.retrying(Stage::Report), 1);
    }

    #[test]
    fn test_clear_forgets_case() {
        let mut ledger = RetryLedger::default();
        ledger.record_failure(Stage::Fill, &id(), "x");
        assert!(ledger.clear(Stage::Fill, &id()));
        assert!(!ledger.clear(Stage::Fill, &id()));
        assert_eq!(ledger.attempts(Stage::Fill, &id()), 0);
        assert_eq!(ledger.retrying(Stage::Fill), 0);
    }

    #[test]
    fn test_save_and_reload() {
        let store = MemoryStore::new();
        let path = Path::new("/work/.attempts.json");
        let mut ledger = RetryLedger::load(&store, path).unwrap();
        ledger.record_failure(Stage::Ocr, &id(), "vision 500");
        ledger.save(&store).unwrap();

        let reloaded = RetryLedger::load(&store, path).unwrap();
        assert_eq!(reloaded.attempts(Stage::Ocr, &id()), 1);
    }

    #[test]
    fn test_corrupt_ledger_is_an_error() {
        let store = MemoryStore::new();
        let path = Path::new("/work/.attempts.json");
        store.write(path, b"{not json").unwrap();
        let err = RetryLedger::load(&store, path).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }
}
