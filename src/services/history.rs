use crate::core::error::{JobFailure, PersistenceError};
use crate::core::io::Storage;
use crate::services::fallback::GenerationAttempt;
use crate::services::rate_limit::QuotaState;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

const HISTORY_FILE: &str = "history.json";
const QUOTA_FILE: &str = "quota.json";

/// Durable log entry pairing a job, every attempt made for it and the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub job_id: String,
    pub filename: String,
    pub character: String,
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    pub attempts: Vec<GenerationAttempt>,
    pub outcome: HistoryOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HistoryOutcome {
    Stored {
        version: u32,
        model_id: String,
        #[serde(default)]
        reused: bool,
    },
    Failed {
        failure: JobFailure,
    },
}

impl HistoryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// File-backed store for the history log and the quota counters.
/// One writer at a time; every write replaces the file atomically.
///
/// The log is parsed once and then kept in memory, so an append costs one
/// serialization and one file replacement. Nothing else may write
/// `history.json` while a store is open.
pub struct HistoryStore {
    storage: Arc<dyn Storage>,
    folder: String,
    records: Mutex<Option<Vec<HistoryRecord>>>,
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(storage: Arc<dyn Storage>, folder: impl Into<String>) -> Self {
        Self {
            storage,
            folder: folder.into(),
            records: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, file: &str) -> String {
        Path::new(&self.folder)
            .join(file)
            .to_string_lossy()
            .to_string()
    }

    /// Parses the log on first use. A corrupt file is reported every time
    /// and never replaced by an empty log.
    async fn cached<'a>(
        &self,
        slot: &'a mut Option<Vec<HistoryRecord>>,
    ) -> Result<&'a mut Vec<HistoryRecord>, PersistenceError> {
        if slot.is_none() {
            let loaded = self
                .read_json(&self.path(HISTORY_FILE))
                .await?
                .unwrap_or_default();
            *slot = Some(loaded);
        }
        Ok(slot.get_or_insert_with(Vec::new))
    }

    pub async fn append(&self, record: HistoryRecord) -> Result<(), PersistenceError> {
        let mut slot = self.records.lock().await;
        let history = self.cached(&mut slot).await?;
        debug!(
            "Appending history record for {} ({} attempts)",
            record.job_id,
            record.attempts.len()
        );
        history.push(record);
        let written = self.write_json(&self.path(HISTORY_FILE), &*history).await;
        if let Err(e) = written {
            history.pop();
            return Err(e);
        }
        Ok(())
    }

    /// All records, oldest first.
    pub async fn load_all(&self) -> Result<Vec<HistoryRecord>, PersistenceError> {
        let mut slot = self.records.lock().await;
        Ok(self.cached(&mut slot).await?.clone())
    }

    /// Number of records, loading the log if it has not been read yet.
    pub async fn record_count(&self) -> Result<usize, PersistenceError> {
        let mut slot = self.records.lock().await;
        Ok(self.cached(&mut slot).await?.len())
    }

    pub async fn records_for_job(&self, job_id: &str) -> Result<Vec<HistoryRecord>, PersistenceError> {
        let mut records = self.load_all().await?;
        records.retain(|r| r.job_id == job_id);
        Ok(records)
    }

    /// Explicit truncation. The pipeline itself never calls this.
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        let mut slot = self.records.lock().await;
        info!("Clearing history log");
        self.write_json(&self.path(HISTORY_FILE), &Vec::<HistoryRecord>::new())
            .await?;
        *slot = Some(Vec::new());
        Ok(())
    }

    pub async fn load_quota_state(&self) -> Result<Option<QuotaState>, PersistenceError> {
        self.read_json(&self.path(QUOTA_FILE)).await
    }

    pub async fn save_quota_state(&self, state: &QuotaState) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        self.write_json(&self.path(QUOTA_FILE), state).await
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, PersistenceError> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(path).await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PersistenceError::Corruption {
                path: path.to_string(),
                detail: e.to_string(),
            })
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<(), PersistenceError> {
        let content = serde_json::to_string_pretty(value).map_err(anyhow::Error::from)?;
        self.storage.write(path, content.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ProviderErrorKind;
    use crate::core::io::NativeStorage;
    use crate::services::fallback::AttemptOutcome;
    use crate::services::rate_limit::WindowCounter;
    use anyhow::Result;
    use chrono::TimeZone;

    fn store(dir: &Path) -> HistoryStore {
        HistoryStore::new(
            Arc::new(NativeStorage::new()),
            dir.join("state").to_string_lossy().to_string(),
        )
    }

    fn record(job_id: &str, outcome: HistoryOutcome) -> HistoryRecord {
        HistoryRecord {
            job_id: job_id.to_string(),
            filename: job_id.to_string(),
            character: "Alice".to_string(),
            text: "Hello there".to_string(),
            voice: Some("Kore".to_string()),
            style: None,
            attempts: vec![GenerationAttempt {
                model_id: "m1".to_string(),
                started_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
                outcome: AttemptOutcome::Failed {
                    kind: ProviderErrorKind::Transient,
                    detail: "503".to_string(),
                },
            }],
            outcome,
            recorded_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 6).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_append_keeps_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        assert!(store.load_all().await?.is_empty());

        let first = record(
            "greet",
            HistoryOutcome::Stored {
                version: 1,
                model_id: "m1".to_string(),
                reused: false,
            },
        );
        let second = record(
            "intro",
            HistoryOutcome::Failed {
                failure: JobFailure::AllModelsExhausted {
                    last_error: "503".to_string(),
                },
            },
        );
        store.append(first.clone()).await?;
        store.append(second.clone()).await?;

        assert_eq!(store.load_all().await?, vec![first.clone(), second]);
        assert_eq!(store.records_for_job("greet").await?, vec![first]);

        store.clear().await?;
        assert!(store.load_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_append_writes_from_memory_after_first_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        let stored = HistoryOutcome::Stored {
            version: 1,
            model_id: "m1".to_string(),
            reused: false,
        };
        store.append(record("a", stored.clone())).await?;

        // Only this store writes the log, so later appends never parse it again.
        let history_path = dir.path().join("state").join("history.json");
        std::fs::write(&history_path, "{ not json")?;
        store.append(record("b", stored.clone())).await?;

        let fresh = HistoryStore::new(
            Arc::new(NativeStorage::new()),
            dir.path().join("state").to_string_lossy().to_string(),
        );
        let ids: Vec<String> = fresh.load_all().await?.into_iter().map(|r| r.job_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_history_fails_every_read_and_append() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir)?;
        std::fs::write(state_dir.join("history.json"), "{ not json")?;

        let store = store(dir.path());
        assert!(matches!(
            store.load_all().await,
            Err(PersistenceError::Corruption { .. })
        ));
        let outcome = HistoryOutcome::Failed {
            failure: JobFailure::UnknownCharacter {
                name: "Carol".to_string(),
            },
        };
        assert!(store.append(record("a", outcome)).await.is_err());
        assert_eq!(std::fs::read_to_string(state_dir.join("history.json"))?, "{ not json");
        Ok(())
    }

    #[tokio::test]
    async fn test_quota_state_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        assert!(store.load_quota_state().await?.is_none());

        let start = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let state = QuotaState {
            minute: WindowCounter {
                count: 2,
                window_start: start + chrono::Duration::milliseconds(1500),
            },
            day: WindowCounter {
                count: 9,
                window_start: start,
            },
        };
        store.save_quota_state(&state).await?;
        assert_eq!(store.load_quota_state().await?, Some(state));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_quota_file_is_surfaced() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir)?;
        std::fs::write(state_dir.join("quota.json"), "{ not json")?;

        let store = store(dir.path());
        match store.load_quota_state().await {
            Err(PersistenceError::Corruption { path, .. }) => {
                assert!(path.ends_with("quota.json"))
            }
            other => panic!("expected corruption error, got {:?}", other),
        }
        Ok(())
    }
}
