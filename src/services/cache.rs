use crate::core::clock::Clock;
use crate::core::error::CacheError;
use crate::core::io::Storage;
use crate::core::state::CharacterProfile;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const INDEX_FILE: &str = "index.json";
const FIELD_SEPARATOR: &[u8] = b"\x1f";

/// Hash of everything that decides what a line should sound like. Two takes
/// with the same base were asked for the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintBase(String);

impl FingerprintBase {
    pub fn new(character: &str, profile: &CharacterProfile, text: &str) -> Self {
        let mut hasher = Sha256::new();
        for field in [character, profile.voice.as_str(), text, profile.style_instruction()] {
            hasher.update(field.as_bytes());
            hasher.update(FIELD_SEPARATOR);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Per-take identity. Regenerating identical input still yields a fresh
    /// fingerprint because of the nonce.
    fn version_fingerprint(&self, model_id: &str, nonce: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(model_id.as_bytes());
        hasher.update(nonce.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioVersion {
    pub job_id: String,
    /// 1-based, strictly increasing per job, never reused.
    pub index: u32,
    pub fingerprint: String,
    pub base_fingerprint: FingerprintBase,
    pub model_id: String,
    pub file: String,
    pub bytes: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JobIndex {
    job_id: String,
    #[serde(default)]
    pinned: Option<u32>,
    #[serde(default)]
    versions: Vec<AudioVersion>,
}

/// Append-only store of generated takes, one directory per job:
/// `<root>/<job_id>/index.json` plus `v0001.wav`, `v0002.wav`, ...
pub struct AudioCache {
    storage: Arc<dyn Storage>,
    root: String,
    clock: Arc<dyn Clock>,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AudioCache {
    pub fn new(storage: Arc<dyn Storage>, root: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            root: root.into(),
            clock,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn job_dir(&self, job_id: &str) -> Result<String> {
        if !is_safe_id(job_id) {
            return Err(anyhow!("Invalid job id: {:?}", job_id));
        }
        Ok(Path::new(&self.root)
            .join(job_id)
            .to_string_lossy()
            .to_string())
    }

    fn index_path(&self, job_id: &str) -> Result<String> {
        Ok(Path::new(&self.job_dir(job_id)?)
            .join(INDEX_FILE)
            .to_string_lossy()
            .to_string())
    }

    fn job_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(job_id.to_string()).or_default().clone()
    }

    async fn load_index(&self, job_id: &str) -> Result<JobIndex> {
        let path = self.index_path(job_id)?;
        if !self.storage.exists(&path).await? {
            return Ok(JobIndex {
                job_id: job_id.to_string(),
                ..Default::default()
            });
        }
        let bytes = self.storage.read(&path).await?;
        serde_json::from_slice(&bytes).with_context(|| format!("Corrupt cache index {}", path))
    }

    async fn save_index(&self, index: &JobIndex) -> Result<()> {
        let path = self.index_path(&index.job_id)?;
        let content = serde_json::to_string_pretty(index)?;
        self.storage.write(&path, content.as_bytes()).await
    }

    /// All takes for a job, oldest first. Unknown jobs have none.
    pub async fn versions(&self, job_id: &str) -> Result<Vec<AudioVersion>> {
        Ok(self.load_index(job_id).await?.versions)
    }

    pub async fn lookup_versions(&self, job_id: &str, base: &FingerprintBase) -> Result<Vec<AudioVersion>> {
        let mut versions = self.versions(job_id).await?;
        versions.retain(|v| &v.base_fingerprint == base);
        Ok(versions)
    }

    /// The newest take, but only if it was made from the same input.
    pub async fn latest_matching(&self, job_id: &str, base: &FingerprintBase) -> Result<Option<AudioVersion>> {
        Ok(self
            .versions(job_id)
            .await?
            .pop()
            .filter(|v| &v.base_fingerprint == base))
    }

    /// Appends a new take. The audio file lands before the index entry that
    /// points at it, so a crash in between leaves an orphan file, never a
    /// dangling version. Does not touch the selection.
    pub async fn store(
        &self,
        job_id: &str,
        base: &FingerprintBase,
        model_id: &str,
        audio: &[u8],
    ) -> Result<AudioVersion> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let mut index = self.load_index(job_id).await?;
        let next = index.versions.last().map(|v| v.index).unwrap_or(0) + 1;
        let file = format!("v{:04}.wav", next);
        let file_path = Path::new(&self.job_dir(job_id)?)
            .join(&file)
            .to_string_lossy()
            .to_string();

        self.storage
            .write(&file_path, audio)
            .await
            .with_context(|| format!("Failed to store take {} of {}", next, job_id))?;

        let version = AudioVersion {
            job_id: job_id.to_string(),
            index: next,
            fingerprint: base.version_fingerprint(model_id, rand::random::<u64>()),
            base_fingerprint: base.clone(),
            model_id: model_id.to_string(),
            file,
            bytes: audio.len(),
            created_at: self.clock.now(),
        };
        index.versions.push(version.clone());
        self.save_index(&index).await?;

        debug!("Stored {} take {} ({} bytes, {})", job_id, next, audio.len(), model_id);
        Ok(version)
    }

    /// Pins `index` as the take to export. An unknown index leaves the
    /// previous selection untouched.
    pub async fn select_version(&self, job_id: &str, index: u32) -> Result<()> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let mut job = self.load_index(job_id).await?;
        let latest = match job.versions.last() {
            Some(v) => v.index,
            None => {
                return Err(CacheError::UnknownJob {
                    job_id: job_id.to_string(),
                }
                .into())
            }
        };
        if !job.versions.iter().any(|v| v.index == index) {
            return Err(CacheError::VersionOutOfRange {
                job_id: job_id.to_string(),
                index,
                latest,
            }
            .into());
        }

        job.pinned = Some(index);
        self.save_index(&job).await?;
        info!("Selected take {} for {}", index, job_id);
        Ok(())
    }

    /// The pinned take, or the newest one when nothing is pinned.
    pub async fn selected_version(&self, job_id: &str) -> Result<Option<AudioVersion>> {
        let mut job = self.load_index(job_id).await?;
        if let Some(pinned) = job.pinned {
            if let Some(pos) = job.versions.iter().position(|v| v.index == pinned) {
                return Ok(Some(job.versions.swap_remove(pos)));
            }
        }
        Ok(job.versions.pop())
    }

    /// Like [`Self::selected_version`], restricted to takes made from `base`.
    /// A pin on a take of other input falls back to the newest matching take.
    pub async fn selected_matching(
        &self,
        job_id: &str,
        base: &FingerprintBase,
    ) -> Result<Option<AudioVersion>> {
        let job = self.load_index(job_id).await?;
        let pinned = job.pinned;
        let mut latest = None;
        for version in job.versions.into_iter().filter(|v| &v.base_fingerprint == base) {
            if Some(version.index) == pinned {
                return Ok(Some(version));
            }
            latest = Some(version);
        }
        Ok(latest)
    }

    pub async fn read_audio(&self, version: &AudioVersion) -> Result<Vec<u8>> {
        let path = Path::new(&self.job_dir(&version.job_id)?)
            .join(&version.file)
            .to_string_lossy()
            .to_string();
        self.storage.read(&path).await
    }

    /// Job ids that have a cache directory, sorted.
    pub async fn job_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.storage.list(&self.root).await? {
            let index = Path::new(&entry).join(INDEX_FILE);
            if self.storage.exists(&index.to_string_lossy()).await? {
                if let Some(name) = Path::new(&entry).file_name() {
                    ids.push(name.to_string_lossy().to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Drops every take of every job.
    pub async fn clear(&self) -> Result<()> {
        info!("Clearing audio cache at {}", self.root);
        self.storage.delete(&self.root).await
    }
}

/// Ids become directory names: same character set the script parser emits,
/// no leading or trailing dot.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.ends_with('.')
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}
