//! File-based checkpoint store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CheckpointStore, CopyCheckpoint, RunStatus};
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// On-disk layout of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Unique run identifier.
    pub run_id: String,

    /// Resume hash of the configuration.
    pub config_hash: String,

    /// When the first run started.
    pub started_at: DateTime<Utc>,

    /// Current run status.
    pub status: RunStatus,

    /// Per-table checkpoints.
    pub checkpoints: BTreeMap<String, CopyCheckpoint>,

    /// When the last run finished.
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized file without this field, keyed by
    /// `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl CheckpointFile {
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            checkpoints: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load and verify a state file.
    ///
    /// Files without a signature are accepted with a warning and get signed
    /// on the next save.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: Self = serde_json::from_str(&content)?;

        match &file.hmac {
            Some(stored) if *stored != file.compute_hmac()? => Err(MigrateError::State(
                "State file integrity check failed: HMAC mismatch (possible tampering)".into(),
            )),
            Some(_) => Ok(file),
            None => {
                warn!("State file has no HMAC signature, integrity cannot be verified");
                Ok(file)
            }
        }
    }

    /// Sign and serialize.
    fn render(&mut self) -> Result<String> {
        self.hmac = Some(self.compute_hmac()?);
        serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state: {}", e)))
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }
}

/// Atomic write: temp file, then rename over the target.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut temp = tokio::fs::File::create(&temp_path).await?;
    temp.write_all(content.as_bytes()).await?;
    // Contents must reach disk before the rename publishes them.
    temp.sync_all().await?;
    drop(temp);
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Checkpoints in a signed JSON file, rewritten after every save.
pub struct FileCheckpointStore {
    path: PathBuf,
    state: Mutex<CheckpointFile>,
}

impl FileCheckpointStore {
    /// Start a fresh state file, replacing any previous one.
    pub async fn create(path: impl Into<PathBuf>, run_id: String, config_hash: String) -> Result<Self> {
        let path = path.into();
        let mut file = CheckpointFile::new(run_id, config_hash);
        write_atomic(&path, &file.render()?).await?;
        info!("Writing checkpoints to {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(file),
        })
    }

    /// Open an existing state file for resume.
    ///
    /// Fails with [`MigrateError::ConfigChanged`] if the file was written for
    /// a different configuration.
    pub async fn resume(path: impl Into<PathBuf>, config_hash: &str) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(MigrateError::State(format!(
                "State file {} does not exist",
                path.display()
            )));
        }
        let mut file = CheckpointFile::load(&path)?;
        file.validate_config(config_hash)?;

        let complete = file.checkpoints.values().filter(|c| c.complete).count();
        info!(
            "Resuming run {} from {}: {} of {} checkpointed tables complete",
            file.run_id,
            path.display(),
            complete,
            file.checkpoints.len()
        );
        file.status = RunStatus::Running;
        file.completed_at = None;

        Ok(Self {
            path,
            state: Mutex::new(file),
        })
    }

    pub async fn run_id(&self) -> String {
        self.state.lock().await.run_id.clone()
    }

    async fn persist(&self, file: &mut CheckpointFile) -> Result<()> {
        let content = file.render()?;
        write_atomic(&self.path, &content).await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, table: &str) -> Result<Option<CopyCheckpoint>> {
        Ok(self.state.lock().await.checkpoints.get(table).cloned())
    }

    async fn save(&self, table: &str, checkpoint: &CopyCheckpoint) -> Result<()> {
        let mut file = self.state.lock().await;
        file.checkpoints.insert(table.to_string(), checkpoint.clone());
        self.persist(&mut file).await?;
        debug!("{}: checkpoint at {} rows", table, checkpoint.rows_copied);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut file = self.state.lock().await;
        file.checkpoints.clear();
        self.persist(&mut file).await
    }

    async fn mark_run(&self, status: RunStatus) -> Result<()> {
        let mut file = self.state.lock().await;
        file.status = status;
        if status != RunStatus::Running {
            file.completed_at = Some(Utc::now());
        }
        self.persist(&mut file).await
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
