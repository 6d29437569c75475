//! Durable per-job progress records, keyed by 1-based batch index.
//!
//! The store is a JSON file rewritten in full on every update. Writes go to a
//! temp file first and are moved into place with an atomic rename, so a
//! process kill leaves either the old or the new complete record on disk.
//! Persist failures are logged and swallowed: the in-memory rows stay
//! authoritative for the rest of the run and the next successful write
//! refreshes the on-disk copy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::StageKind;

/// Status of one stage of one job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not reached yet.
    #[default]
    Pending,
    /// A worker currently holds the item in this stage.
    InProgress,
    /// Stage finished.
    Success,
    /// Stage failed; the job will not advance this run.
    Failed,
    /// Stage intentionally bypassed (skip-upload mode, create-only submit).
    Skipped,
}

/// Durable record of one job's progress through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    /// 1-based ordinal index within the batch.
    pub index: u32,
    /// Job name.
    pub job_name: String,
    /// Absolute run directory.
    pub directory: PathBuf,
    /// Archive location, once produced.
    #[serde(default)]
    pub tar_path: Option<PathBuf>,
    /// Platform file identifier, once uploaded.
    #[serde(default)]
    pub file_id: Option<String>,
    /// Platform job identifier, once created.
    #[serde(default)]
    pub job_id: Option<String>,
    /// Archive stage status.
    #[serde(default)]
    pub tar_status: StageStatus,
    /// Upload stage status.
    #[serde(default)]
    pub upload_status: StageStatus,
    /// Job-creation status.
    #[serde(default)]
    pub create_status: StageStatus,
    /// Submission status.
    #[serde(default)]
    pub submit_status: StageStatus,
    /// Last failure message, if any stage failed.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last persisted mutation time.
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    fn new(index: u32, job_name: &str, directory: &Path) -> Self {
        let now = Utc::now();
        Self {
            index,
            job_name: job_name.to_string(),
            directory: directory.to_path_buf(),
            tar_path: None,
            file_id: None,
            job_id: None,
            tar_status: StageStatus::Pending,
            upload_status: StageStatus::Pending,
            create_status: StageStatus::Pending,
            submit_status: StageStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The status field of the given pipeline stage. The submit stage maps to
    /// `submit_status`; `create_status` is tracked separately within it.
    pub fn stage_status(&self, stage: StageKind) -> StageStatus {
        match stage {
            StageKind::Archive => self.tar_status,
            StageKind::Upload => self.upload_status,
            StageKind::Submit => self.submit_status,
        }
    }

    /// Whether this job is finished for the batch: every remaining stage
    /// either succeeded or was intentionally skipped.
    pub fn is_complete(&self) -> bool {
        matches!(self.submit_status, StageStatus::Success | StageStatus::Skipped)
            && self.create_status == StageStatus::Success
    }

    /// Whether any stage of this job failed.
    pub fn is_failed(&self) -> bool {
        [
            self.tar_status,
            self.upload_status,
            self.create_status,
            self.submit_status,
        ]
        .iter()
        .any(|s| *s == StageStatus::Failed)
    }
}

/// The state file exists but could not be read or parsed.
#[derive(Debug, thiserror::Error)]
#[error("state file {path}: {message}")]
pub struct StateLoadError {
    /// Offending file.
    pub path: PathBuf,
    /// Read or parse failure description.
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    jobs: Vec<JobState>,
}

/// Durable mapping `index → JobState` shared by every worker.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    rows: Mutex<BTreeMap<u32, JobState>>,
    io: tokio::sync::Mutex<()>,
}

impl StateStore {
    /// Read and parse the backing file; an absent file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, StateLoadError> {
        let mut rows = BTreeMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|err| StateLoadError {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            let file: StateFile = serde_json::from_str(&raw).map_err(|err| StateLoadError {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            for row in file.jobs {
                rows.insert(row.index, row);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            rows: Mutex::new(rows),
            io: tokio::sync::Mutex::new(()),
        })
    }

    /// Snapshot of the row at `index`.
    pub fn get(&self, index: u32) -> Option<JobState> {
        self.rows.lock().expect("state rows lock").get(&index).cloned()
    }

    /// Create a pending row, or return the persisted one if it exists.
    pub fn initialize(&self, index: u32, job_name: &str, directory: &Path) -> JobState {
        let mut rows = self.rows.lock().expect("state rows lock");
        rows.entry(index)
            .or_insert_with(|| JobState::new(index, job_name, directory))
            .clone()
    }

    /// Persist a mutated row. The write is durable before this returns; a
    /// failed write is logged and does not surface to the caller.
    pub async fn update(&self, mut row: JobState) {
        row.updated_at = Utc::now();

        // The write lock spans snapshot and rename so concurrent updates
        // cannot land on disk out of order.
        let _io = self.io.lock().await;
        let json = {
            let mut rows = self.rows.lock().expect("state rows lock");
            rows.insert(row.index, row);
            let file = StateFile {
                version: 1,
                jobs: rows.values().cloned().collect(),
            };
            serde_json::to_string_pretty(&file)
        };

        let json = match json {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!("serialize state file: {err}");
                return;
            }
        };

        let path = self.path.clone();
        let res = tokio::task::spawn_blocking(move || persist_file(&path, &json)).await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("persist state file: {err:#}"),
            Err(err) => tracing::warn!("persist state file task: {err}"),
        }
    }

    /// Snapshot of all rows, in index order.
    pub fn all(&self) -> Vec<JobState> {
        self.rows
            .lock()
            .expect("state rows lock")
            .values()
            .cloned()
            .collect()
    }
}

fn persist_file(path: &Path, json: &str) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid state path: {}", path.display()))?;
    if !dir.as_os_str().is_empty() {
        std::fs::create_dir_all(dir)?;
    }

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
