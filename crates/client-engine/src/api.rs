//! Public API types for the in-process `skylift` pipeline engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platform::PlatformClient;
use crate::state::{JobState, StageStatus, StateStore};
use skylift_core::spec::JobSpec;

/// Archive compression applied by the archive stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Produce `.tar.gz` archives.
    #[default]
    Gzip,
    /// Produce plain `.tar` archives.
    None,
}

impl Compression {
    /// File suffix for archives produced under this setting.
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::Gzip => ".tar.gz",
            Compression::None => ".tar",
        }
    }
}

/// Proxy session mode of the underlying HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// No authenticated proxy in the path.
    #[default]
    Off,
    /// Basic-authenticated proxy; sessions time out and need warmup requests.
    Basic,
    /// NTLM-authenticated proxy; sessions time out and need warmup requests.
    Ntlm,
}

impl ProxyMode {
    /// Whether uploads should renew the proxy session before each attempt.
    pub fn needs_session_warmup(self) -> bool {
        !matches!(self, ProxyMode::Off)
    }
}

/// Pipeline stage a worker or event belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Packaging a run directory into an archive.
    Archive,
    /// Transmitting the archive to platform storage.
    Upload,
    /// Creating (and optionally submitting) the platform job.
    Submit,
}

impl StageKind {
    /// Stable lowercase name, as used in events and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Archive => "archive",
            StageKind::Upload => "upload",
            StageKind::Submit => "submit",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity passed to the log callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Routine progress information.
    Info,
    /// Something degraded but the run continues.
    Warning,
    /// A job or collaborator failed.
    Error,
}

/// Payload handed to the state-change callback on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChange {
    /// Job name the transition belongs to.
    pub job_name: String,
    /// Stage whose status changed.
    pub stage: StageKind,
    /// The new status.
    pub status: StageStatus,
    /// Platform job identifier, once known.
    pub job_id: Option<String>,
    /// Failure message, for `failed` transitions.
    pub error: Option<String>,
    /// Fractional upload progress in `[0.0, 1.0]`, for upload progress ticks.
    pub upload_progress: Option<f64>,
}

/// Log callback: `(level, message, stage, job_name)`.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str, StageKind, &str) + Send + Sync>;

/// Progress callback: `(completed, total, stage, job_name)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64, StageKind, &str) + Send + Sync>;

/// State-change callback, invoked on every per-job status transition.
pub type StateChangeCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Optional listener trio; any or all may be absent.
#[derive(Clone, Default)]
pub struct PipelineCallbacks {
    /// Receives log lines mirrored from the engine's internal logging.
    pub log: Option<LogCallback>,
    /// Receives completion counters on terminal job transitions.
    pub progress: Option<ProgressCallback>,
    /// Receives every status transition and upload progress tick.
    pub state_change: Option<StateChangeCallback>,
}

impl std::fmt::Debug for PipelineCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCallbacks")
            .field("log", &self.log.is_some())
            .field("progress", &self.progress.is_some())
            .field("state_change", &self.state_change.is_some())
            .finish()
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path of the durable state file for this batch.
    pub state_file: PathBuf,

    /// Worker count of the archive stage.
    pub archive_workers: usize,
    /// Worker count of the upload stage.
    pub upload_workers: usize,
    /// Worker count of the submit stage.
    pub submit_workers: usize,
    /// Inter-stage queue capacity is `stage workers × queue_multiplier`.
    pub queue_multiplier: usize,

    /// Archive compression mode.
    pub compression: Compression,
    /// Only archive entries matching one of these patterns. Overrides
    /// `exclude_patterns` when both are set.
    pub include_patterns: Vec<String>,
    /// Skip archive entries matching one of these patterns.
    pub exclude_patterns: Vec<String>,
    /// Emit all files at the archive root; duplicate filenames fail the job.
    pub flatten: bool,
    /// Store entries under absolute paths instead of run-directory-relative.
    pub absolute_paths: bool,

    /// Upload attempts for transient failures (at least 1).
    pub max_retries: u32,
    /// Proxy session mode of the HTTP client.
    pub proxy_mode: ProxyMode,
    /// Delete the local archive after a successful upload.
    pub rm_tar_on_success: bool,
    /// Allow multi-part parallelism for large uploads.
    pub multi_part: bool,
    /// Process-wide cap on concurrent upload transfer slots.
    pub transfer_slot_budget: usize,

    /// Submit-existing-files mode: skip archival and upload entirely.
    pub skip_tar_upload: bool,
    /// Raw shared-input specification: comma-separated `id:<opaque>` entries
    /// and local file paths, attached to every job in the batch.
    pub extra_input_files: Option<String>,
    /// Whether the platform should decompress the shared inputs.
    pub decompress_extras: bool,

    /// Cadence of the periodic counters heartbeat.
    pub progress_interval: Duration,
    /// Sleep between upload retries when a Basic/NTLM proxy is configured.
    pub retry_sleep: Duration,
    /// Base delay of the project-assignment retry backoff.
    pub assign_retry_base: Duration,

    /// Optional listener trio.
    pub callbacks: PipelineCallbacks,
}

impl PipelineConfig {
    /// Default worker count per stage.
    pub const DEFAULT_STAGE_WORKERS: usize = 4;

    /// Default inter-stage queue capacity multiplier.
    pub const DEFAULT_QUEUE_MULTIPLIER: usize = 4;

    /// Default upload attempt cap for transient failures.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Default process-wide transfer slot budget.
    pub const DEFAULT_TRANSFER_SLOT_BUDGET: usize = 16;

    /// Default heartbeat cadence.
    pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

    /// Default sleep between proxied upload retries.
    pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(2);

    /// Default base delay of the project-assignment backoff.
    pub const DEFAULT_ASSIGN_RETRY_BASE: Duration = Duration::from_secs(1);

    /// A configuration with defaults for everything except the state file.
    pub fn new(state_file: PathBuf) -> Self {
        Self {
            state_file,
            archive_workers: Self::DEFAULT_STAGE_WORKERS,
            upload_workers: Self::DEFAULT_STAGE_WORKERS,
            submit_workers: Self::DEFAULT_STAGE_WORKERS,
            queue_multiplier: Self::DEFAULT_QUEUE_MULTIPLIER,
            compression: Compression::Gzip,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            flatten: false,
            absolute_paths: false,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            proxy_mode: ProxyMode::Off,
            rm_tar_on_success: false,
            multi_part: true,
            transfer_slot_budget: Self::DEFAULT_TRANSFER_SLOT_BUDGET,
            skip_tar_upload: false,
            extra_input_files: None,
            decompress_extras: true,
            progress_interval: Self::DEFAULT_PROGRESS_INTERVAL,
            retry_sleep: Self::DEFAULT_RETRY_SLEEP,
            assign_retry_base: Self::DEFAULT_ASSIGN_RETRY_BASE,
            callbacks: PipelineCallbacks::default(),
        }
    }
}

/// Pipeline event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Pipeline started.
    Started,
    /// Cancellation has been requested.
    CancelRequested,
    /// A per-job status transition or upload progress tick.
    StateChanged {
        /// The transition payload.
        change: StateChange,
    },
    /// Periodic counters snapshot.
    Heartbeat {
        /// Archive workers currently holding an item.
        active_archive: usize,
        /// Upload workers currently holding an item.
        active_upload: usize,
        /// Submit workers currently holding an item.
        active_submit: usize,
        /// Jobs that reached a terminal state.
        completed: u64,
        /// Jobs in the batch.
        total: u64,
    },
    /// A warning from the pipeline.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the pipeline.
    Error {
        /// Error message.
        message: String,
    },
    /// Pipeline stopped (all workers exited).
    Stopped,
}

/// Fatal errors returned by [`PipelineHandle::wait`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The state file exists but could not be read or parsed.
    #[error("load state file: {0}")]
    StateLoad(String),
    /// The batch specification is invalid (duplicate names, empty batch, …).
    #[error("invalid job specification: {0}")]
    SpecValidation(String),
    /// Shared-input resolution failed before any per-job work began.
    #[error("resolve shared inputs: {0}")]
    SharedInput(String),
    /// The run was cancelled; partially-done jobs remain resumable on disk.
    #[error("run cancelled")]
    Cancelled,
    /// An internal invariant broke (worker task panicked or vanished).
    #[error("pipeline internal error: {0}")]
    Internal(String),
}

/// Final per-batch outcome, built from the state store after the run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Snapshot of every job row at the end of the run.
    pub jobs: Vec<JobState>,
    /// Jobs that finished the pipeline (submitted, or created in
    /// create-only mode).
    pub completed: u64,
    /// Jobs with any failed stage.
    pub failed: u64,
    /// Jobs in the batch.
    pub total: u64,
}

impl RunReport {
    /// Whether every job in the batch completed without failure.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.completed == self.total
    }
}

/// Handle to a running in-process pipeline instance.
pub struct PipelineHandle {
    pub(crate) inner: Arc<crate::pipeline::PipelineInner>,
    pub(crate) join: tokio::task::JoinHandle<Result<RunReport, PipelineError>>,
}

impl PipelineHandle {
    /// Subscribe to the pipeline event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Request cancellation: every blocking point unblocks, no new queue
    /// sends are attempted, and in-flight durable updates complete.
    pub fn cancel(&self) {
        self.inner.request_cancel();
    }

    /// Wait for the pipeline to finish, returning the run report.
    pub async fn wait(self) -> Result<RunReport, PipelineError> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(PipelineError::Internal(format!(
                "pipeline task join error: {err}"
            ))),
        }
    }
}

/// Start a new in-process pipeline run.
///
/// `shared_state` lets an embedding host (GUI) pass the state store it is
/// already observing; when `None`, the store is created from
/// `config.state_file`.
pub fn start_pipeline(
    config: PipelineConfig,
    client: Arc<dyn PlatformClient>,
    specs: Vec<JobSpec>,
    shared_state: Option<Arc<StateStore>>,
) -> PipelineHandle {
    crate::pipeline::start_pipeline(config, client, specs, shared_state)
}
