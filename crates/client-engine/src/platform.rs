//! The platform collaborator interface.
//!
//! The pipeline treats the remote platform as an opaque REST client: every
//! operation here is consumed strictly through its contract. [`RestClient`]
//! (in `rest`) is the production implementation; tests substitute recording
//! doubles.
//!
//! [`RestClient`]: crate::rest::RestClient

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Direction of a transfer progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local file moving to platform storage.
    Upload,
    /// Platform file moving to local disk.
    Download,
}

/// Fractional transfer progress callback: `(direction, fraction in [0, 1])`.
pub type TransferProgressFn = Arc<dyn Fn(TransferDirection, f64) + Send + Sync>;

/// Inputs to a single file upload.
pub struct UploadParams {
    /// Local file to transmit.
    pub local_path: PathBuf,
    /// Optional platform folder to file the upload under.
    pub folder_id: Option<String>,
    /// Optional progress observer.
    pub progress: Option<TransferProgressFn>,
    /// Transfer slots granted by the coordinator; the client may split the
    /// body into at most this many concurrent parts.
    pub parallel_parts: u32,
}

impl std::fmt::Debug for UploadParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadParams")
            .field("local_path", &self.local_path)
            .field("folder_id", &self.folder_id)
            .field("progress", &self.progress.is_some())
            .field("parallel_parts", &self.parallel_parts)
            .finish()
    }
}

/// Result of a completed upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedFile {
    /// Opaque platform file identifier; never parsed by the pipeline.
    pub file_id: String,
}

/// Result of a create-job call.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedJob {
    /// Opaque platform job identifier; never parsed by the pipeline.
    pub job_id: String,
}

/// One release of an analysis application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisVersion {
    /// User-facing version name (e.g. `v2012`).
    pub display_name: String,
    /// Opaque code the create-job endpoint requires.
    pub version_code: String,
}

/// One analysis application from the platform catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Analysis application code (e.g. `openfoam`).
    pub code: String,
    /// Available releases.
    pub versions: Vec<AnalysisVersion>,
}

/// An input file attached to a job request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobInputFile {
    /// Platform file identifier.
    pub file_id: String,
    /// Whether the platform should decompress the file on the cluster.
    pub decompress: bool,
}

/// The platform's job-creation request shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    /// Job name.
    pub name: String,
    /// Analysis application code.
    pub analysis_code: String,
    /// Opaque analysis version code (display names are resolved before the
    /// request is built).
    pub analysis_version: String,
    /// Shell command executed on the compute nodes.
    pub command: String,
    /// Platform core type identifier.
    pub core_type: String,
    /// Cores per slot.
    pub cores_per_slot: u32,
    /// Slot count.
    pub slots: u32,
    /// Walltime in seconds.
    pub walltime_seconds: u64,
    /// Parsed license settings, when the job carries any.
    pub license_settings: Option<HashMap<String, String>>,
    /// Input files: the job's own upload first, then deduplicated shared
    /// inputs.
    pub input_files: Vec<JobInputFile>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Automation identifiers.
    pub automation_ids: Vec<String>,
}

/// Operations the pipeline requires of the platform REST client.
///
/// Transport, per-request retries, and proxy mechanics live behind this
/// trait; the pipeline only adds its own stage-level retry and warmup policy
/// on top.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetch the catalog of available analysis applications.
    async fn get_analyses(&self) -> anyhow::Result<Vec<Analysis>>;

    /// Upload a local file to platform storage.
    async fn upload_file(&self, params: UploadParams) -> anyhow::Result<UploadedFile>;

    /// Create a job from a request; the job is not yet submitted.
    async fn create_job(&self, request: &JobRequest) -> anyhow::Result<CreatedJob>;

    /// Assign a created job to a project within an organization.
    async fn assign_project_to_job(
        &self,
        org_code: &str,
        job_id: &str,
        project_id: &str,
    ) -> anyhow::Result<()>;

    /// Submit a created job for execution.
    async fn submit_job(&self, job_id: &str) -> anyhow::Result<()>;

    /// Issue a throwaway request to renew an authenticated proxy session.
    async fn warmup_proxy(&self) -> anyhow::Result<()>;
}
