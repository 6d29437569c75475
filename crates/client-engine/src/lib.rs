#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process batch pipeline for `skylift` (archival, upload, job submission).

/// Public API for the engine crate.
pub mod api;

/// Collaborator interface to the remote platform.
pub mod platform;

/// Durable per-job progress records.
pub mod state;

mod archive;
mod catalog;
mod ingest;
mod pipeline;
mod report;
mod rest;
mod shared_inputs;
mod submit;
mod tarball;
mod transfer;
mod upload;

pub use api::{
    Compression, LogCallback, LogLevel, PipelineCallbacks, PipelineConfig, PipelineError,
    PipelineEvent, PipelineHandle, ProgressCallback, ProxyMode, RunReport, StageKind, StateChange,
    StateChangeCallback, start_pipeline,
};
pub use platform::{
    Analysis, AnalysisVersion, CreatedJob, JobInputFile, JobRequest, PlatformClient,
    TransferDirection, TransferProgressFn, UploadParams, UploadedFile,
};
pub use rest::RestClient;
pub use skylift_core::spec::JobSpec;
pub use state::{JobState, StageStatus, StateLoadError, StateStore};
