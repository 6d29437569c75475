use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use skylift_engine::{Compression, PipelineConfig, ProxyMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompressionArg {
    /// Produce .tar.gz archives.
    Gzip,
    /// Produce plain .tar archives.
    None,
}

impl From<CompressionArg> for Compression {
    fn from(value: CompressionArg) -> Self {
        match value {
            CompressionArg::Gzip => Compression::Gzip,
            CompressionArg::None => Compression::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProxyModeArg {
    Off,
    Basic,
    Ntlm,
}

impl From<ProxyModeArg> for ProxyMode {
    fn from(value: ProxyModeArg) -> Self {
        match value {
            ProxyModeArg::Off => ProxyMode::Off,
            ProxyModeArg::Basic => ProxyMode::Basic,
            ProxyModeArg::Ntlm => ProxyMode::Ntlm,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "skylift", version, about = "Skylift batch job submission client")]
pub struct Cli {
    /// Jobs file: a JSON array of job specifications.
    pub jobs_file: PathBuf,

    /// Durable batch state file; reused to resume an interrupted run.
    #[arg(long, env = "SKYLIFT_STATE_FILE", default_value = "skylift-state.json")]
    pub state_file: PathBuf,

    /// Platform API base URL (overrides the saved profile).
    #[arg(long, env = "SKYLIFT_API_URL")]
    pub api_base_url: Option<String>,

    /// Platform API token (overrides the saved profile).
    #[arg(long, env = "SKYLIFT_API_TOKEN")]
    pub api_token: Option<String>,

    /// Persist the merged connection settings to the profile file, then run.
    #[arg(long)]
    pub save_profile: bool,

    /// Archive stage worker count.
    #[arg(long, env = "SKYLIFT_ARCHIVE_WORKERS", default_value_t = PipelineConfig::DEFAULT_STAGE_WORKERS as u16, value_parser = clap::value_parser!(u16).range(1..=128))]
    pub archive_workers: u16,

    /// Upload stage worker count.
    #[arg(long, env = "SKYLIFT_UPLOAD_WORKERS", default_value_t = PipelineConfig::DEFAULT_STAGE_WORKERS as u16, value_parser = clap::value_parser!(u16).range(1..=128))]
    pub upload_workers: u16,

    /// Submit stage worker count.
    #[arg(long, env = "SKYLIFT_SUBMIT_WORKERS", default_value_t = PipelineConfig::DEFAULT_STAGE_WORKERS as u16, value_parser = clap::value_parser!(u16).range(1..=128))]
    pub submit_workers: u16,

    /// Archive compression.
    #[arg(long, value_enum, default_value_t = CompressionArg::Gzip)]
    pub compression: CompressionArg,

    /// Only archive entries matching these patterns (wins over --exclude).
    #[arg(long = "include")]
    pub include_patterns: Vec<String>,

    /// Skip archive entries matching these patterns.
    #[arg(long = "exclude")]
    pub exclude_patterns: Vec<String>,

    /// Emit all files at the archive root; duplicate names fail the job.
    #[arg(long)]
    pub flatten: bool,

    /// Store archive entries under absolute paths.
    #[arg(long)]
    pub absolute_paths: bool,

    /// Upload attempts for transient proxy/timeout failures.
    #[arg(long, env = "SKYLIFT_MAX_RETRIES", default_value_t = PipelineConfig::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Proxy session mode of the HTTP client.
    #[arg(long, value_enum, env = "SKYLIFT_PROXY_MODE", default_value_t = ProxyModeArg::Off)]
    pub proxy_mode: ProxyModeArg,

    /// Delete each local archive after its upload succeeds.
    #[arg(long)]
    pub rm_tar: bool,

    /// Disable multi-part parallelism for large uploads.
    #[arg(long)]
    pub single_part: bool,

    /// Process-wide cap on concurrent upload transfer slots.
    #[arg(long, env = "SKYLIFT_TRANSFER_SLOTS", default_value_t = PipelineConfig::DEFAULT_TRANSFER_SLOT_BUDGET)]
    pub transfer_slots: usize,

    /// Submit-existing-files mode: skip archival and upload entirely.
    #[arg(long)]
    pub skip_tar_upload: bool,

    /// Files attached to every job: comma-separated id:<opaque> entries and
    /// local paths.
    #[arg(long, env = "SKYLIFT_EXTRA_INPUT_FILES")]
    pub extra_input_files: Option<String>,

    /// Ask the platform not to decompress the shared input files.
    #[arg(long)]
    pub no_decompress_extras: bool,
}

impl Cli {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut cfg = PipelineConfig::new(self.state_file.clone());
        cfg.archive_workers = self.archive_workers as usize;
        cfg.upload_workers = self.upload_workers as usize;
        cfg.submit_workers = self.submit_workers as usize;
        cfg.compression = self.compression.into();
        cfg.include_patterns = self.include_patterns.clone();
        cfg.exclude_patterns = self.exclude_patterns.clone();
        cfg.flatten = self.flatten;
        cfg.absolute_paths = self.absolute_paths;
        cfg.max_retries = self.max_retries;
        cfg.proxy_mode = self.proxy_mode.into();
        cfg.rm_tar_on_success = self.rm_tar;
        cfg.multi_part = !self.single_part;
        cfg.transfer_slot_budget = self.transfer_slots;
        cfg.skip_tar_upload = self.skip_tar_upload;
        cfg.extra_input_files = self.extra_input_files.clone();
        cfg.decompress_extras = !self.no_decompress_extras;
        cfg
    }
}
