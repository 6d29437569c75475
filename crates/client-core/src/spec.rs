//! Batch job specifications and the jobs-file loader.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One job to run on the platform: a local run directory plus the analysis,
/// hardware, and submission settings for it.
///
/// A `JobSpec` is immutable once ingested; the pipeline never writes back
/// into it. `analysis_version` may be either a display name (resolved against
/// the platform catalog at submit time) or an opaque version code passed
/// through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Local run directory containing all inputs for this job.
    pub directory: PathBuf,
    /// Job name, unique within the batch.
    pub name: String,
    /// Platform analysis application code (e.g. `openfoam`).
    pub analysis_code: String,
    /// Analysis version: display name or opaque version code.
    pub analysis_version: String,
    /// Shell command executed on the compute nodes.
    pub command: String,
    /// Platform core type identifier.
    #[serde(default = "default_core_type")]
    pub core_type: String,
    #[serde(default = "default_one")]
    pub cores_per_slot: u32,
    #[serde(default = "default_one")]
    pub slots: u32,
    /// Walltime in hours; converted to seconds when the job is created.
    #[serde(default = "default_walltime_hours")]
    pub walltime_hours: f64,
    /// License settings as a JSON object string (`{"SERVER":"1234@host"}`).
    #[serde(default)]
    pub license_settings: Option<String>,
    /// Raw submit mode; canonicalized to submit / create-only at submit time.
    #[serde(default)]
    pub submit_mode: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub org_code: Option<String>,
    /// Identifiers of already-uploaded files attached to this job only.
    #[serde(default)]
    pub extra_file_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Restrict the archive to this subtree of the run directory.
    #[serde(default)]
    pub tar_subpath: Option<String>,
    /// Ask the platform not to decompress this job's archive.
    #[serde(default)]
    pub no_decompress: bool,
    #[serde(default)]
    pub automation_ids: Vec<String>,
}

fn default_core_type() -> String {
    "standard".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_walltime_hours() -> f64 {
    1.0
}

/// Read a jobs file: a JSON array of job specifications.
pub fn load_jobs_file(path: &Path) -> anyhow::Result<Vec<JobSpec>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("read jobs file {}: {err}", path.display()))?;
    let specs: Vec<JobSpec> = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("parse jobs file {}: {err}", path.display()))?;
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_spec_gets_defaults() {
        let json = r#"{
            "directory": "/work/Run_1",
            "name": "run-1",
            "analysis_code": "openfoam",
            "analysis_version": "v2012",
            "command": "./Allrun"
        }"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.core_type, "standard");
        assert_eq!(spec.cores_per_slot, 1);
        assert_eq!(spec.slots, 1);
        assert_eq!(spec.walltime_hours, 1.0);
        assert_eq!(spec.submit_mode, "");
        assert!(spec.extra_file_ids.is_empty());
        assert!(!spec.no_decompress);
    }

    #[test]
    fn full_spec_round_trips() {
        let spec = JobSpec {
            directory: PathBuf::from("/work/Run_2"),
            name: "run-2".to_string(),
            analysis_code: "ansys_fluent".to_string(),
            analysis_version: "2023R1".to_string(),
            command: "fluent -g < run.jou".to_string(),
            core_type: "hpc-3".to_string(),
            cores_per_slot: 16,
            slots: 2,
            walltime_hours: 4.5,
            license_settings: Some(r#"{"SERVER":"1234@lic"}"#.to_string()),
            submit_mode: "create_only".to_string(),
            project_id: Some("proj-9".to_string()),
            org_code: Some("acme".to_string()),
            extra_file_ids: vec!["id_a".to_string()],
            tags: vec!["nightly".to_string()],
            tar_subpath: Some("case".to_string()),
            no_decompress: true,
            automation_ids: vec!["auto-1".to_string()],
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, spec.name);
        assert_eq!(back.walltime_hours, spec.walltime_hours);
        assert_eq!(back.tar_subpath, spec.tar_subpath);
        assert!(back.no_decompress);
    }
}
