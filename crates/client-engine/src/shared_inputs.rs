use std::collections::HashSet;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::api::{LogLevel, PipelineConfig, PipelineError, StageKind};
use crate::ingest::lexical_absolute;
use crate::platform::{JobInputFile, PlatformClient, UploadParams};
use crate::report::Reporter;

/// Input files attached to every job in the batch. Frozen before stage-1
/// workers begin and shared by reference with the submit stage.
#[derive(Debug, Default, Clone)]
pub(crate) struct SharedInputSet {
    pub(crate) files: Vec<JobInputFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SharedInputEntry {
    /// Already uploaded; the opaque identifier is used as-is.
    Id(String),
    /// Local file to upload once for the whole batch.
    Path(PathBuf),
}

/// Split the raw `extra-input-files` specification: comma-separated entries,
/// each `id:<opaque>` or a local filesystem path.
pub(crate) fn parse_entries(raw: &str) -> Vec<SharedInputEntry> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.strip_prefix("id:") {
            Some(id) => SharedInputEntry::Id(id.trim().to_string()),
            None => SharedInputEntry::Path(PathBuf::from(entry)),
        })
        .collect()
}

/// Resolve the shared-input specification before any per-job work begins.
/// Path entries are uploaded sequentially; failures abort the run.
pub(crate) async fn resolve_shared_inputs(
    cfg: &PipelineConfig,
    client: &dyn PlatformClient,
    reporter: &Reporter,
    cancel: &CancellationToken,
) -> Result<SharedInputSet, PipelineError> {
    let raw = match cfg.extra_input_files.as_deref() {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(SharedInputSet::default()),
    };

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_paths: HashSet<PathBuf> = HashSet::new();
    let mut files = Vec::new();

    for entry in parse_entries(raw) {
        match entry {
            SharedInputEntry::Id(id) => {
                if id.is_empty() {
                    return Err(PipelineError::SharedInput(
                        "empty file identifier in extra-input-files".to_string(),
                    ));
                }
                if seen_ids.insert(id.clone()) {
                    files.push(JobInputFile {
                        file_id: id,
                        decompress: cfg.decompress_extras,
                    });
                }
            }
            SharedInputEntry::Path(path) => {
                let path = lexical_absolute(&path).map_err(|err| {
                    PipelineError::SharedInput(format!("{}: {err}", path.display()))
                })?;
                if !path.is_file() {
                    return Err(PipelineError::SharedInput(format!(
                        "shared input path is not a file: {}",
                        path.display()
                    )));
                }
                if !seen_paths.insert(path.clone()) {
                    continue;
                }

                reporter.log(
                    LogLevel::Info,
                    &format!("uploading shared input {}", path.display()),
                    StageKind::Upload,
                    "",
                );
                let uploaded = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    res = client.upload_file(UploadParams {
                        local_path: path.clone(),
                        folder_id: None,
                        progress: None,
                        parallel_parts: 1,
                    }) => res,
                };
                let uploaded = uploaded.map_err(|err| {
                    PipelineError::SharedInput(format!(
                        "upload shared input {}: {err:#}",
                        path.display()
                    ))
                })?;
                if seen_ids.insert(uploaded.file_id.clone()) {
                    files.push(JobInputFile {
                        file_id: uploaded.file_id,
                        decompress: cfg.decompress_extras,
                    });
                }
            }
        }
    }

    Ok(SharedInputSet { files })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_split_on_commas_and_trim() {
        let entries = parse_entries(" id:abc , /data/mesh.msh ,, id:def ");
        assert_eq!(
            entries,
            vec![
                SharedInputEntry::Id("abc".to_string()),
                SharedInputEntry::Path(PathBuf::from("/data/mesh.msh")),
                SharedInputEntry::Id("def".to_string()),
            ]
        );
    }

    #[test]
    fn empty_specification_yields_no_entries() {
        assert!(parse_entries("").is_empty());
        assert!(parse_entries(" , ,").is_empty());
    }
}
