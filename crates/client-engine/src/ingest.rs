use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use skylift_core::spec::JobSpec;

use crate::api::{PipelineError, StageKind};
use crate::archive::file_is_nonempty;
use crate::pipeline::{PipelineCtx, WorkItem, forward};
use crate::state::{JobState, StageStatus};
use crate::submit::{SubmitMode, canonical_submit_mode};

/// Lexically resolve a path to absolute form: join onto the working
/// directory if relative, drop `.` components, and fold `..` without
/// touching the filesystem.
pub(crate) fn lexical_absolute(path: &Path) -> std::io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(comp.as_os_str());
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Normalize directories to absolute paths and validate the batch shape.
pub(crate) fn normalize_specs(specs: Vec<JobSpec>) -> Result<Vec<Arc<JobSpec>>, PipelineError> {
    if specs.is_empty() {
        return Err(PipelineError::SpecValidation("empty batch".to_string()));
    }

    let mut names: HashSet<&str> = HashSet::new();
    for spec in &specs {
        if spec.name.trim().is_empty() {
            return Err(PipelineError::SpecValidation(format!(
                "job with directory {} has an empty name",
                spec.directory.display()
            )));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(PipelineError::SpecValidation(format!(
                "duplicate job name {:?}",
                spec.name
            )));
        }
        if !spec.walltime_hours.is_finite() || spec.walltime_hours <= 0.0 {
            return Err(PipelineError::SpecValidation(format!(
                "job {:?} has invalid walltime {} hours",
                spec.name, spec.walltime_hours
            )));
        }
        if canonical_submit_mode(&spec.submit_mode).is_err() {
            return Err(PipelineError::SpecValidation(format!(
                "job {:?} has unrecognized submit mode {:?}",
                spec.name, spec.submit_mode
            )));
        }
    }

    specs
        .into_iter()
        .map(|mut spec| {
            spec.directory = lexical_absolute(&spec.directory).map_err(|err| {
                PipelineError::SpecValidation(format!(
                    "resolve directory {}: {err}",
                    spec.directory.display()
                ))
            })?;
            Ok(Arc::new(spec))
        })
        .collect()
}

enum EntryStage {
    AlreadyDone,
    Archive,
    Upload,
    Submit,
    SkipToSubmit,
}

fn select_entry_stage(row: &JobState, spec: &JobSpec, skip_tar_upload: bool) -> EntryStage {
    if row.is_complete() {
        return EntryStage::AlreadyDone;
    }

    // A persisted archive success only counts if the file is still there.
    let tar_ok = row.tar_status == StageStatus::Success
        && row.tar_path.as_deref().is_some_and(file_is_nonempty);
    let tar_skipped = row.tar_status == StageStatus::Skipped;
    let upload_ok = row.upload_status == StageStatus::Success && row.file_id.is_some();
    let upload_skipped = row.upload_status == StageStatus::Skipped;
    let mode = canonical_submit_mode(&spec.submit_mode).unwrap_or(SubmitMode::Submit);

    if skip_tar_upload && !tar_ok {
        return EntryStage::SkipToSubmit;
    }
    if tar_ok
        && upload_ok
        && row.job_id.is_some()
        && row.submit_status == StageStatus::Pending
        && mode == SubmitMode::Submit
    {
        return EntryStage::Submit;
    }
    if (tar_ok || tar_skipped) && (upload_ok || upload_skipped) {
        return EntryStage::Submit;
    }
    if tar_ok {
        return EntryStage::Upload;
    }
    EntryStage::Archive
}

/// Seed the state store and feed every job into its entry queue. Dropping
/// the senders on return is what lets the stage queues close once each
/// stage's workers finish.
pub(crate) async fn run_feeder(
    ctx: Arc<PipelineCtx>,
    specs: Vec<Arc<JobSpec>>,
    archive_tx: mpsc::Sender<WorkItem>,
    upload_tx: mpsc::Sender<WorkItem>,
    submit_tx: mpsc::Sender<WorkItem>,
) {
    for (pos, spec) in specs.into_iter().enumerate() {
        let index = (pos + 1) as u32;
        let mut row = ctx.store.initialize(index, &spec.name, &spec.directory);

        let entry = select_entry_stage(&row, &spec, ctx.cfg.skip_tar_upload);
        let item = WorkItem { index, spec };

        let sent = match entry {
            EntryStage::AlreadyDone => {
                ctx.reporter.job_finished(StageKind::Submit, &row.job_name);
                continue;
            }
            EntryStage::SkipToSubmit => {
                row.tar_status = StageStatus::Skipped;
                row.upload_status = StageStatus::Skipped;
                ctx.store.update(row.clone()).await;
                ctx.reporter.state_changed(&row, StageKind::Archive, None);
                ctx.reporter.state_changed(&row, StageKind::Upload, None);
                forward(&submit_tx, item, &ctx.cancel).await
            }
            EntryStage::Submit => forward(&submit_tx, item, &ctx.cancel).await,
            EntryStage::Upload => forward(&upload_tx, item, &ctx.cancel).await,
            EntryStage::Archive => forward(&archive_tx, item, &ctx.cancel).await,
        };

        if !sent {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn spec(name: &str, submit_mode: &str) -> JobSpec {
        JobSpec {
            directory: PathBuf::from("/work/Run_1"),
            name: name.to_string(),
            analysis_code: "openfoam".to_string(),
            analysis_version: "v2012".to_string(),
            command: "./Allrun".to_string(),
            core_type: "standard".to_string(),
            cores_per_slot: 1,
            slots: 1,
            walltime_hours: 1.0,
            license_settings: None,
            submit_mode: submit_mode.to_string(),
            project_id: None,
            org_code: None,
            extra_file_ids: Vec::new(),
            tags: Vec::new(),
            tar_subpath: None,
            no_decompress: false,
            automation_ids: Vec::new(),
        }
    }

    fn row() -> JobState {
        let now = Utc::now();
        JobState {
            index: 1,
            job_name: "run-1".to_string(),
            directory: PathBuf::from("/work/Run_1"),
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

    #[test]
    fn lexical_absolute_folds_dot_components() {
        let got = lexical_absolute(Path::new("/work/./batch/../Run_1")).unwrap();
        assert_eq!(got, PathBuf::from("/work/Run_1"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = normalize_specs(vec![spec("run-1", ""), spec("run-1", "")]).unwrap_err();
        assert!(matches!(err, PipelineError::SpecValidation(_)));
    }

    #[test]
    fn empty_batches_are_rejected() {
        assert!(matches!(
            normalize_specs(Vec::new()),
            Err(PipelineError::SpecValidation(_))
        ));
    }

    #[test]
    fn fresh_rows_enter_at_the_archive_stage() {
        assert!(matches!(
            select_entry_stage(&row(), &spec("run-1", ""), false),
            EntryStage::Archive
        ));
    }

    #[test]
    fn missing_archive_file_demotes_a_persisted_tar_success() {
        let mut row = row();
        row.tar_status = StageStatus::Success;
        row.tar_path = Some(PathBuf::from("/nonexistent/run.tar.gz"));
        assert!(matches!(
            select_entry_stage(&row, &spec("run-1", ""), false),
            EntryStage::Archive
        ));
    }

    #[test]
    fn uploaded_rows_enter_at_the_submit_stage() {
        let dir = tempfile::tempdir().unwrap();
        let tar = dir.path().join("run.tar.gz");
        std::fs::write(&tar, b"data").unwrap();

        let mut row = row();
        row.tar_status = StageStatus::Success;
        row.tar_path = Some(tar);
        row.upload_status = StageStatus::Success;
        row.file_id = Some("F1".to_string());
        assert!(matches!(
            select_entry_stage(&row, &spec("run-1", ""), false),
            EntryStage::Submit
        ));
    }

    #[test]
    fn archived_rows_enter_at_the_upload_stage() {
        let dir = tempfile::tempdir().unwrap();
        let tar = dir.path().join("run.tar.gz");
        std::fs::write(&tar, b"data").unwrap();

        let mut row = row();
        row.tar_status = StageStatus::Success;
        row.tar_path = Some(tar);
        assert!(matches!(
            select_entry_stage(&row, &spec("run-1", ""), false),
            EntryStage::Upload
        ));
    }

    #[test]
    fn skip_tar_upload_jumps_to_submit() {
        assert!(matches!(
            select_entry_stage(&row(), &spec("run-1", ""), true),
            EntryStage::SkipToSubmit
        ));
    }

    #[test]
    fn completed_rows_are_not_re_enqueued() {
        let mut row = row();
        row.tar_status = StageStatus::Success;
        row.upload_status = StageStatus::Success;
        row.create_status = StageStatus::Success;
        row.submit_status = StageStatus::Success;
        row.job_id = Some("J1".to_string());
        assert!(matches!(
            select_entry_stage(&row, &spec("run-1", ""), false),
            EntryStage::AlreadyDone
        ));
    }
}
