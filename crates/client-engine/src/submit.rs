use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use skylift_core::spec::JobSpec;

use crate::api::{LogLevel, StageKind};
use crate::catalog::AnalysisCatalog;
use crate::pipeline::{PipelineCtx, SharedRx, WorkItem, fail_job, next_item};
use crate::platform::{JobInputFile, JobRequest};
use crate::shared_inputs::SharedInputSet;
use crate::state::StageStatus;

const ASSIGN_ATTEMPTS: u32 = 3;
const ASSIGN_DELAY_CAP: Duration = Duration::from_secs(60);

/// Effective per-job submission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitMode {
    Submit,
    CreateOnly,
}

/// Canonicalize the raw submit-mode string. Empty means submit.
pub(crate) fn canonical_submit_mode(raw: &str) -> Result<SubmitMode, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "submit" | "yes" | "true" | "create_and_submit" => Ok(SubmitMode::Submit),
        "create_only" | "no" | "false" | "draft" => Ok(SubmitMode::CreateOnly),
        other => Err(format!("unrecognized submit mode {other:?}")),
    }
}

pub(crate) fn walltime_seconds(hours: f64) -> u64 {
    (hours * 3600.0).round() as u64
}

/// Convert a spec plus the resolved identifiers into the platform's
/// job-request shape.
pub(crate) fn build_job_request(
    spec: &JobSpec,
    file_id: Option<&str>,
    no_decompress: bool,
    shared: &SharedInputSet,
    catalog: &AnalysisCatalog,
) -> Result<JobRequest, String> {
    if !spec.walltime_hours.is_finite() || spec.walltime_hours <= 0.0 {
        return Err(format!("invalid walltime: {} hours", spec.walltime_hours));
    }

    let analysis_version = catalog
        .resolve_version(&spec.analysis_code, &spec.analysis_version)
        .unwrap_or(&spec.analysis_version)
        .to_string();

    let license_settings = match &spec.license_settings {
        Some(raw) => Some(
            serde_json::from_str::<HashMap<String, String>>(raw)
                .map_err(|err| format!("invalid license settings JSON: {err}"))?,
        ),
        None => None,
    };

    // The job's own upload first, then its extras, then deduplicated shared
    // inputs.
    let mut seen: HashSet<String> = HashSet::new();
    let mut input_files = Vec::new();
    if let Some(file_id) = file_id {
        seen.insert(file_id.to_string());
        input_files.push(JobInputFile {
            file_id: file_id.to_string(),
            decompress: !no_decompress,
        });
    }
    for extra in &spec.extra_file_ids {
        if seen.insert(extra.clone()) {
            input_files.push(JobInputFile {
                file_id: extra.clone(),
                decompress: true,
            });
        }
    }
    for shared_file in &shared.files {
        if seen.insert(shared_file.file_id.clone()) {
            input_files.push(shared_file.clone());
        }
    }

    Ok(JobRequest {
        name: spec.name.clone(),
        analysis_code: spec.analysis_code.clone(),
        analysis_version,
        command: spec.command.clone(),
        core_type: spec.core_type.clone(),
        cores_per_slot: spec.cores_per_slot,
        slots: spec.slots,
        walltime_seconds: walltime_seconds(spec.walltime_hours),
        license_settings,
        input_files,
        tags: spec.tags.clone(),
        automation_ids: spec.automation_ids.clone(),
    })
}

pub(crate) async fn run_submit_worker(ctx: Arc<PipelineCtx>, rx: SharedRx) {
    // The catalog gate: no submit work starts until the resolver publishes.
    let mut catalog_rx = ctx.catalog_rx.clone();
    let catalog = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return,
        res = catalog_rx.wait_for(|c| c.is_some()) => match res {
            Ok(guard) => match guard.as_ref() {
                Some(catalog) => catalog.clone(),
                None => return,
            },
            Err(_) => return,
        },
    };

    while let Some(item) = next_item(&rx, &ctx.cancel).await {
        ctx.reporter.gauges.enter(StageKind::Submit);
        process_item(&ctx, &catalog, item).await;
        ctx.reporter.gauges.leave(StageKind::Submit);
    }
}

async fn process_item(ctx: &PipelineCtx, catalog: &AnalysisCatalog, item: WorkItem) {
    let Some(mut row) = ctx.store.get(item.index) else {
        return;
    };
    if row.is_complete() {
        return;
    }

    let spec = &item.spec;
    let mode = match canonical_submit_mode(&spec.submit_mode) {
        Ok(mode) => mode,
        Err(err) => {
            fail_job(ctx, row, StageKind::Submit, &err).await;
            return;
        }
    };

    row.submit_status = StageStatus::InProgress;
    row.error_message = None;
    ctx.store.update(row.clone()).await;
    ctx.reporter.state_changed(&row, StageKind::Submit, None);

    if row.create_status != StageStatus::Success || row.job_id.is_none() {
        let request = match build_job_request(
            spec,
            row.file_id.as_deref(),
            spec.no_decompress,
            &ctx.shared_inputs,
            catalog,
        ) {
            Ok(request) => request,
            Err(err) => {
                fail_job(ctx, row, StageKind::Submit, &err).await;
                return;
            }
        };

        let created = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            res = ctx.client.create_job(&request) => res,
        };
        match created {
            Ok(created) => {
                row.job_id = Some(created.job_id);
                row.create_status = StageStatus::Success;
                ctx.store.update(row.clone()).await;
                ctx.reporter.state_changed(&row, StageKind::Submit, None);
                ctx.reporter.log(
                    LogLevel::Info,
                    "job created",
                    StageKind::Submit,
                    &row.job_name,
                );
            }
            Err(err) => {
                fail_job(
                    ctx,
                    row,
                    StageKind::Submit,
                    &format!("create job: {err:#}"),
                )
                .await;
                return;
            }
        }
    }

    if let (Some(project_id), Some(org_code), Some(job_id)) =
        (&spec.project_id, &spec.org_code, &row.job_id)
    {
        assign_project(ctx, &row.job_name, org_code, job_id, project_id).await;
    }

    match mode {
        SubmitMode::Submit => {
            let Some(job_id) = row.job_id.clone() else {
                fail_job(ctx, row, StageKind::Submit, "job created without an id").await;
                return;
            };
            let submitted = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return,
                res = ctx.client.submit_job(&job_id) => res,
            };
            match submitted {
                Ok(()) => {
                    row.submit_status = StageStatus::Success;
                    ctx.store.update(row.clone()).await;
                    ctx.reporter.state_changed(&row, StageKind::Submit, None);
                    ctx.reporter.log(
                        LogLevel::Info,
                        "job submitted",
                        StageKind::Submit,
                        &row.job_name,
                    );
                    ctx.reporter.job_finished(StageKind::Submit, &row.job_name);
                }
                Err(err) => {
                    fail_job(
                        ctx,
                        row,
                        StageKind::Submit,
                        &format!("submit job: {err:#}"),
                    )
                    .await;
                }
            }
        }
        SubmitMode::CreateOnly => {
            row.submit_status = StageStatus::Skipped;
            ctx.store.update(row.clone()).await;
            ctx.reporter.state_changed(&row, StageKind::Submit, None);
            ctx.reporter.job_finished(StageKind::Submit, &row.job_name);
        }
    }
}

/// Project assignment is best-effort: up to three attempts with exponential
/// backoff, then a warning. The job proceeds either way.
async fn assign_project(
    ctx: &PipelineCtx,
    job_name: &str,
    org_code: &str,
    job_id: &str,
    project_id: &str,
) {
    let mut delay = ctx.cfg.assign_retry_base;
    for attempt in 1..=ASSIGN_ATTEMPTS {
        let res = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            res = ctx.client.assign_project_to_job(org_code, job_id, project_id) => res,
        };
        match res {
            Ok(()) => return,
            Err(err) => {
                if attempt == ASSIGN_ATTEMPTS {
                    ctx.reporter.log(
                        LogLevel::Warning,
                        &format!(
                            "assign project {project_id} failed after {ASSIGN_ATTEMPTS} attempts: {err:#}"
                        ),
                        StageKind::Submit,
                        job_name,
                    );
                    return;
                }
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay.min(ASSIGN_DELAY_CAP)) => {}
                }
                delay = delay.saturating_mul(2);
            }
        }
    }
}
