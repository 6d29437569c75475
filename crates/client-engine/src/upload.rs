use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::{LogLevel, StageKind};
use crate::pipeline::{PipelineCtx, SharedRx, WorkItem, fail_job, forward, next_item};
use crate::platform::{TransferDirection, UploadParams, UploadedFile};
use crate::state::{JobState, StageStatus};

/// Whether an upload failure looks like a transient proxy/timeout condition
/// worth retrying. Substring matching against the formatted error is fragile
/// but pragmatic; this is the single place to swap in a structured check once
/// the REST client grows typed errors.
pub(crate) fn is_transient_upload_error(message: &str) -> bool {
    const PATTERNS: [&str; 4] = [
        "timeout",
        "SocketTimeoutException",
        "connection reset",
        "EOF",
    ];
    PATTERNS.iter().any(|p| message.contains(p))
}

enum UploadOutcome {
    Done(UploadedFile),
    Cancelled,
    Failed(String),
}

pub(crate) async fn run_upload_worker(
    ctx: Arc<PipelineCtx>,
    rx: SharedRx,
    submit_tx: mpsc::Sender<WorkItem>,
) {
    while let Some(item) = next_item(&rx, &ctx.cancel).await {
        ctx.reporter.gauges.enter(StageKind::Upload);
        process_item(&ctx, item, &submit_tx).await;
        ctx.reporter.gauges.leave(StageKind::Upload);
    }
}

async fn process_item(ctx: &PipelineCtx, item: WorkItem, submit_tx: &mpsc::Sender<WorkItem>) {
    let Some(mut row) = ctx.store.get(item.index) else {
        return;
    };

    // Resume: a prior run already uploaded this archive.
    if row.upload_status == StageStatus::Success && row.file_id.is_some() {
        forward(submit_tx, item, &ctx.cancel).await;
        return;
    }

    row.upload_status = StageStatus::InProgress;
    row.error_message = None;
    ctx.store.update(row.clone()).await;
    ctx.reporter.state_changed(&row, StageKind::Upload, None);

    let Some(tar_path) = row.tar_path.clone() else {
        fail_job(ctx, row, StageKind::Upload, "no archive recorded for upload").await;
        return;
    };

    let size = match tokio::fs::metadata(&tar_path).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            fail_job(
                ctx,
                row,
                StageKind::Upload,
                &format!("read local archive {}: {err}", tar_path.display()),
            )
            .await;
            return;
        }
    };

    let slots = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return,
        res = ctx.transfers.acquire(size) => match res {
            Ok(slots) => slots,
            Err(err) => {
                fail_job(ctx, row, StageKind::Upload, &format!("{err:#}")).await;
                return;
            }
        },
    };

    let outcome = upload_with_retries(ctx, &row, &tar_path, slots.slots).await;
    drop(slots);

    match outcome {
        UploadOutcome::Done(uploaded) => {
            row.upload_status = StageStatus::Success;
            row.file_id = Some(uploaded.file_id);
            ctx.store.update(row.clone()).await;
            ctx.reporter.state_changed(&row, StageKind::Upload, None);
            ctx.reporter.log(
                LogLevel::Info,
                "archive uploaded",
                StageKind::Upload,
                &row.job_name,
            );

            if ctx.cfg.rm_tar_on_success {
                if let Err(err) = tokio::fs::remove_file(&tar_path).await {
                    ctx.reporter.log(
                        LogLevel::Warning,
                        &format!("remove archive {}: {err}", tar_path.display()),
                        StageKind::Upload,
                        &row.job_name,
                    );
                }
            }

            forward(submit_tx, item, &ctx.cancel).await;
        }
        // Cancelled mid-upload: the row stays in_progress on disk and the
        // next run retries this stage.
        UploadOutcome::Cancelled => {}
        UploadOutcome::Failed(message) => {
            fail_job(ctx, row, StageKind::Upload, &message).await;
        }
    }
}

async fn upload_with_retries(
    ctx: &PipelineCtx,
    row: &JobState,
    tar_path: &Path,
    slots: u32,
) -> UploadOutcome {
    let attempts = ctx.cfg.max_retries.max(1);

    for attempt in 1..=attempts {
        if ctx.cfg.proxy_mode.needs_session_warmup() {
            let warmed = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return UploadOutcome::Cancelled,
                res = ctx.client.warmup_proxy() => res,
            };
            if let Err(err) = warmed {
                ctx.reporter.log(
                    LogLevel::Warning,
                    &format!("proxy warmup failed: {err:#}"),
                    StageKind::Upload,
                    &row.job_name,
                );
            }
        }

        let progress = {
            let reporter = ctx.reporter.clone();
            let snapshot = row.clone();
            Arc::new(move |direction: TransferDirection, fraction: f64| {
                if direction == TransferDirection::Upload {
                    reporter.state_changed(&snapshot, StageKind::Upload, Some(fraction));
                }
            }) as Arc<dyn Fn(TransferDirection, f64) + Send + Sync>
        };

        let res = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return UploadOutcome::Cancelled,
            res = ctx.client.upload_file(UploadParams {
                local_path: tar_path.to_path_buf(),
                folder_id: None,
                progress: Some(progress),
                parallel_parts: slots,
            }) => res,
        };

        let err = match res {
            Ok(uploaded) => return UploadOutcome::Done(uploaded),
            Err(err) => format!("{err:#}"),
        };

        if !is_transient_upload_error(&err) {
            return UploadOutcome::Failed(err);
        }
        if attempt == attempts {
            return UploadOutcome::Failed(format!(
                "upload retries exhausted after {attempts} attempts: {err}"
            ));
        }

        ctx.reporter.log(
            LogLevel::Warning,
            &format!("transient upload failure (attempt {attempt}/{attempts}): {err}"),
            StageKind::Upload,
            &row.job_name,
        );
        if ctx.cfg.proxy_mode.needs_session_warmup() {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return UploadOutcome::Cancelled,
                _ = tokio::time::sleep(ctx.cfg.retry_sleep) => {}
            }
        }
    }

    UploadOutcome::Failed("upload retries exhausted".to_string())
}
