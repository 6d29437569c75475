use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use skylift_core::spec::JobSpec;

use crate::api::{
    LogLevel, PipelineConfig, PipelineError, PipelineEvent, PipelineHandle, RunReport, StageKind,
};
use crate::archive::{common_parent, run_archive_worker};
use crate::catalog::{AnalysisCatalog, run_resolver};
use crate::ingest::{normalize_specs, run_feeder};
use crate::platform::PlatformClient;
use crate::report::{Reporter, build_run_report};
use crate::shared_inputs::{SharedInputSet, resolve_shared_inputs};
use crate::state::{JobState, StageStatus, StateStore};
use crate::submit::run_submit_worker;
use crate::tarball::{Archiver, TarArchiver};
use crate::transfer::TransferCoordinator;
use crate::upload::run_upload_worker;

pub(crate) struct PipelineInner {
    pub(crate) event_tx: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
    cancel_announced: AtomicBool,
}

impl PipelineInner {
    pub(crate) fn request_cancel(&self) {
        if !self.cancel_announced.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(PipelineEvent::CancelRequested);
            self.cancel.cancel();
        }
    }
}

/// Transient tuple carrying one job between stages.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub(crate) index: u32,
    pub(crate) spec: Arc<JobSpec>,
}

/// Stage input queue shared across that stage's workers. One worker waits on
/// `recv` at a time; the rest queue on the lock, and cancellation preempts
/// both waits.
pub(crate) type SharedRx = Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>;

/// Everything a stage worker needs, shared by reference.
pub(crate) struct PipelineCtx {
    pub(crate) cfg: PipelineConfig,
    pub(crate) client: Arc<dyn PlatformClient>,
    pub(crate) store: Arc<StateStore>,
    pub(crate) reporter: Arc<Reporter>,
    pub(crate) cancel: CancellationToken,
    pub(crate) transfers: TransferCoordinator,
    pub(crate) shared_inputs: SharedInputSet,
    pub(crate) catalog_rx: watch::Receiver<Option<Arc<AnalysisCatalog>>>,
    pub(crate) archive_base: PathBuf,
    pub(crate) archiver: Arc<dyn Archiver>,
}

/// Pull the next item, preferring cancellation over queue progress. `None`
/// means the queue is closed and drained, or the run was cancelled.
pub(crate) async fn next_item(rx: &SharedRx, cancel: &CancellationToken) -> Option<WorkItem> {
    let mut guard = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        guard = rx.lock() => guard,
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = guard.recv() => item,
    }
}

/// Cancellation-aware send into the next stage. Returns false when the run
/// was cancelled (no further sends are attempted by the caller).
pub(crate) async fn forward(
    tx: &mpsc::Sender<WorkItem>,
    item: WorkItem,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

/// Mark one job failed in its stage: the item is not forwarded and the
/// pipeline continues with the rest of the batch.
pub(crate) async fn fail_job(
    ctx: &PipelineCtx,
    mut row: JobState,
    stage: StageKind,
    message: &str,
) {
    match stage {
        StageKind::Archive => row.tar_status = StageStatus::Failed,
        StageKind::Upload => row.upload_status = StageStatus::Failed,
        StageKind::Submit => {}
    }
    row.submit_status = StageStatus::Failed;
    row.error_message = Some(message.to_string());
    ctx.store.update(row.clone()).await;
    ctx.reporter.state_changed(&row, stage, None);
    ctx.reporter
        .log(LogLevel::Error, message, stage, &row.job_name);
    ctx.reporter.job_finished(stage, &row.job_name);
}

pub(crate) fn start_pipeline(
    config: PipelineConfig,
    client: Arc<dyn PlatformClient>,
    specs: Vec<JobSpec>,
    shared_state: Option<Arc<StateStore>>,
) -> PipelineHandle {
    let (event_tx, _) = broadcast::channel::<PipelineEvent>(1024);
    let inner = Arc::new(PipelineInner {
        event_tx,
        cancel: CancellationToken::new(),
        cancel_announced: AtomicBool::new(false),
    });

    let join = tokio::spawn(run_pipeline(inner.clone(), config, client, specs, shared_state));
    PipelineHandle { inner, join }
}

fn normalize_config(cfg: &mut PipelineConfig) {
    if cfg.archive_workers == 0 {
        cfg.archive_workers = PipelineConfig::DEFAULT_STAGE_WORKERS;
    }
    if cfg.upload_workers == 0 {
        cfg.upload_workers = PipelineConfig::DEFAULT_STAGE_WORKERS;
    }
    if cfg.submit_workers == 0 {
        cfg.submit_workers = PipelineConfig::DEFAULT_STAGE_WORKERS;
    }
    if cfg.queue_multiplier == 0 {
        cfg.queue_multiplier = PipelineConfig::DEFAULT_QUEUE_MULTIPLIER;
    }
    if cfg.max_retries == 0 {
        cfg.max_retries = 1;
    }
    if cfg.transfer_slot_budget == 0 {
        cfg.transfer_slot_budget = PipelineConfig::DEFAULT_TRANSFER_SLOT_BUDGET;
    }
    if cfg.progress_interval.is_zero() {
        cfg.progress_interval = PipelineConfig::DEFAULT_PROGRESS_INTERVAL;
    }
}

async fn run_pipeline(
    inner: Arc<PipelineInner>,
    mut cfg: PipelineConfig,
    client: Arc<dyn PlatformClient>,
    specs: Vec<JobSpec>,
    shared_state: Option<Arc<StateStore>>,
) -> Result<RunReport, PipelineError> {
    normalize_config(&mut cfg);
    let reporter = Arc::new(Reporter::new(inner.event_tx.clone(), cfg.callbacks.clone()));
    let cancel = inner.cancel.clone();

    let fail_run = |reporter: &Reporter, err: PipelineError| {
        reporter.emit(PipelineEvent::Error {
            message: err.to_string(),
        });
        reporter.emit(PipelineEvent::Stopped);
        err
    };

    let specs = match normalize_specs(specs) {
        Ok(specs) => specs,
        Err(err) => return Err(fail_run(&reporter, err)),
    };

    // Shared store injection keeps an embedding host and the pipeline
    // looking at the same rows.
    let store = match shared_state {
        Some(store) => store,
        None => match StateStore::load(&cfg.state_file) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                return Err(fail_run(&reporter, PipelineError::StateLoad(err.to_string())));
            }
        },
    };

    reporter.emit(PipelineEvent::Started);
    reporter.gauges.set_total(specs.len() as u64);
    let total = specs.len() as u64;

    let shared_inputs =
        match resolve_shared_inputs(&cfg, client.as_ref(), &reporter, &cancel).await {
            Ok(set) => set,
            Err(err) => return Err(fail_run(&reporter, err)),
        };

    let (catalog_tx, catalog_rx) = watch::channel::<Option<Arc<AnalysisCatalog>>>(None);
    let requested: Vec<(String, String)> = specs
        .iter()
        .map(|s| (s.analysis_code.clone(), s.analysis_version.clone()))
        .collect();
    let resolver = tokio::spawn(run_resolver(
        client.clone(),
        requested,
        reporter.clone(),
        cancel.clone(),
        catalog_tx,
    ));

    let dirs: Vec<PathBuf> = specs.iter().map(|s| s.directory.clone()).collect();
    let archive_base = common_parent(&dirs);

    let ctx = Arc::new(PipelineCtx {
        transfers: TransferCoordinator::new(cfg.transfer_slot_budget, cfg.multi_part),
        cfg,
        client,
        store: store.clone(),
        reporter: reporter.clone(),
        cancel: cancel.clone(),
        shared_inputs,
        catalog_rx,
        archive_base,
        archiver: Arc::new(TarArchiver),
    });

    let (archive_tx, archive_rx) =
        mpsc::channel::<WorkItem>(ctx.cfg.archive_workers * ctx.cfg.queue_multiplier);
    let (upload_tx, upload_rx) =
        mpsc::channel::<WorkItem>(ctx.cfg.upload_workers * ctx.cfg.queue_multiplier);
    let (submit_tx, submit_rx) =
        mpsc::channel::<WorkItem>(ctx.cfg.submit_workers * ctx.cfg.queue_multiplier);

    let archive_rx: SharedRx = Arc::new(tokio::sync::Mutex::new(archive_rx));
    let upload_rx: SharedRx = Arc::new(tokio::sync::Mutex::new(upload_rx));
    let submit_rx: SharedRx = Arc::new(tokio::sync::Mutex::new(submit_rx));

    // Queue closure falls out of sender ownership: the feeder holds one
    // sender per queue and each stage worker holds one sender for the next
    // queue. A queue therefore closes exactly once, after the feeder is done
    // AND every worker of the stage ahead of it has exited.
    let mut workers = JoinSet::new();
    for _ in 0..ctx.cfg.archive_workers {
        workers.spawn(run_archive_worker(
            ctx.clone(),
            archive_rx.clone(),
            upload_tx.clone(),
        ));
    }
    for _ in 0..ctx.cfg.upload_workers {
        workers.spawn(run_upload_worker(
            ctx.clone(),
            upload_rx.clone(),
            submit_tx.clone(),
        ));
    }
    for _ in 0..ctx.cfg.submit_workers {
        workers.spawn(run_submit_worker(ctx.clone(), submit_rx.clone()));
    }

    let feeder = tokio::spawn(run_feeder(
        ctx.clone(),
        specs,
        archive_tx,
        upload_tx,
        submit_tx,
    ));

    let mut heartbeat = tokio::time::interval(ctx.cfg.progress_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // the immediate first tick

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                reporter.heartbeat();
            }
            res = workers.join_next() => match res {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    reporter.emit(PipelineEvent::Error {
                        message: format!("stage worker task failed: {err}"),
                    });
                }
                None => break,
            },
        }
    }

    if let Err(err) = feeder.await {
        reporter.emit(PipelineEvent::Error {
            message: format!("feeder task failed: {err}"),
        });
    }
    if let Err(err) = resolver.await {
        reporter.emit(PipelineEvent::Error {
            message: format!("catalog resolver task failed: {err}"),
        });
    }

    reporter.heartbeat();
    reporter.emit(PipelineEvent::Stopped);

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(build_run_report(&store, total))
}
