use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::broadcast;

use crate::api::{LogLevel, PipelineCallbacks, PipelineEvent, RunReport, StageKind, StateChange};
use crate::state::{JobState, StateStore};

#[derive(Debug, Default)]
pub(crate) struct StageGauges {
    archive_active: AtomicUsize,
    upload_active: AtomicUsize,
    submit_active: AtomicUsize,
    completed: AtomicU64,
    total: AtomicU64,
}

impl StageGauges {
    fn gauge(&self, stage: StageKind) -> &AtomicUsize {
        match stage {
            StageKind::Archive => &self.archive_active,
            StageKind::Upload => &self.upload_active,
            StageKind::Submit => &self.submit_active,
        }
    }

    pub(crate) fn enter(&self, stage: StageKind) {
        self.gauge(stage).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave(&self, stage: StageKind) {
        self.gauge(stage).fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }
}

/// Fans every observation out to the broadcast stream, the optional callback
/// trio, and the engine's internal tracing. Workers only talk to this.
pub(crate) struct Reporter {
    event_tx: broadcast::Sender<PipelineEvent>,
    callbacks: PipelineCallbacks,
    pub(crate) gauges: StageGauges,
}

impl Reporter {
    pub(crate) fn new(
        event_tx: broadcast::Sender<PipelineEvent>,
        callbacks: PipelineCallbacks,
    ) -> Self {
        Self {
            event_tx,
            callbacks,
            gauges: StageGauges::default(),
        }
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: &str, stage: StageKind, job_name: &str) {
        match level {
            LogLevel::Info => {
                tracing::info!(stage = stage.as_str(), job = job_name, "{message}");
            }
            LogLevel::Warning => {
                tracing::warn!(stage = stage.as_str(), job = job_name, "{message}");
                self.emit(PipelineEvent::Warning {
                    message: message.to_string(),
                });
            }
            LogLevel::Error => {
                tracing::error!(stage = stage.as_str(), job = job_name, "{message}");
                self.emit(PipelineEvent::Error {
                    message: message.to_string(),
                });
            }
        }
        if let Some(cb) = &self.callbacks.log {
            cb(level, message, stage, job_name);
        }
    }

    /// Publish one status transition (or an upload progress tick, in which
    /// case the persisted status is untouched).
    pub(crate) fn state_changed(
        &self,
        row: &JobState,
        stage: StageKind,
        upload_progress: Option<f64>,
    ) {
        let change = StateChange {
            job_name: row.job_name.clone(),
            stage,
            status: row.stage_status(stage),
            job_id: row.job_id.clone(),
            error: row.error_message.clone(),
            upload_progress,
        };
        tracing::debug!(
            stage = stage.as_str(),
            job = change.job_name,
            status = ?change.status,
            "state change"
        );
        if let Some(cb) = &self.callbacks.state_change {
            cb(&change);
        }
        self.emit(PipelineEvent::StateChanged { change });
    }

    /// Record a terminal transition and notify the progress callback.
    pub(crate) fn job_finished(&self, stage: StageKind, job_name: &str) {
        let completed = self.gauges.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.gauges.total.load(Ordering::Relaxed);
        if let Some(cb) = &self.callbacks.progress {
            cb(completed, total, stage, job_name);
        }
    }

    pub(crate) fn heartbeat(&self) {
        let active_archive = self.gauges.archive_active.load(Ordering::Relaxed);
        let active_upload = self.gauges.upload_active.load(Ordering::Relaxed);
        let active_submit = self.gauges.submit_active.load(Ordering::Relaxed);
        let completed = self.gauges.completed.load(Ordering::Relaxed);
        let total = self.gauges.total.load(Ordering::Relaxed);
        tracing::info!(
            active_archive,
            active_upload,
            active_submit,
            completed,
            total,
            "pipeline heartbeat"
        );
        self.emit(PipelineEvent::Heartbeat {
            active_archive,
            active_upload,
            active_submit,
            completed,
            total,
        });
    }
}

pub(crate) fn build_run_report(store: &StateStore, total: u64) -> RunReport {
    let jobs = store.all();
    let completed = jobs.iter().filter(|j| j.is_complete()).count() as u64;
    let failed = jobs.iter().filter(|j| j.is_failed()).count() as u64;
    RunReport {
        jobs,
        completed,
        failed,
        total,
    }
}
