//! End-to-end pipeline tests against a recording platform double.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skylift_engine::{
    Analysis, AnalysisVersion, CreatedJob, JobRequest, JobSpec, PipelineConfig, PipelineError,
    PipelineEvent, PlatformClient, ProxyMode, StageStatus, StateStore, UploadParams, UploadedFile,
    start_pipeline,
};

#[derive(Default)]
struct Recorder {
    analyses: Vec<Analysis>,
    uploads: Mutex<Vec<PathBuf>>,
    upload_attempts: AtomicU32,
    upload_failures: Mutex<VecDeque<String>>,
    upload_delay: Option<Duration>,
    creates: Mutex<Vec<JobRequest>>,
    submits: Mutex<Vec<String>>,
    assigns: Mutex<Vec<(String, String, String)>>,
    warmups: AtomicU32,
    next_file: AtomicU32,
    next_job: AtomicU32,
}

impl Recorder {
    fn with_openfoam_catalog() -> Self {
        Self {
            analyses: vec![Analysis {
                code: "openfoam".to_string(),
                versions: vec![AnalysisVersion {
                    display_name: "v2012".to_string(),
                    version_code: "abc123".to_string(),
                }],
            }],
            ..Self::default()
        }
    }

    fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn create_count(&self) -> usize {
        self.creates.lock().unwrap().len()
    }

    fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl PlatformClient for Recorder {
    async fn get_analyses(&self) -> anyhow::Result<Vec<Analysis>> {
        Ok(self.analyses.clone())
    }

    async fn upload_file(&self, params: UploadParams) -> anyhow::Result<UploadedFile> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.upload_failures.lock().unwrap().pop_front() {
            anyhow::bail!("{message}");
        }
        self.uploads.lock().unwrap().push(params.local_path);
        let n = self.next_file.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(UploadedFile {
            file_id: format!("F{n}"),
        })
    }

    async fn create_job(&self, request: &JobRequest) -> anyhow::Result<CreatedJob> {
        self.creates.lock().unwrap().push(request.clone());
        let n = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedJob {
            job_id: format!("J{n}"),
        })
    }

    async fn assign_project_to_job(
        &self,
        org_code: &str,
        job_id: &str,
        project_id: &str,
    ) -> anyhow::Result<()> {
        self.assigns.lock().unwrap().push((
            org_code.to_string(),
            job_id.to_string(),
            project_id.to_string(),
        ));
        Ok(())
    }

    async fn submit_job(&self, job_id: &str) -> anyhow::Result<()> {
        self.submits.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    async fn warmup_proxy(&self) -> anyhow::Result<()> {
        self.warmups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn make_run_dir(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("input.dat"), b"payload").unwrap();
    dir
}

fn spec(dir: &Path, name: &str) -> JobSpec {
    JobSpec {
        directory: dir.to_path_buf(),
        name: name.to_string(),
        analysis_code: "openfoam".to_string(),
        analysis_version: "v2012".to_string(),
        command: "./Allrun".to_string(),
        core_type: "standard".to_string(),
        cores_per_slot: 2,
        slots: 1,
        walltime_hours: 1.0,
        license_settings: None,
        submit_mode: "submit".to_string(),
        project_id: None,
        org_code: None,
        extra_file_ids: Vec::new(),
        tags: Vec::new(),
        tar_subpath: None,
        no_decompress: false,
        automation_ids: Vec::new(),
    }
}

fn fast_config(state_file: PathBuf) -> PipelineConfig {
    let mut cfg = PipelineConfig::new(state_file);
    cfg.retry_sleep = Duration::from_millis(1);
    cfg.assign_retry_base = Duration::from_millis(1);
    cfg.progress_interval = Duration::from_secs(3600);
    cfg
}

#[tokio::test]
async fn two_jobs_traverse_all_three_stages() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let run2 = make_run_dir(root.path(), "Run_2");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let handle = start_pipeline(
        fast_config(state_file.clone()),
        client.clone(),
        vec![spec(&run1, "run-1"), spec(&run2, "run-2")],
        None,
    );
    let report = handle.wait().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.total, 2);
    assert_eq!(report.completed, 2);
    for job in &report.jobs {
        assert_eq!(job.tar_status, StageStatus::Success);
        assert_eq!(job.upload_status, StageStatus::Success);
        assert_eq!(job.create_status, StageStatus::Success);
        assert_eq!(job.submit_status, StageStatus::Success);
        assert!(job.file_id.is_some());
        assert!(job.job_id.is_some());
        assert_eq!(job.error_message, None);
        // Archives land in the batch's common parent.
        assert!(job.tar_path.as_ref().unwrap().starts_with(root.path()));
        assert!(job.tar_path.as_ref().unwrap().exists());
    }

    assert_eq!(client.upload_count(), 2);
    assert_eq!(client.create_count(), 2);
    assert_eq!(client.submit_count(), 2);

    // Display names resolve to the opaque catalog code.
    for request in client.creates.lock().unwrap().iter() {
        assert_eq!(request.analysis_version, "abc123");
        assert_eq!(request.walltime_seconds, 3600);
        assert_eq!(request.input_files.len(), 1);
    }

    // The durable state survives and parses.
    let store = StateStore::load(&state_file).unwrap();
    assert_eq!(store.all().len(), 2);
}

#[tokio::test]
async fn resumption_only_submits_the_partially_done_job() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let run2 = make_run_dir(root.path(), "Run_2");
    let state_file = root.path().join("state.json");

    // A previous run archived, uploaded, and created job 1 but was killed
    // before submitting it.
    let tar1 = root.path().join("prior_Run_1.tar.gz");
    std::fs::write(&tar1, b"archive-bytes").unwrap();
    {
        let store = StateStore::load(&state_file).unwrap();
        let mut row = store.initialize(1, "run-1", &run1);
        row.tar_status = StageStatus::Success;
        row.tar_path = Some(tar1);
        row.upload_status = StageStatus::Success;
        row.file_id = Some("F9".to_string());
        row.create_status = StageStatus::Success;
        row.job_id = Some("J9".to_string());
        store.update(row).await;
    }

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let handle = start_pipeline(
        fast_config(state_file.clone()),
        client.clone(),
        vec![spec(&run1, "run-1"), spec(&run2, "run-2")],
        None,
    );
    let report = handle.wait().await.unwrap();

    assert!(report.is_success());
    // Job 1: exactly one submit call with the existing job id, no new
    // upload or create. Job 2 traverses all three stages.
    assert_eq!(client.upload_count(), 1);
    assert_eq!(client.create_count(), 1);
    let submits = client.submits.lock().unwrap().clone();
    assert_eq!(submits.len(), 2);
    assert!(submits.contains(&"J9".to_string()));
}

#[tokio::test]
async fn rerunning_a_finished_batch_makes_no_api_calls() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");

    let first = Arc::new(Recorder::with_openfoam_catalog());
    let handle = start_pipeline(
        fast_config(state_file.clone()),
        first.clone(),
        vec![spec(&run1, "run-1")],
        None,
    );
    assert!(handle.wait().await.unwrap().is_success());

    let second = Arc::new(Recorder::with_openfoam_catalog());
    let handle = start_pipeline(
        fast_config(state_file.clone()),
        second.clone(),
        vec![spec(&run1, "run-1")],
        None,
    );
    let report = handle.wait().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed, 1);
    assert_eq!(second.upload_count(), 0);
    assert_eq!(second.create_count(), 0);
    assert_eq!(second.submit_count(), 0);
}

#[tokio::test]
async fn transient_upload_failures_retry_with_proxy_warmup() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder {
        upload_failures: Mutex::new(VecDeque::from([
            "java.net.SocketTimeoutException: Read timed out".to_string(),
            "java.net.SocketTimeoutException: Read timed out".to_string(),
        ])),
        ..Recorder::with_openfoam_catalog()
    });

    let mut cfg = fast_config(state_file);
    cfg.proxy_mode = ProxyMode::Basic;
    cfg.max_retries = 3;

    let handle = start_pipeline(cfg, client.clone(), vec![spec(&run1, "run-1")], None);
    let report = handle.wait().await.unwrap();

    assert!(report.is_success());
    assert_eq!(client.upload_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.warmups.load(Ordering::SeqCst), 3);
    assert_eq!(report.jobs[0].upload_status, StageStatus::Success);
}

#[tokio::test]
async fn permanent_upload_failures_do_not_retry() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder {
        upload_failures: Mutex::new(VecDeque::from(["403 Forbidden".to_string()])),
        ..Recorder::with_openfoam_catalog()
    });

    let mut cfg = fast_config(state_file);
    cfg.max_retries = 3;

    let handle = start_pipeline(cfg, client.clone(), vec![spec(&run1, "run-1")], None);
    let report = handle.wait().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(client.upload_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(report.jobs[0].upload_status, StageStatus::Failed);
    assert_eq!(report.jobs[0].submit_status, StageStatus::Failed);
    assert_eq!(client.create_count(), 0);
}

#[tokio::test]
async fn flatten_duplicate_fails_one_job_and_the_batch_continues() {
    let root = tempfile::tempdir().unwrap();
    let run1 = root.path().join("Run_1");
    std::fs::create_dir_all(run1.join("a")).unwrap();
    std::fs::create_dir_all(run1.join("b")).unwrap();
    std::fs::write(run1.join("a/x.dat"), b"a").unwrap();
    std::fs::write(run1.join("b/x.dat"), b"b").unwrap();
    let run2 = make_run_dir(root.path(), "Run_2");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let mut cfg = fast_config(state_file);
    cfg.flatten = true;

    let handle = start_pipeline(
        cfg,
        client.clone(),
        vec![spec(&run1, "run-1"), spec(&run2, "run-2")],
        None,
    );
    let report = handle.wait().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 1);
    let failed = report.jobs.iter().find(|j| j.job_name == "run-1").unwrap();
    assert_eq!(failed.tar_status, StageStatus::Failed);
    assert!(
        failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("duplicate filename")
    );
    // The healthy job still went all the way through.
    assert_eq!(client.submit_count(), 1);
}

#[tokio::test]
async fn skip_tar_upload_jumps_straight_to_submission() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let mut cfg = fast_config(state_file);
    cfg.skip_tar_upload = true;
    cfg.extra_input_files = Some("id:SHARED1".to_string());

    let handle = start_pipeline(cfg, client.clone(), vec![spec(&run1, "run-1")], None);
    let report = handle.wait().await.unwrap();

    assert!(report.is_success());
    let job = &report.jobs[0];
    assert_eq!(job.tar_status, StageStatus::Skipped);
    assert_eq!(job.upload_status, StageStatus::Skipped);
    assert_eq!(job.create_status, StageStatus::Success);
    assert_eq!(job.submit_status, StageStatus::Success);

    assert_eq!(client.upload_count(), 0);
    let creates = client.creates.lock().unwrap();
    let ids: Vec<_> = creates[0]
        .input_files
        .iter()
        .map(|f| f.file_id.as_str())
        .collect();
    assert_eq!(ids, vec!["SHARED1"]);
}

#[tokio::test]
async fn shared_inputs_resolve_before_jobs_and_attach_to_every_request() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let mesh = root.path().join("mesh.msh");
    std::fs::write(&mesh, b"mesh-bytes").unwrap();
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let mut cfg = fast_config(state_file);
    cfg.extra_input_files = Some(format!("id:SHARED1,{}", mesh.display()));

    let handle = start_pipeline(cfg, client.clone(), vec![spec(&run1, "run-1")], None);
    let report = handle.wait().await.unwrap();

    assert!(report.is_success());
    // One shared upload plus the job archive.
    assert_eq!(client.upload_count(), 2);
    let creates = client.creates.lock().unwrap();
    let ids: Vec<_> = creates[0]
        .input_files
        .iter()
        .map(|f| f.file_id.as_str())
        .collect();
    // Own archive first (F2: the shared mesh took F1), then shared inputs.
    assert_eq!(ids, vec!["F2", "SHARED1", "F1"]);
}

#[tokio::test]
async fn create_only_jobs_skip_the_submit_call() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let mut job = spec(&run1, "run-1");
    job.submit_mode = "create_only".to_string();
    job.project_id = Some("proj-7".to_string());
    job.org_code = Some("acme".to_string());

    let handle = start_pipeline(fast_config(state_file), client.clone(), vec![job], None);
    let report = handle.wait().await.unwrap();

    assert!(report.is_success());
    let row = &report.jobs[0];
    assert_eq!(row.create_status, StageStatus::Success);
    assert_eq!(row.submit_status, StageStatus::Skipped);
    assert_eq!(client.submit_count(), 0);

    let assigns = client.assigns.lock().unwrap();
    assert_eq!(assigns.len(), 1);
    assert_eq!(assigns[0].0, "acme");
    assert_eq!(assigns[0].2, "proj-7");
}

#[tokio::test]
async fn cancellation_mid_upload_leaves_a_resumable_state() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder {
        upload_delay: Some(Duration::from_secs(30)),
        ..Recorder::with_openfoam_catalog()
    });

    let handle = start_pipeline(
        fast_config(state_file.clone()),
        client.clone(),
        vec![spec(&run1, "run-1")],
        None,
    );
    let mut events = handle.subscribe();

    // Cancel once the upload stage has the item in flight.
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::StateChanged { change })
                    if change.stage == skylift_engine::StageKind::Upload
                        && change.status == StageStatus::InProgress =>
                {
                    break;
                }
                Ok(_) => {}
                Err(_) => panic!("event stream closed before upload started"),
            }
        }
    })
    .await;
    assert!(waited.is_ok());
    handle.cancel();

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));

    // Archive success survived; the interrupted upload stays in progress and
    // nothing downstream fired.
    let store = StateStore::load(&state_file).unwrap();
    let row = store.get(1).unwrap();
    assert_eq!(row.tar_status, StageStatus::Success);
    assert_eq!(row.upload_status, StageStatus::InProgress);
    assert_eq!(client.create_count(), 0);
    assert_eq!(client.submit_count(), 0);
}

#[tokio::test]
async fn unparseable_state_file_fails_the_run_before_any_work() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");
    std::fs::write(&state_file, "{broken").unwrap();

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let handle = start_pipeline(
        fast_config(state_file),
        client.clone(),
        vec![spec(&run1, "run-1")],
        None,
    );
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, PipelineError::StateLoad(_)));
    assert_eq!(client.upload_count(), 0);
    assert_eq!(client.create_count(), 0);
}

#[tokio::test]
async fn missing_shared_input_path_aborts_before_per_job_work() {
    let root = tempfile::tempdir().unwrap();
    let run1 = make_run_dir(root.path(), "Run_1");
    let state_file = root.path().join("state.json");

    let client = Arc::new(Recorder::with_openfoam_catalog());
    let mut cfg = fast_config(state_file);
    cfg.extra_input_files = Some("/nonexistent/shared.dat".to_string());

    let handle = start_pipeline(cfg, client.clone(), vec![spec(&run1, "run-1")], None);
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, PipelineError::SharedInput(_)));
    assert_eq!(client.upload_count(), 0);
    assert_eq!(client.create_count(), 0);
}
