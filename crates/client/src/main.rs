mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use clap::Parser;

use skylift_core::profile::{ClientProfile, read_profile};
use skylift_core::spec::load_jobs_file;
use skylift_engine::{
    PipelineError, PipelineEvent, ProxyMode, RestClient, RunReport, StageStatus, start_pipeline,
};

use crate::cli::Cli;

#[derive(Debug, Clone, Copy)]
enum ShutdownEvent {
    Graceful,
    Immediate,
}

fn spawn_ctrl_c_handler(tx: tokio::sync::mpsc::UnboundedSender<ShutdownEvent>) {
    let presses = Arc::new(AtomicU8::new(0));
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = presses.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                let _ = tx.send(ShutdownEvent::Graceful);
            } else {
                let _ = tx.send(ShutdownEvent::Immediate);
                return;
            }
        }
    });
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::InProgress => "in progress",
        StageStatus::Success => "success",
        StageStatus::Failed => "failed",
        StageStatus::Skipped => "skipped",
    }
}

fn print_event(evt: &PipelineEvent) {
    match evt {
        PipelineEvent::StateChanged { change } => {
            // Upload progress ticks are too chatty for line output.
            if change.upload_progress.is_some() {
                return;
            }
            match change.status {
                StageStatus::Success | StageStatus::Skipped => {
                    println!(
                        "[{}] {}: {}",
                        change.stage,
                        change.job_name,
                        status_label(change.status)
                    );
                }
                StageStatus::Failed => {
                    let reason = change.error.as_deref().unwrap_or("unknown error");
                    eprintln!("[{}] {}: failed: {reason}", change.stage, change.job_name);
                }
                StageStatus::Pending | StageStatus::InProgress => {}
            }
        }
        PipelineEvent::Heartbeat {
            active_archive,
            active_upload,
            active_submit,
            completed,
            total,
        } => {
            println!(
                "progress: {completed}/{total} done (active: archive {active_archive}, upload {active_upload}, submit {active_submit})"
            );
        }
        PipelineEvent::Warning { message } => eprintln!("warning: {message}"),
        PipelineEvent::Error { message } => eprintln!("error: {message}"),
        PipelineEvent::Started
        | PipelineEvent::CancelRequested
        | PipelineEvent::Stopped => {}
    }
}

fn print_summary(report: &RunReport) {
    println!(
        "batch finished: {} of {} job(s) completed, {} failed",
        report.completed, report.total, report.failed
    );
    for job in &report.jobs {
        if job.is_failed() {
            let reason = job.error_message.as_deref().unwrap_or("unknown error");
            eprintln!("  {}: {reason}", job.job_name);
        } else if let Some(job_id) = &job.job_id {
            println!("  {}: job {job_id}", job.job_name);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let file_layer = match read_profile() {
        Ok(profile) => profile,
        Err(err) => {
            eprintln!("warning: ignoring client profile: {err:#}");
            ClientProfile::default()
        }
    };
    let overrides = ClientProfile {
        api_base_url: cli.api_base_url.clone(),
        api_token: cli.api_token.clone(),
        proxy_mode: None,
    };
    let profile = file_layer.overlay(overrides).tidied();
    if cli.save_profile {
        if let Err(err) = skylift_core::profile::write_profile(&profile) {
            eprintln!("warning: failed to save profile: {err:#}");
        }
    }

    let specs = load_jobs_file(&cli.jobs_file)?;
    println!(
        "skylift {}: {} job(s) from {}",
        env!("CARGO_PKG_VERSION"),
        specs.len(),
        cli.jobs_file.display()
    );

    let client = Arc::new(RestClient::new(&profile)?);
    let mut cfg = cli.pipeline_config();
    if cfg.proxy_mode == ProxyMode::Off {
        // The saved profile supplies the proxy mode unless the CLI overrides.
        cfg.proxy_mode = match profile.proxy_mode.as_deref() {
            Some("basic") => ProxyMode::Basic,
            Some("ntlm") => ProxyMode::Ntlm,
            _ => ProxyMode::Off,
        };
    }

    let handle = start_pipeline(cfg, client, specs, None);
    let mut events = handle.subscribe();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown_tx);

    let mut immediate_exit = false;
    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!(
                            "Stop requested — finishing in-flight work before exiting (press CTRL+C again to exit immediately)."
                        );
                        handle.cancel();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again — exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if matches!(evt, PipelineEvent::Stopped) {
                    break;
                }
                print_event(&evt);
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    match handle.wait().await {
        Ok(report) => {
            print_summary(&report);
            if !report.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(PipelineError::Cancelled) => {
            eprintln!("Run cancelled; batch state saved for resume.");
            std::process::exit(130);
        }
        Err(err) => Err(err.into()),
    }
}
