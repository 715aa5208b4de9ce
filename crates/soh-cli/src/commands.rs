use anyhow::{Context, Result, bail};
use soh_c2::{Dispatcher, MinimegaSubstrate, SubstrateSocket};
use soh_check::{HealthCheck, JsonFileStore, SohDirs, StatusReport};
use soh_core::Experiment;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn status_dir_or_default(status_dir: Option<PathBuf>) -> Result<PathBuf> {
    match status_dir {
        Some(dir) => Ok(dir),
        None => Ok(SohDirs::new()
            .context("Failed to initialize directories")?
            .status_dir()),
    }
}

fn health_check(experiment_path: &Path, socket: &str, status_dir: PathBuf) -> Result<HealthCheck> {
    let experiment =
        Experiment::from_file(experiment_path).context("Failed to parse experiment")?;

    let substrate = MinimegaSubstrate::new(SubstrateSocket::parse(socket));
    let dispatcher = Dispatcher::new(Arc::new(substrate));
    let store = JsonFileStore::new(status_dir);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling state of health checks");
            on_signal.cancel();
        }
    });

    Ok(HealthCheck::new(
        experiment,
        Arc::new(dispatcher),
        Arc::new(store),
        cancel,
    ))
}

pub async fn run(
    experiment_path: &Path,
    socket: &str,
    files_dir: PathBuf,
    status_dir: Option<PathBuf>,
    initial: bool,
) -> Result<()> {
    let status_dir = status_dir_or_default(status_dir)?;
    let mut check = health_check(experiment_path, socket, status_dir.clone())?
        .with_files_dir(files_dir);

    let report = check
        .run_checks(initial)
        .await
        .context("State of health run did not complete")?;

    let name = check.experiment().name.clone();
    println!(
        "Status for {} written to {}",
        name,
        JsonFileStore::new(status_dir).path_for(&name).display()
    );

    if let Err(e) = report.ensure_healthy() {
        if check.experiment().soh.exit_on_error {
            error!("{}", e);
            bail!(e);
        }
        warn!("{} (exit_on_error not set)", e);
    }

    Ok(())
}

pub fn status(experiment: &str, status_dir: Option<PathBuf>) -> Result<()> {
    let store = JsonFileStore::new(status_dir_or_default(status_dir)?);

    let Some(report) =
        StatusReport::load(&store, experiment).context("Failed to load stored status")?
    else {
        bail!("No status recorded for experiment '{experiment}'");
    };

    print!("{}", render_status(&report));
    Ok(())
}

pub async fn clear(experiment_path: &Path, socket: &str) -> Result<()> {
    let status_dir = status_dir_or_default(None)?;
    let check = health_check(experiment_path, socket, status_dir)?;

    check
        .cleanup()
        .await
        .context("Failed to clear C2 responses")?;

    info!(
        "Cleared C2 responses for namespace {}",
        check.experiment().namespace
    );
    Ok(())
}

fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();

    for host in report.hosts.values() {
        let mark = if host.errors { "✗" } else { "✓" };
        let _ = writeln!(out, "[{mark}] {}  cpu: {}", host.hostname, host.cpu_load);

        for state in host.all_states().filter(|s| s.is_error()) {
            let _ = writeln!(out, "      {}", state.error);
        }
    }

    if let Some(capture) = &report.packet_capture {
        let _ = writeln!(out, "flows observed between {} addresses", capture.hosts.len());
    }

    out
}
