mod commands;

use clap::{Parser, Subcommand};
use soh_check::SohDirs;
use std::path::PathBuf;
use tracing_appender::{non_blocking::WorkerGuard, rolling};

const DEFAULT_SOCKET: &str = "/tmp/minimega/minimega";

#[derive(Parser)]
#[command(name = "soh")]
#[command(about = "State-of-health checks for minimega experiments")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every health check phase against an experiment
    Run {
        /// Path to the experiment HCL file
        experiment: PathBuf,
        /// minimega control socket (path, or host:port)
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
        /// Directory served to guests by `cc send`
        #[arg(long, default_value = soh_check::DEFAULT_FILES_DIR)]
        files_dir: PathBuf,
        /// Where status files are written (defaults to the soh state directory)
        #[arg(long)]
        status_dir: Option<PathBuf>,
        /// First run after experiment start; traffic flows are not collected
        #[arg(long)]
        initial: bool,
    },
    /// Show the stored status of an experiment
    Status {
        /// Name of the experiment
        experiment: String,
        /// Where status files are read from (defaults to the soh state directory)
        #[arg(long)]
        status_dir: Option<PathBuf>,
    },
    /// Delete every C2 response stored for an experiment
    Clear {
        /// Path to the experiment HCL file
        experiment: PathBuf,
        /// minimega control socket (path, or host:port)
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            experiment,
            socket,
            files_dir,
            status_dir,
            initial,
        } => {
            commands::run(&experiment, &socket, files_dir, status_dir, initial).await?;
        }
        Commands::Status {
            experiment,
            status_dir,
        } => {
            commands::status(&experiment, status_dir)?;
        }
        Commands::Clear { experiment, socket } => {
            commands::clear(&experiment, &socket).await?;
        }
    }

    Ok(())
}

fn init_logging() -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if let Ok(dirs) = SohDirs::new()
        && std::fs::create_dir_all(dirs.logs_dir()).is_ok()
    {
        let log_dir = dirs.logs_dir();
        if std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("soh.log"))
            .is_ok()
        {
            let file_appender = rolling::never(&log_dir, "soh.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();
            return Some(guard);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["soh", "run", "demo.hcl"]);
        let Commands::Run {
            experiment,
            socket,
            files_dir,
            status_dir,
            initial,
        } = cli.command
        else {
            panic!("expected run");
        };

        assert_eq!(experiment, PathBuf::from("demo.hcl"));
        assert_eq!(socket, DEFAULT_SOCKET);
        assert_eq!(files_dir, PathBuf::from("/phenix/images"));
        assert!(status_dir.is_none());
        assert!(!initial);
    }

    #[test]
    fn test_status_with_dir() {
        let cli = Cli::parse_from(["soh", "status", "demo", "--status-dir", "/tmp/soh"]);
        assert!(matches!(
            cli.command,
            Commands::Status { ref experiment, status_dir: Some(_) } if experiment == "demo"
        ));
    }
}
