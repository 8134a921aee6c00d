//! `standby-daemon`: runs one long-term standby test until stopped.
//!
//! Exit codes: 0 after a clean shutdown, 2 if a controller failed fatally,
//! 1 if the daemon could not start.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use standby_daq::alert::LogAlertSink;
use standby_daq::instrument::mock::{MockChamber, MockPowerSupply};
use standby_daq::instrument::PowerSupply;
use standby_daq::logs::{export_measurements_csv, DATA_LOG_FILE};
use standby_daq::plan::FileControlSource;
use standby_daq::{ExitStatus, Instruments, Settings, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "standby-daemon", version, about = "Biased standby test supervisor")]
struct Args {
    /// Settings file (TOML); `STANDBY_` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding plan.toml
    #[arg(long)]
    control_dir: Option<PathBuf>,

    /// Directory for the event and data logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Run against simulated instruments
    #[arg(long)]
    simulate: bool,

    /// Export the data log to this CSV file and exit
    #[arg(long, value_name = "FILE")]
    export_csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("standby_daq=info,standby_daemon=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(Args::parse()).await {
        Ok(status) => ExitCode::from(status.code() as u8),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitStatus> {
    let mut settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    if let Some(dir) = args.control_dir {
        settings.daemon.control_dir = dir;
    }
    if let Some(dir) = args.log_dir {
        settings.daemon.log_dir = dir;
    }

    if let Some(out) = args.export_csv {
        let rows = export_measurements_csv(&settings.daemon.log_dir.join(DATA_LOG_FILE), &out)?;
        info!(rows, out = %out.display(), "Export finished");
        return Ok(ExitStatus::Clean);
    }

    if !args.simulate {
        bail!(
            "no instrument drivers are built into this binary; \
             use --simulate or embed the library with your adapters"
        );
    }
    let instruments = simulated_instruments(&settings);

    let source = Arc::new(FileControlSource::new(&settings.daemon.control_dir));
    info!(
        control = %settings.daemon.control_dir.display(),
        logs = %settings.daemon.log_dir.display(),
        channels = settings.channels.len(),
        "Starting standby daemon"
    );
    let mut handle = Supervisor::new(settings, instruments, Arc::new(LogAlertSink))
        .start(source)
        .await
        .context("starting supervisor")?;

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let finished = tokio::select! {
        status = handle.wait() => Some(status),
        _ = &mut signal => None,
    };
    let status = match finished {
        Some(status) => status,
        None => {
            info!("Shutdown signal received");
            handle.shutdown();
            handle.wait().await
        }
    };
    info!(?status, "Standby daemon stopped");
    Ok(status)
}

fn simulated_instruments(settings: &Settings) -> Instruments {
    let mut supplies: HashMap<String, Arc<dyn PowerSupply>> = HashMap::new();
    for channel in &settings.channels {
        supplies
            .entry(channel.supply.clone())
            .or_insert_with(|| Arc::new(MockPowerSupply::new()));
    }
    Instruments {
        chamber: Arc::new(MockChamber::new(settings.chamber.ambient_celsius)),
        supplies,
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(?err, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
