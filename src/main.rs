mod calibration;
mod capture;
mod config;
mod correlate;
mod hardware;
mod sensors;
mod session;
mod telemetry;
mod timemap;

use anyhow::{Context, Result};
use capture::CaptureController;
use clap::{Parser, Subcommand};
use config::AppConfig;
use correlate::{export_csv, Correlator, ExportMode};
use hardware::{MockCamera, MockReadyLine, MockSensorEndpoint, SyncRole};
use sensors::SensorRecorder;
use session::Session;
use std::path::PathBuf;
use telemetry::TelemetryLog;
use timemap::TimeMap;

#[derive(Parser)]
#[command(name = "dronecap", about = "Synchronized multi-camera capture and flight-data fusion")]
struct Cli {
    /// Configuration file; the built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one camera's capture loop until interrupted.
    Capture {
        /// Camera position on the rig (0-based).
        #[arg(long, default_value_t = 0)]
        ordinal: u8,
        /// Act as the rig's sync server and drive the ready line.
        #[arg(long)]
        server: bool,
    },
    /// Record the auxiliary sensor stream until interrupted.
    Sensors,
    /// Fuse a capture session with a flight log and write the tagging CSV.
    Correlate {
        /// Capture session directory.
        #[arg(long)]
        session: PathBuf,
        /// Vehicle telemetry log file.
        #[arg(long)]
        log: PathBuf,
        /// Clock anchor pairs, CSV of `capture_time,vehicle_time` rows.
        #[arg(long)]
        anchors: PathBuf,
        /// Output CSV path (default: exiftool.csv inside the session).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Emit for the raw-converter pipeline (rotation applied there,
        /// so no Orientation column).
        #[arg(long)]
        raw_convert: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };

    match cli.command {
        Command::Capture { ordinal, server } => run_capture(cfg, ordinal, server).await,
        Command::Sensors => run_sensors(cfg).await,
        Command::Correlate { session, log, anchors, out, raw_convert } => {
            run_correlate(cfg, session, log, anchors, out, raw_convert)
        }
    }
}

async fn run_capture(cfg: AppConfig, ordinal: u8, server: bool) -> Result<()> {
    let role = if server { SyncRole::Server } else { SyncRole::Client };
    // No vendor camera stack is attached in this build; the synthetic
    // source stands in behind the same seam the real one plugs into.
    tracing::info!("no camera backend attached, using synthetic frames");
    let source = MockCamera::new(cfg.capture.frame_rate);
    let line = server.then(MockReadyLine::new);

    let mut controller = CaptureController::new(ordinal, role, cfg.capture);
    let snapshot = controller.run(source, line, ctrl_c()).await?;
    tracing::info!(
        "capture finished: {} written, {} discarded, {} drops flagged",
        snapshot.frames_written,
        snapshot.frames_discarded,
        snapshot.drops_flagged
    );
    Ok(())
}

async fn run_sensors(cfg: AppConfig) -> Result<()> {
    tracing::info!("no sensor device attached, using synthetic stream");
    let endpoint = MockSensorEndpoint::with_pattern(4096, cfg.sensors.buffer_size);
    let line = MockReadyLine::new();

    let start = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock before the epoch")?
        .as_secs_f64();

    let recorder = SensorRecorder::new(cfg.sensors);
    let summary = recorder.run(endpoint, Some(line), start, ctrl_c()).await?;
    tracing::info!(
        "sensor recording finished: {} bytes in {} transfers ({} dropped)",
        summary.bytes_written,
        summary.transfers_completed,
        summary.transfers_dropped
    );
    Ok(())
}

fn run_correlate(
    cfg: AppConfig,
    session_dir: PathBuf,
    log_path: PathBuf,
    anchors: PathBuf,
    out: Option<PathBuf>,
    raw_convert: bool,
) -> Result<()> {
    let session = Session::open(&session_dir, &cfg.correlate.raw_ext)?;
    let log = TelemetryLog::open(&log_path)?;
    let time_map = TimeMap::from_csv(&anchors)?;

    let correlator = Correlator::new(&cfg.correlate, &time_map, &log);
    let (records, _summary) = correlator.run(&session)?;

    let out_path = out.unwrap_or_else(|| session_dir.join("exiftool.csv"));
    let mode = if raw_convert { ExportMode::RawConvert } else { ExportMode::DirectTag };
    export_csv(&records, &cfg.correlate, &out_path, mode)
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
