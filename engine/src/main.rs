//! `qseriesd` — a thin CLI shell over the instrument control and recording
//! engine (SPEC_FULL.md §6). It contains no protocol logic of its own: it
//! only wires `Config` → `InstrumentController` → `ChunkedRecorder`. The
//! HTTP/WebSocket façade a real deployment puts in front of this is out of
//! scope (spec.md §1); this binary exists so the engine can be exercised
//! and demoed without it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use qseriesd::config::Config;
use qseriesd::controller::InstrumentController;
use qseriesd::reading::{Mode, SensorConfig};
use qseriesd::recorder::{ChunkedRecorder, RecorderOptions};
use qseriesd::transport::{SimulatorOpener, SimulatorScript, TransportOpener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "qseriesd")]
#[command(about = "Instrument control and recording engine for Q-Series serial sensors")]
struct Args {
    /// Path to the TOML config file. Overridden by QSERIESD_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a real serial instrument, configure it from `Config`,
    /// start acquisition and recording, and run until Ctrl+C.
    Run,
    /// Same pipeline, but against an in-process simulated device — no
    /// hardware required. Useful for local testing and demos.
    Sim {
        /// Stop automatically after this many seconds (0 = run until Ctrl+C).
        #[arg(long, default_value_t = 0)]
        duration_secs: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    match args.command {
        Command::Run => run_real(config),
        Command::Sim { duration_secs } => run_simulated(config, duration_secs),
    }
}

/// Installs a Ctrl+C handler and runs the connect → configure → start →
/// record → wait-for-shutdown → stop → disconnect pipeline shared by both
/// subcommands. Shutdown order follows spec.md §3: recorder first, then
/// acquisition, then transport.
fn drive_session(
    controller: &InstrumentController,
    opener: Arc<dyn TransportOpener>,
    port: &str,
    baud: u32,
    config: &Config,
    run_for: Option<Duration>,
) -> Result<()> {
    info!("connecting to {port} at {baud} baud");
    controller
        .connect(opener, port, baud)
        .context("connect() failed")?;

    let cfg = configure_from(controller, config)?;
    info!(
        "configured instrument: averaging={} adc_rate_hz={} mode={}",
        cfg.averaging,
        cfg.adc_rate_hz,
        cfg.mode.as_str()
    );

    controller.start(1.0).context("start() failed")?;
    info!("acquisition started in {:?} mode", cfg.mode);

    let mission = config
        .recorder
        .mission
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let mut recorder = ChunkedRecorder::start(
        controller.ring_buffer(),
        controller.state().is_acquiring(),
        &config.recorder.output_dir,
        uuid::Uuid::new_v4().to_string(),
        RecorderOptions {
            mission,
            rate_hz: cfg.adc_rate_hz as f64 / cfg.averaging as f64,
            schema_version: config.recorder.schema_version,
            roll_interval_s: config.recorder.roll_interval_s,
        },
        Duration::from_millis(config.instrument.poll_interval_ms),
    )
    .context("recorder start() failed")?;
    info!("recording to {}", recorder.chunk_dir().display());

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install Ctrl+C handler")?;
    }

    let deadline = run_for.map(|d| std::time::Instant::now() + d);
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(deadline) = deadline {
            if std::time::Instant::now() >= deadline {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("stopping: recorder, then acquisition, then transport");
    let session = recorder.stop();
    info!(
        "recorder stopped: {} chunks, session {}",
        session.chunks.len(),
        session.session_id
    );

    controller.stop().context("controller stop() failed")?;
    controller.disconnect();
    info!("disconnected");

    Ok(())
}

/// Applies a fixed, conservative default profile (freerun, 125 averaging
/// samples at 125 Hz). A real deployment would thread these through
/// `Config` the same way `instrument.port`/`baud` already are; this binary
/// is a demonstration shell, not the engine's configuration surface.
fn configure_from(controller: &InstrumentController, _config: &Config) -> Result<SensorConfig> {
    controller.set_averaging(125).context("set_averaging failed")?;
    controller.set_adc_rate(125).context("set_adc_rate failed")?;
    let cfg = controller
        .set_mode(Mode::Freerun, None)
        .context("set_mode failed")?;
    Ok(cfg)
}

fn run_real(config: Config) -> Result<()> {
    let controller = InstrumentController::new(config.instrument.ring_buffer_capacity, "unknown");
    let opener: Arc<dyn TransportOpener> = Arc::new(qseriesd::transport::SerialTransportOpener);
    drive_session(
        &controller,
        opener,
        &config.instrument.port,
        config.instrument.baud,
        &config,
        None,
    )
}

fn run_simulated(config: Config, duration_secs: u64) -> Result<()> {
    let script = SimulatorScript::new(SensorConfig {
        averaging: 125,
        adc_rate_hz: 125,
        mode: Mode::Freerun,
        tag: None,
        include_temp: true,
        include_vin: true,
        sensor_id: "SIM1".into(),
        firmware_version: "2150 REV 4.003".into(),
        preamble: "sim".into(),
        calfactor: 1.0,
    });
    let controller = InstrumentController::new(config.instrument.ring_buffer_capacity, "SIM1");
    let opener: Arc<dyn TransportOpener> = Arc::new(SimulatorOpener { script });

    let run_for = if duration_secs > 0 {
        Some(Duration::from_secs(duration_secs))
    } else {
        None
    };
    if duration_secs == 0 {
        warn!("running against the simulator with no duration limit; Ctrl+C to stop");
    }

    drive_session(&controller, opener, "SIM", 9600, &config, run_for)
}
