use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use ik_teleop_rs::backend::{Backend, RobotBackend, SimulatedBackend};
use ik_teleop_rs::calibration::{CalibrationHandle, CalibrationTranscript};
use ik_teleop_rs::config::{BackendKind, TeleopConfig};
use ik_teleop_rs::control_loop::{ControlLoop, LoopSnapshot, LoopState, LoopStats};
use ik_teleop_rs::handoff::latest_value;
use ik_teleop_rs::live_status::LiveStatus;
use ik_teleop_rs::source::{synthetic_pose_loop, ChannelPoseSource, SyntheticMotion};

#[derive(Parser, Debug)]
#[command(name = "ik_teleop")]
#[command(about = "Hand-tracking teleop: calibrate, retarget, solve IK and stream joint targets", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend (sim, hardware); overrides the config file
    #[arg(long)]
    backend: Option<String>,

    /// Recorded calibration transcript to replay instead of a guided session
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "teleop_sessions")]
    output_dir: String,
}

#[derive(Serialize)]
struct SessionOutput {
    backend: &'static str,
    duration_seconds: f64,
    stats: LoopStats,
    final_state: LoopSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TeleopConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => TeleopConfig::default(),
    };
    if let Some(kind) = &args.backend {
        config.backend = match kind.as_str() {
            "sim" | "simulation" => BackendKind::Simulation,
            "hardware" => BackendKind::Hardware,
            other => bail!("unknown backend '{}' (expected sim or hardware)", other),
        };
    }

    println!("[{}] IK Teleop Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Backend: {:?}", config.backend);
    println!("  Rate: {:.0} Hz, {} joints", config.control.rate_hz, config.robot.dof());
    println!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)?;

    let backend = match config.backend {
        BackendKind::Simulation => {
            let limits = Arc::new(config.robot.joint_limits()?);
            Backend::Simulation(SimulatedBackend::new(
                config.robot.home_state(),
                limits,
                config.control.period(),
            ))
        }
        BackendKind::Hardware => bail!("no joint driver is linked into this binary; run with --backend sim"),
    };

    let transcript = match &args.calibration {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading calibration transcript {}", path.display()))?;
            Some(CalibrationTranscript::from_json_str(&json).context("parsing calibration transcript")?)
        }
        None => None,
    };

    let stop = Arc::new(AtomicBool::new(false));

    // Pose I/O task → latest-value slot → control thread
    let motion = SyntheticMotion::default();
    let (pose_tx, pose_rx) = latest_value();
    let pose_task = tokio::spawn(synthetic_pose_loop(pose_tx, motion.clone(), stop.clone()));

    let mut control = ControlLoop::new(&config, ChannelPoseSource::new(pose_rx), backend, CalibrationHandle::default())?;
    let backend_name = control.backend().name();

    let transform = match &transcript {
        Some(transcript) => {
            println!("[{}] Replaying calibration transcript ({} pairs)...", ts_now(), transcript.pairs.len());
            control.calibrate_from_transcript(transcript)?
        }
        None => {
            // The synthetic operator answers each guided reference by placing
            // its hand there, as seen from its own tracking frame.
            println!("[{}] Running guided calibration...", ts_now());
            control.begin_calibration()?;
            let needed = config
                .calibration
                .reference_points
                .len()
                .max(config.calibration.min_samples);
            for _ in 0..needed {
                let reference = control
                    .next_calibration_reference()
                    .ok_or_else(|| anyhow!("calibration.reference_points is empty"))?;
                control.record_guided_sample(motion.operator_pose_for(&reference))?;
            }
            control.finish_calibration()?
        }
    };
    println!(
        "[{}] Calibration v{} accepted: rms {:.4} m over {} samples",
        ts_now(),
        transform.version,
        transform.rms_error,
        transform.sample_count
    );
    println!(
        "  Operator → robot: rotation {:.3} rad, translation [{:.3}, {:.3}, {:.3}]",
        transform.rotation.angle(),
        transform.translation.x,
        transform.translation.y,
        transform.translation.z
    );

    // Status snapshots flow out of the control thread through another slot
    let (status_tx, status_rx) = latest_value::<LoopSnapshot>();
    let loop_stop = stop.clone();
    let control_thread = std::thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || {
            let mut last_snapshot = Instant::now();
            let mut last_health_log = Instant::now();
            let stats = control.run(loop_stop, |ctl, report| {
                let now = Instant::now();
                if report.entered(LoopState::Faulted) {
                    println!("[{}] ⚠ Control loop faulted; holding position", ts_now());
                }
                if now.duration_since(last_snapshot) >= Duration::from_millis(100) {
                    status_tx.publish(ctl.snapshot(now));
                    last_snapshot = now;
                }
                if now.duration_since(last_health_log) >= Duration::from_secs(5) {
                    log::info!("{}", ctl.health().format_status(now));
                    last_health_log = now;
                }
            });
            (stats, control.snapshot(Instant::now()))
        })?;

    let status_dir = args.output_dir.clone();
    let status_stop = stop.clone();
    let status_task = tokio::spawn(async move {
        let started = Instant::now();
        while !status_stop.load(Ordering::Relaxed) {
            sleep(Duration::from_secs(2)).await;
            if let Ok(Some(snapshot)) = status_rx.try_latest() {
                let status = LiveStatus::from_snapshot(&snapshot, backend_name, started.elapsed().as_secs());
                if let Err(e) = status.save(format!("{}/live_status.json", status_dir)) {
                    log::warn!("Failed to write live status: {}", e);
                }
            }
        }
    });

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("[{}] Ctrl-C received, stopping...", ts_now());
            signal_stop.store(true, Ordering::Relaxed);
        }
    });
    if args.duration > 0 {
        let duration_stop = stop.clone();
        let seconds = args.duration;
        tokio::spawn(async move {
            sleep(Duration::from_secs(seconds)).await;
            println!("[{}] Duration reached, stopping...", ts_now());
            duration_stop.store(true, Ordering::Relaxed);
        });
    }

    println!("[{}] Control loop running...", ts_now());
    let start = Utc::now();
    let (stats, final_state) = tokio::task::spawn_blocking(move || control_thread.join())
        .await?
        .map_err(|_| anyhow!("control loop thread panicked"))?;

    // The loop may also end on its own (Stopped); release the I/O tasks either way
    stop.store(true, Ordering::Relaxed);
    let pose_samples = pose_task.await?;
    status_task.await?;

    let duration_seconds = Utc::now().signed_duration_since(start).num_milliseconds().max(0) as f64 / 1000.0;
    let final_status = LiveStatus::from_snapshot(&final_state, backend_name, duration_seconds as u64);
    let status_path = format!("{}/live_status_final.json", args.output_dir);
    let _ = final_status.save(&status_path);

    let output = SessionOutput { backend: backend_name, duration_seconds, stats, final_state };
    let filename = format!("{}/session_{}.json", args.output_dir, ts_now_clean());
    let json = serde_json::to_string_pretty(&output)?;
    std::fs::write(&filename, json)?;
    println!("[{}] Session summary saved to {}", ts_now(), filename);

    println!("\n=== Final Stats ===");
    println!("Pose samples: {}", pose_samples);
    println!("Ticks: {} ({} overruns)", output.stats.ticks, output.stats.overruns);
    println!("Dispatched: {} (held {})", output.stats.dispatched, output.stats.held);
    println!(
        "IK: {} converged, {} not converged, {} singular",
        output.stats.ik_converged, output.stats.ik_not_converged, output.stats.ik_singular
    );
    println!("Missed deadlines: {}, faults: {}", output.stats.missed_deadlines, output.stats.faults);

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
