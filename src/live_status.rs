use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::control_loop::{LoopSnapshot, LoopState};

/// Status file rewritten periodically while the loop runs.
#[derive(Serialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub backend: String,
    pub state: LoopState,
    pub ticks: u64,
    pub dispatched: u64,
    pub missed_deadlines: u64,
    pub overruns: u64,
    pub boundary_clamps: u64,
    // IK outcomes
    pub ik_converged: u64,
    pub ik_not_converged: u64,
    pub ik_singular: u64,
    pub last_residual: Option<f64>,
    // Calibration
    pub calibration_version: u64,
    pub calibration_rms_error: f64,
    // Health
    pub pose_healthy: bool,
    pub ik_healthy: bool,
    pub dispatch_healthy: bool,
    pub pose_silence_ms: Option<f64>,
    pub recovery: String,
    pub fault_reason: Option<String>,
    pub commanded: Option<Vec<f64>>,
}

impl LiveStatus {
    pub fn from_snapshot(snapshot: &LoopSnapshot, backend: &str, uptime_seconds: u64) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            backend: backend.to_string(),
            state: snapshot.state,
            ticks: snapshot.stats.ticks,
            dispatched: snapshot.stats.dispatched,
            missed_deadlines: snapshot.stats.missed_deadlines,
            overruns: snapshot.stats.overruns,
            boundary_clamps: snapshot.stats.boundary_clamps,
            ik_converged: snapshot.stats.ik_converged,
            ik_not_converged: snapshot.stats.ik_not_converged,
            ik_singular: snapshot.stats.ik_singular,
            last_residual: snapshot.last_residual,
            calibration_version: snapshot.calibration_version,
            calibration_rms_error: snapshot.calibration_rms_error,
            pose_healthy: snapshot.health.pose.healthy,
            ik_healthy: snapshot.health.ik.healthy,
            dispatch_healthy: snapshot.health.dispatch.healthy,
            pose_silence_ms: snapshot.health.pose.silence_ms,
            recovery: snapshot.recovery.clone(),
            fault_reason: snapshot.fault_reason.clone(),
            commanded: snapshot.commanded.clone(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
