use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ControlConfig;

/// Consecutive-failure tracking for one stage of the control tick.
#[derive(Clone, Debug)]
pub struct ComponentHealth {
    pub name: &'static str,
    /// Failures tolerated in a row; one more escalates.
    pub threshold: u32,
    streak: u32,
    total_failures: u64,
    total_ok: u64,
    last_ok: Option<Instant>,
}

impl ComponentHealth {
    pub fn new(name: &'static str, threshold: u32) -> Self {
        ComponentHealth {
            name,
            threshold,
            streak: 0,
            total_failures: 0,
            total_ok: 0,
            last_ok: None,
        }
    }

    pub fn record_ok(&mut self, now: Instant) {
        self.streak = 0;
        self.total_ok += 1;
        self.last_ok = Some(now);
    }

    /// Returns the streak including this failure.
    pub fn record_failure(&mut self) -> u32 {
        self.streak += 1;
        self.total_failures += 1;
        self.streak
    }

    /// Streak has gone beyond the tolerated threshold.
    pub fn exceeded(&self) -> bool {
        self.streak > self.threshold
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn total_ok(&self) -> u64 {
        self.total_ok
    }

    pub fn silence(&self, now: Instant) -> Option<Duration> {
        self.last_ok.map(|t| now.saturating_duration_since(t))
    }

    pub fn reset_streak(&mut self) {
        self.streak = 0;
    }
}

/// Streak state for every stage the control loop escalates on.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    /// Pose reads that timed out or were rejected.
    pub pose: ComponentHealth,
    /// NotConverged solves (pause escalation).
    pub ik_not_converged: ComponentHealth,
    /// Any non-converged solve (fault escalation).
    pub ik_failures: ComponentHealth,
    /// Dispatches that missed their deadline.
    pub deadlines: ComponentHealth,
}

impl HealthMonitor {
    pub fn new(config: &ControlConfig) -> Self {
        HealthMonitor {
            pose: ComponentHealth::new("Pose", config.max_pose_reuse),
            ik_not_converged: ComponentHealth::new("IK", config.not_converged_pause_streak),
            ik_failures: ComponentHealth::new("IK-fault", config.fault_streak),
            deadlines: ComponentHealth::new("Dispatch", config.max_missed_deadlines),
        }
    }

    /// Clear every streak (e.g. after an operator resume).
    pub fn reset_streaks(&mut self) {
        self.pose.reset_streak();
        self.ik_not_converged.reset_streak();
        self.ik_failures.reset_streak();
        self.deadlines.reset_streak();
    }

    pub fn check_health(&self, now: Instant) -> HealthReport {
        let entry = |c: &ComponentHealth| ComponentReport {
            name: c.name,
            healthy: c.streak == 0,
            streak: c.streak,
            threshold: c.threshold,
            total_failures: c.total_failures,
            silence_ms: c.silence(now).map(|d| d.as_secs_f64() * 1000.0),
        };
        HealthReport {
            pose: entry(&self.pose),
            ik: entry(&self.ik_failures),
            dispatch: entry(&self.deadlines),
        }
    }

    /// One-line status for periodic logging.
    pub fn format_status(&self, now: Instant) -> String {
        let report = self.check_health(now);
        let fmt = |c: &ComponentReport| {
            if c.healthy {
                "✓".to_string()
            } else {
                format!("⚠ ({}/{} in a row)", c.streak, c.threshold)
            }
        };
        format!(
            "Health: Pose {} | IK {} | Dispatch {}",
            fmt(&report.pose),
            fmt(&report.ik),
            fmt(&report.dispatch)
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentReport {
    pub name: &'static str,
    pub healthy: bool,
    pub streak: u32,
    pub threshold: u32,
    pub total_failures: u64,
    pub silence_ms: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub pose: ComponentReport,
    pub ik: ComponentReport,
    pub dispatch: ComponentReport,
}
