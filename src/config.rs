//! Teleop configuration.
//!
//! [`TeleopConfig`] groups every tunable of the control loop. It is loaded
//! once at startup from JSON (any missing field falls back to its default)
//! and validated before the loop is built.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::points_degenerate;
use crate::error::ConfigError;
use crate::retarget::WorkspaceBounds;
use crate::types::{JointLimit, JointLimits, JointState, Vec3};

// ─── Control loop ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub rate_hz: f64,
    /// Bounded wait on each pose read.
    pub pose_timeout_ms: u64,
    /// Ticks the previous pose may be reused before a data-loss fault.
    pub max_pose_reuse: u32,
    /// Bounded wait on each backend dispatch.
    pub dispatch_timeout_ms: u64,
    /// Consecutive missed dispatch deadlines tolerated before faulting.
    pub max_missed_deadlines: u32,
    /// NotConverged solves tolerated in a row before pausing.
    pub not_converged_pause_streak: u32,
    /// IK failures (any kind) tolerated in a row before faulting.
    pub fault_streak: u32,
    /// Converged solves needed while paused to resume automatically.
    pub resume_after_converged: u32,
    /// First wait after a failed resume from Faulted; grows 1.5x per failure.
    pub resume_cooldown_ms: u64,
    pub max_resume_cooldown_ms: u64,
    /// 0 = unlimited
    pub max_resume_attempts: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            rate_hz: 100.0,
            pose_timeout_ms: 5,
            max_pose_reuse: 3,
            dispatch_timeout_ms: 3,
            max_missed_deadlines: 5,
            not_converged_pause_streak: 5,
            fault_streak: 50,
            resume_after_converged: 3,
            resume_cooldown_ms: 500,
            max_resume_cooldown_ms: 30_000,
            max_resume_attempts: 0,
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    pub fn pose_timeout(&self) -> Duration {
        Duration::from_millis(self.pose_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn resume_cooldown(&self) -> Duration {
        Duration::from_millis(self.resume_cooldown_ms)
    }

    pub fn max_resume_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_resume_cooldown_ms)
    }
}

// ─── IK solver ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IkConfig {
    pub max_iterations: u32,
    /// Residual (task-space norm) below which a solve converges.
    pub tolerance: f64,
    /// Damping factor (lambda). Higher = more robust near singularities.
    pub damping: f64,
    /// Weight of the orientation residual; 0 solves for position only.
    pub orientation_weight: f64,
    pub singular_value_threshold: f64,
    /// Iterations in a row below the threshold before reporting a singularity.
    pub singular_consecutive: u32,
    /// Iterations without meaningful improvement before giving up early.
    pub stall_window: u32,
    pub stall_improvement: f64,
}

impl Default for IkConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-4,
            damping: 0.05,
            orientation_weight: 0.0,
            singular_value_threshold: 1e-3,
            singular_consecutive: 10,
            stall_window: 20,
            stall_improvement: 1e-6,
        }
    }
}

// ─── Trajectory filter ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// EMA time constant in seconds; 0 disables smoothing.
    pub time_constant: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { time_constant: 0.03 }
    }
}

// ─── Retargeting ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetargetConfig {
    pub scale: f64,
    /// Point in the robot frame that scaling is applied about.
    pub scale_anchor: Vec3,
    pub workspace: WorkspaceBounds,
}

impl Default for RetargetConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            scale_anchor: Vec3::zeros(),
            workspace: WorkspaceBounds::Shell {
                center: Vec3::new(0.0, 0.0, 0.25),
                inner_radius: 0.1,
                outer_radius: 0.75,
            },
        }
    }
}

// ─── Calibration ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_samples: usize,
    /// Ratio of second to largest eigenvalue of a point scatter below which
    /// the points count as collinear. Applies to both operator and reference
    /// points.
    pub degeneracy_eps: f64,
    /// Guided-sequence reference points in the robot base frame.
    pub reference_points: Vec<Vec3>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_samples: 4,
            degeneracy_eps: 1e-3,
            reference_points: vec![
                Vec3::new(0.35, 0.0, 0.30),
                Vec3::new(0.25, 0.25, 0.30),
                Vec3::new(0.25, -0.25, 0.30),
                Vec3::new(0.30, 0.0, 0.55),
            ],
        }
    }
}

// ─── Robot model ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    Revolute,
    Prismatic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JointSpec {
    pub name: String,
    pub kind: JointKind,
    /// Offset from the previous joint frame.
    pub origin_xyz: [f64; 3],
    pub origin_rpy: [f64; 3],
    pub axis: [f64; 3],
    pub min: f64,
    pub max: f64,
    pub max_velocity: f64,
}

impl JointSpec {
    pub fn revolute(name: &str, origin_xyz: [f64; 3], axis: [f64; 3], min: f64, max: f64, max_velocity: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: JointKind::Revolute,
            origin_xyz,
            origin_rpy: [0.0; 3],
            axis,
            min,
            max,
            max_velocity,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub joints: Vec<JointSpec>,
    /// End-effector offset after the last joint.
    pub ee_offset_xyz: [f64; 3],
    /// Start posture of the simulated robot; empty means all zeros.
    #[serde(default)]
    pub home: Vec<f64>,
}

impl Default for RobotConfig {
    fn default() -> Self {
        // 6-DoF arm: base yaw, shoulder/elbow pitch, forearm roll, wrist pitch/roll
        Self {
            joints: vec![
                JointSpec::revolute("j1_base_yaw", [0.0, 0.0, 0.05], [0.0, 0.0, 1.0], -3.1, 3.1, 2.0),
                JointSpec::revolute("j2_shoulder_pitch", [0.0, 0.0, 0.2], [0.0, 1.0, 0.0], -1.57, 2.35, 2.0),
                JointSpec::revolute("j3_elbow_pitch", [0.0, 0.0, 0.3], [0.0, 1.0, 0.0], -2.35, 2.35, 3.0),
                JointSpec::revolute("j4_forearm_roll", [0.0, 0.0, 0.1], [0.0, 0.0, 1.0], -3.1, 3.1, 5.0),
                JointSpec::revolute("j5_wrist_pitch", [0.0, 0.0, 0.2], [0.0, 1.0, 0.0], -2.09, 2.09, 5.0),
                JointSpec::revolute("j6_wrist_roll", [0.0, 0.0, 0.06], [0.0, 0.0, 1.0], -3.1, 3.1, 8.0),
            ],
            ee_offset_xyz: [0.0, 0.0, 0.0],
            home: vec![0.0, 0.4, 0.9, 0.0, 0.6, 0.0],
        }
    }
}

impl RobotConfig {
    pub fn dof(&self) -> usize {
        self.joints.len()
    }

    pub fn home_state(&self) -> JointState {
        if self.home.is_empty() {
            JointState::zeros(self.dof())
        } else {
            JointState::new(self.home.clone())
        }
    }

    pub fn joint_limits(&self) -> Result<JointLimits, ConfigError> {
        let limits = self
            .joints
            .iter()
            .map(|j| JointLimit::new(j.min, j.max, j.max_velocity))
            .collect();
        JointLimits::new(limits).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

// ─── Backend selection ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Simulation,
    Hardware,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Simulation
    }
}

// ─── Top-level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    pub control: ControlConfig,
    pub ik: IkConfig,
    pub filter: FilterConfig,
    pub retarget: RetargetConfig,
    pub calibration: CalibrationConfig,
    pub robot: RobotConfig,
    pub backend: BackendKind,
}

impl TeleopConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: TeleopConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded teleop config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.control.rate_hz > 0.0 && self.control.rate_hz <= 1000.0) {
            return invalid(format!("control.rate_hz {} outside (0, 1000]", self.control.rate_hz));
        }
        if self.control.not_converged_pause_streak == 0 || self.control.fault_streak == 0 {
            return invalid("control streak thresholds must be at least 1".to_string());
        }
        if self.ik.max_iterations == 0 {
            return invalid("ik.max_iterations must be at least 1".to_string());
        }
        if !(self.ik.tolerance > 0.0) || self.ik.damping < 0.0 || self.ik.orientation_weight < 0.0 {
            return invalid("ik tolerance must be positive, damping and orientation_weight non-negative".to_string());
        }
        if self.ik.singular_consecutive == 0 {
            return invalid("ik.singular_consecutive must be at least 1".to_string());
        }
        if self.filter.time_constant < 0.0 {
            return invalid(format!("filter.time_constant {} is negative", self.filter.time_constant));
        }
        if !(self.retarget.scale > 0.0) {
            return invalid(format!("retarget.scale {} must be positive", self.retarget.scale));
        }
        self.retarget.workspace.validate().map_err(ConfigError::Invalid)?;
        if self.calibration.min_samples < 3 {
            return invalid(format!(
                "calibration.min_samples {} below the 3 points a rigid fit needs",
                self.calibration.min_samples
            ));
        }
        let references = &self.calibration.reference_points;
        if !references.is_empty() && points_degenerate(references, self.calibration.degeneracy_eps) {
            return invalid(format!(
                "calibration.reference_points ({} points) are coincident or collinear",
                references.len()
            ));
        }
        if self.robot.joints.is_empty() {
            return invalid("robot.joints is empty".to_string());
        }
        let limits = self.robot.joint_limits()?;
        let home = self.robot.home_state();
        if home.dof() != limits.dof() || !limits.contains(&home) {
            return invalid(format!("robot.home {:?} does not fit the joint limits", self.robot.home));
        }
        Ok(())
    }
}
