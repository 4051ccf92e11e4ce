pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

use crate::error::TeleopError;

// ─── Poses ───────────────────────────────────────────────────────────────────

/// Rigid pose: position plus unit-quaternion orientation.
///
/// The quaternion is normalized by construction, so every read sees a valid
/// rotation. Poses are `Copy` and never edited after creation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self { position, orientation }
    }

    pub fn identity() -> Self {
        Self { position: Vec3::zeros(), orientation: Quat::identity() }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self { position, orientation: Quat::identity() }
    }

    /// Build from a (possibly noisy) rotation matrix; the nearest rotation is used.
    pub fn from_rotation_matrix(position: Vec3, rotation: &Mat3) -> Self {
        let orientation = Quat::from_matrix(rotation);
        Self { position, orientation }
    }

    pub fn from_isometry(iso: &Iso3) -> Self {
        Self { position: iso.translation.vector, orientation: iso.rotation }
    }

    pub fn to_isometry(&self) -> Iso3 {
        Iso3::from_parts(self.position.into(), self.orientation)
    }

    pub fn with_position(&self, position: Vec3) -> Self {
        Self { position, orientation: self.orientation }
    }

    pub fn position_distance(&self, other: &Pose) -> f64 {
        (self.position - other.position).norm()
    }

    pub fn angle_to(&self, other: &Pose) -> f64 {
        self.orientation.angle_to(&other.orientation)
    }
}

/// Timestamped operator pose from a pose source.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    /// Seconds, monotonic per source.
    pub timestamp: f64,
    pub pose: Pose,
}

impl PoseSample {
    pub fn new(timestamp: f64, pose: Pose) -> Self {
        Self { timestamp, pose }
    }
}

// ─── Joint space ─────────────────────────────────────────────────────────────

/// Per-joint angles (or prismatic positions), length = robot DoF.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointState(Vec<f64>);

impl JointState {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(dof: usize) -> Self {
        Self(vec![0.0; dof])
    }

    pub fn dof(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.0.iter()
    }

    pub fn ensure_dof(&self, dof: usize) -> Result<(), TeleopError> {
        if self.0.len() == dof {
            Ok(())
        } else {
            Err(TeleopError::DimensionMismatch { expected: dof, got: self.0.len() })
        }
    }

    /// Largest absolute per-joint difference.
    pub fn max_abs_diff(&self, other: &JointState) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl std::ops::Index<usize> for JointState {
    type Output = f64;

    fn index(&self, idx: usize) -> &f64 {
        &self.0[idx]
    }
}

impl From<Vec<f64>> for JointState {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Position and velocity bounds for one joint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointLimit {
    pub min: f64,
    pub max: f64,
    pub max_velocity: f64,
}

impl JointLimit {
    pub fn new(min: f64, max: f64, max_velocity: f64) -> Self {
        Self { min, max, max_velocity }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Ordered joint limits for the whole robot. Built once, shared read-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointLimits(Vec<JointLimit>);

impl JointLimits {
    pub fn new(limits: Vec<JointLimit>) -> Result<Self, TeleopError> {
        for (idx, limit) in limits.iter().enumerate() {
            if !(limit.min < limit.max) {
                return Err(TeleopError::InvalidLimits(format!(
                    "joint {idx}: min {} must be below max {}",
                    limit.min, limit.max
                )));
            }
            if !(limit.max_velocity > 0.0) {
                return Err(TeleopError::InvalidLimits(format!(
                    "joint {idx}: max_velocity {} must be positive",
                    limit.max_velocity
                )));
            }
        }
        Ok(Self(limits))
    }

    pub fn dof(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, idx: usize) -> Option<&JointLimit> {
        self.0.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JointLimit> {
        self.0.iter()
    }

    /// Project every joint into its `[min, max]` range.
    pub fn project(&self, state: &mut JointState) {
        for (value, limit) in state.as_mut_slice().iter_mut().zip(self.0.iter()) {
            *value = limit.clamp(*value);
        }
    }

    pub fn contains(&self, state: &JointState) -> bool {
        state.dof() == self.dof()
            && state.iter().zip(self.0.iter()).all(|(v, l)| l.contains(*v))
    }
}
