//! Linear algebra type aliases for the teleop pipeline
//!
//! Keeps the kinematics, IK and calibration code on one set of names so the
//! dimension of every matrix is visible at the use site.

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Rotation3, UnitQuaternion, Vector3};

// ===== Task-space dimensions =====
pub const POSITION_DIM: usize = 3;
pub const POSE_DIM: usize = 6; // position + axis-angle orientation

// ===== Spatial types =====
pub type Vec3 = Vector3<f64>;
pub type Mat3 = Matrix3<f64>;
pub type Quat = UnitQuaternion<f64>;
pub type Rot3 = Rotation3<f64>;
pub type Iso3 = Isometry3<f64>;

// ===== Solver workspace (rows = task dim, cols = DoF) =====
pub type TaskMatrix = DMatrix<f64>;
pub type TaskVector = DVector<f64>;
