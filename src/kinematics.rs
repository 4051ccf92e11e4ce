//! Serial kinematic chain for the teleoperated arm.
//!
//! A [`KinematicChain`] is an ordered list of actuated joints from the robot
//! base to the end-effector, built once from [`RobotConfig`]. It provides
//! forward kinematics and the geometric Jacobian used by the IK solver.

use nalgebra::{Translation3, UnitVector3};

use crate::config::{JointKind, RobotConfig};
use crate::error::ConfigError;
use crate::types::{Iso3, Mat3, Quat, TaskMatrix, Vec3};

/// A single actuated joint.
#[derive(Debug, Clone)]
pub struct ChainJoint {
    pub name: String,
    /// Static transform from the previous joint frame to this joint frame.
    pub origin: Iso3,
    /// Joint axis in the joint's local frame.
    pub axis: UnitVector3<f64>,
    pub kind: JointKind,
}

/// Ordered chain from base to end-effector.
#[derive(Debug, Clone)]
pub struct KinematicChain {
    joints: Vec<ChainJoint>,
    ee_offset: Iso3,
}

impl KinematicChain {
    pub fn from_config(robot: &RobotConfig) -> Result<Self, ConfigError> {
        let mut joints = Vec::with_capacity(robot.joints.len());
        for spec in &robot.joints {
            let axis = Vec3::new(spec.axis[0], spec.axis[1], spec.axis[2]);
            if axis.norm() < 1e-9 {
                return Err(ConfigError::Invalid(format!("joint {} has a zero axis", spec.name)));
            }
            let translation = Translation3::new(spec.origin_xyz[0], spec.origin_xyz[1], spec.origin_xyz[2]);
            let rotation = Quat::from_matrix(&rotation_matrix_from_rpy(
                spec.origin_rpy[0],
                spec.origin_rpy[1],
                spec.origin_rpy[2],
            ));
            joints.push(ChainJoint {
                name: spec.name.clone(),
                origin: Iso3::from_parts(translation, rotation),
                axis: UnitVector3::new_normalize(axis),
                kind: spec.kind,
            });
        }
        let [x, y, z] = robot.ee_offset_xyz;
        Ok(Self {
            joints,
            ee_offset: Iso3::translation(x, y, z),
        })
    }

    pub fn dof(&self) -> usize {
        self.joints.len()
    }

    pub fn joints(&self) -> &[ChainJoint] {
        &self.joints
    }

    pub fn joint_names(&self) -> Vec<&str> {
        self.joints.iter().map(|j| j.name.as_str()).collect()
    }

    /// End-effector pose in the base frame.
    ///
    /// `q` must have `dof()` entries; extra entries are ignored and missing
    /// ones leave the remaining joints at their zero position.
    pub fn forward_kinematics(&self, q: &[f64]) -> Iso3 {
        let mut transform = Iso3::identity();
        for (joint, &value) in self.joints.iter().zip(q.iter()) {
            transform *= joint.origin;
            transform *= joint_transform(joint, value);
        }
        transform * self.ee_offset
    }

    /// Joint origins and axes in the base frame, plus the end-effector pose.
    pub fn joint_frames(&self, q: &[f64]) -> (Vec<Vec3>, Vec<Vec3>, Iso3) {
        let mut transform = Iso3::identity();
        let mut origins = Vec::with_capacity(self.dof());
        let mut axes = Vec::with_capacity(self.dof());

        for (joint, &value) in self.joints.iter().zip(q.iter()) {
            transform *= joint.origin;
            origins.push(transform.translation.vector);
            axes.push(transform.rotation * joint.axis.into_inner());
            transform *= joint_transform(joint, value);
        }

        (origins, axes, transform * self.ee_offset)
    }

    /// 6×n geometric Jacobian: linear rows first, angular rows last.
    pub fn jacobian(&self, q: &[f64]) -> TaskMatrix {
        let (origins, axes, ee) = self.joint_frames(q);
        self.jacobian_from_frames(&origins, &axes, &ee)
    }

    /// Jacobian from frames already returned by [`Self::joint_frames`].
    pub fn jacobian_from_frames(&self, origins: &[Vec3], axes: &[Vec3], ee: &Iso3) -> TaskMatrix {
        let ee_pos = ee.translation.vector;
        let mut jacobian = TaskMatrix::zeros(6, self.dof());

        for (i, joint) in self.joints.iter().enumerate() {
            let z_i = axes[i];
            match joint.kind {
                JointKind::Prismatic => {
                    jacobian.fixed_view_mut::<3, 1>(0, i).copy_from(&z_i);
                }
                JointKind::Revolute => {
                    let linear = z_i.cross(&(ee_pos - origins[i]));
                    jacobian.fixed_view_mut::<3, 1>(0, i).copy_from(&linear);
                    jacobian.fixed_view_mut::<3, 1>(3, i).copy_from(&z_i);
                }
            }
        }

        jacobian
    }

    /// Upper bound on the end-effector distance from the first joint origin
    /// (revolute chains only; prismatic travel is not included).
    pub fn max_reach(&self) -> f64 {
        let links: f64 = self.joints.iter().skip(1).map(|j| j.origin.translation.vector.norm()).sum();
        links + self.ee_offset.translation.vector.norm()
    }

    /// Position of the first joint in the base frame.
    pub fn base_origin(&self) -> Vec3 {
        self.joints
            .first()
            .map(|j| j.origin.translation.vector)
            .unwrap_or_else(Vec3::zeros)
    }
}

fn joint_transform(joint: &ChainJoint, value: f64) -> Iso3 {
    match joint.kind {
        JointKind::Prismatic => Iso3::from_parts(
            Translation3::from(joint.axis.into_inner() * value),
            Quat::identity(),
        ),
        JointKind::Revolute => Iso3::from_parts(
            Translation3::identity(),
            Quat::from_axis_angle(&joint.axis, value),
        ),
    }
}

/// Rotation matrix from roll-pitch-yaw (extrinsic XYZ).
fn rotation_matrix_from_rpy(roll: f64, pitch: f64, yaw: f64) -> Mat3 {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();

    Mat3::new(
        cy * cp,
        cy * sp * sr - sy * cr,
        cy * sp * cr + sy * sr,
        sy * cp,
        sy * sp * sr + cy * cr,
        sy * sp * cr - cy * sr,
        -sp,
        cp * sr,
        cp * cr,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::JointSpec;
    use approx::assert_relative_eq;

    /// Yaw + two pitch joints: 0.05 m pedestal, 0.3 m upper arm, 0.25 m forearm.
    pub(crate) fn three_dof_arm() -> RobotConfig {
        RobotConfig {
            joints: vec![
                JointSpec::revolute("yaw", [0.0, 0.0, 0.05], [0.0, 0.0, 1.0], -3.1, 3.1, 2.0),
                JointSpec::revolute("shoulder", [0.0, 0.0, 0.0], [0.0, 1.0, 0.0], -2.0, 2.0, 2.0),
                JointSpec::revolute("elbow", [0.0, 0.0, 0.3], [0.0, 1.0, 0.0], -2.5, 2.5, 3.0),
            ],
            ee_offset_xyz: [0.0, 0.0, 0.25],
            home: vec![0.0, 0.5, 0.5],
        }
    }

    #[test]
    fn test_fk_zero_is_straight_up() {
        let chain = KinematicChain::from_config(&three_dof_arm()).unwrap();
        assert_eq!(chain.dof(), 3);
        let ee = chain.forward_kinematics(&[0.0, 0.0, 0.0]);
        assert_relative_eq!(ee.translation.vector, Vec3::new(0.0, 0.0, 0.6), epsilon = 1e-12);
    }

    #[test]
    fn test_fk_shoulder_quarter_turn_points_forward() {
        let chain = KinematicChain::from_config(&three_dof_arm()).unwrap();
        let ee = chain.forward_kinematics(&[0.0, std::f64::consts::FRAC_PI_2, 0.0]);
        assert_relative_eq!(ee.translation.vector, Vec3::new(0.55, 0.0, 0.05), epsilon = 1e-12);
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let chain = KinematicChain::from_config(&RobotConfig::default()).unwrap();
        let q = [0.3, 0.4, -0.6, 0.2, 0.5, -0.1];
        let jacobian = chain.jacobian(&q);
        let h = 1e-6;

        for i in 0..chain.dof() {
            let mut q_plus = q;
            let mut q_minus = q;
            q_plus[i] += h;
            q_minus[i] -= h;
            let p_plus = chain.forward_kinematics(&q_plus).translation.vector;
            let p_minus = chain.forward_kinematics(&q_minus).translation.vector;
            let numeric = (p_plus - p_minus) / (2.0 * h);
            for row in 0..3 {
                assert_relative_eq!(jacobian[(row, i)], numeric[row], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_max_reach_bounds_fk() {
        let chain = KinematicChain::from_config(&three_dof_arm()).unwrap();
        assert_relative_eq!(chain.max_reach(), 0.55, epsilon = 1e-12);
        let ee = chain.forward_kinematics(&[1.0, 0.7, 0.4]);
        assert!((ee.translation.vector - chain.base_origin()).norm() <= chain.max_reach() + 1e-12);
    }

    #[test]
    fn test_zero_axis_rejected() {
        let mut robot = three_dof_arm();
        robot.joints[1].axis = [0.0, 0.0, 0.0];
        assert!(KinematicChain::from_config(&robot).is_err());
    }
}
