//! Operator pose → robot end-effector target.
//!
//! Calibration maps the operator pose into the robot base frame, the position
//! is scaled about an anchor point, and the result is clamped into the
//! reachable workspace. Clamping is not an error; it is reported as a
//! [`BoundaryEvent`] and logged.

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationTransform;
use crate::config::RetargetConfig;
use crate::types::{Pose, Quat, Vec3};

// ─── Workspace ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkspaceBounds {
    /// Axis-aligned box in the robot base frame.
    Box { min: Vec3, max: Vec3 },
    /// Spherical shell around `center`.
    Shell { center: Vec3, inner_radius: f64, outer_radius: f64 },
}

impl WorkspaceBounds {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            WorkspaceBounds::Box { min, max } => {
                if (0..3).all(|i| min[i] < max[i]) {
                    Ok(())
                } else {
                    Err(format!("workspace box min {:?} not below max {:?}", min, max))
                }
            }
            WorkspaceBounds::Shell { inner_radius, outer_radius, .. } => {
                if *inner_radius >= 0.0 && inner_radius < outer_radius {
                    Ok(())
                } else {
                    Err(format!(
                        "workspace shell radii must satisfy 0 <= inner ({}) < outer ({})",
                        inner_radius, outer_radius
                    ))
                }
            }
        }
    }

    pub fn contains(&self, p: &Vec3) -> bool {
        match self {
            WorkspaceBounds::Box { min, max } => (0..3).all(|i| p[i] >= min[i] && p[i] <= max[i]),
            WorkspaceBounds::Shell { center, inner_radius, outer_radius } => {
                let r = (p - center).norm();
                r >= *inner_radius && r <= *outer_radius
            }
        }
    }

    /// Nearest point inside the bounds (componentwise for a box, radial for a shell).
    pub fn clamp(&self, p: &Vec3) -> Vec3 {
        match self {
            WorkspaceBounds::Box { min, max } => {
                Vec3::new(p.x.clamp(min.x, max.x), p.y.clamp(min.y, max.y), p.z.clamp(min.z, max.z))
            }
            WorkspaceBounds::Shell { center, inner_radius, outer_radius } => {
                let offset = p - center;
                let r = offset.norm();
                if r > *outer_radius {
                    center + offset * (outer_radius / r)
                } else if r < *inner_radius {
                    // Direction is undefined at the center; push straight up
                    let dir = if r > 1e-12 { offset / r } else { Vec3::z() };
                    center + dir * *inner_radius
                } else {
                    *p
                }
            }
        }
    }
}

/// Requested position was outside the workspace and got clamped.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundaryEvent {
    pub requested: Vec3,
    pub clamped: Vec3,
}

impl BoundaryEvent {
    pub fn excess(&self) -> f64 {
        (self.requested - self.clamped).norm()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Retargeted {
    pub pose: Pose,
    pub clamp: Option<BoundaryEvent>,
}

// ─── Retargeter ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Retargeter {
    scale: f64,
    scale_anchor: Vec3,
    orientation_offset: Quat,
    workspace: WorkspaceBounds,
}

impl Retargeter {
    pub fn new(config: &RetargetConfig) -> Self {
        Self {
            scale: config.scale,
            scale_anchor: config.scale_anchor,
            orientation_offset: Quat::identity(),
            workspace: config.workspace.clone(),
        }
    }

    /// Fixed rotation applied after calibration (tool frame alignment).
    pub fn with_orientation_offset(mut self, offset: Quat) -> Self {
        self.orientation_offset = offset;
        self
    }

    pub fn workspace(&self) -> &WorkspaceBounds {
        &self.workspace
    }

    pub fn retarget(&self, operator: &Pose, calibration: &CalibrationTransform) -> Retargeted {
        retarget(operator, calibration, self.scale, &self.scale_anchor, &self.orientation_offset, &self.workspace)
    }
}

/// Calibrate, scale about `anchor`, then clamp into `workspace`. Never fails.
pub fn retarget(
    operator: &Pose,
    calibration: &CalibrationTransform,
    scale: f64,
    anchor: &Vec3,
    orientation_offset: &Quat,
    workspace: &WorkspaceBounds,
) -> Retargeted {
    let in_robot = calibration.apply(operator);
    let requested = anchor + (in_robot.position - anchor) * scale;
    let orientation = in_robot.orientation * orientation_offset;

    let clamped = workspace.clamp(&requested);
    let clamp = if clamped != requested {
        let event = BoundaryEvent { requested, clamped };
        log::info!(
            "Workspace clamp: requested [{:.3}, {:.3}, {:.3}] -> [{:.3}, {:.3}, {:.3}] ({:.3} m outside)",
            requested.x,
            requested.y,
            requested.z,
            clamped.x,
            clamped.y,
            clamped.z,
            event.excess()
        );
        Some(event)
    } else {
        None
    };

    Retargeted {
        pose: Pose::new(clamped, orientation),
        clamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{calibrate, CalibrationPair};
    use approx::assert_relative_eq;

    fn unit_box() -> WorkspaceBounds {
        WorkspaceBounds::Box {
            min: Vec3::new(-1.0, -1.0, 0.0),
            max: Vec3::new(1.0, 1.0, 1.0),
        }
    }

    #[test]
    fn test_box_clamp_is_componentwise() {
        let clamped = unit_box().clamp(&Vec3::new(2.0, 0.5, -0.3));
        assert_eq!(clamped, Vec3::new(1.0, 0.5, 0.0));
    }

    #[test]
    fn test_shell_clamps_radially() {
        let shell = WorkspaceBounds::Shell {
            center: Vec3::zeros(),
            inner_radius: 0.1,
            outer_radius: 0.5,
        };
        let outside = shell.clamp(&Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(outside, Vec3::new(0.5, 0.0, 0.0), epsilon = 1e-12);

        let inside = shell.clamp(&Vec3::new(0.0, 0.05, 0.0));
        assert_relative_eq!(inside, Vec3::new(0.0, 0.1, 0.0), epsilon = 1e-12);

        let at_center = shell.clamp(&Vec3::zeros());
        assert!(shell.contains(&at_center));
    }

    #[test]
    fn test_clamp_reported_only_when_active() {
        let config = RetargetConfig {
            workspace: unit_box(),
            ..RetargetConfig::default()
        };
        let retargeter = Retargeter::new(&config);
        let calibration = CalibrationTransform::identity();

        let inside = retargeter.retarget(&Pose::from_position(Vec3::new(0.2, 0.2, 0.2)), &calibration);
        assert!(inside.clamp.is_none());

        let outside = retargeter.retarget(&Pose::from_position(Vec3::new(0.2, 3.0, 0.2)), &calibration);
        let event = outside.clamp.unwrap();
        assert_eq!(event.requested.y, 3.0);
        assert_eq!(outside.pose.position, Vec3::new(0.2, 1.0, 0.2));
        assert_relative_eq!(event.excess(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scale_about_anchor() {
        let config = RetargetConfig {
            scale: 0.5,
            scale_anchor: Vec3::new(0.0, 0.0, 0.5),
            workspace: unit_box(),
        };
        let out = Retargeter::new(&config)
            .retarget(&Pose::from_position(Vec3::new(0.4, 0.0, 0.9)), &CalibrationTransform::identity());
        assert_relative_eq!(out.pose.position, Vec3::new(0.2, 0.0, 0.7), epsilon = 1e-12);
    }

    #[test]
    fn test_reference_points_round_trip() {
        // Operator frame: robot frame rotated 90° about z and shifted
        let truth_rotation = Quat::from_axis_angle(&Vec3::z_axis(), std::f64::consts::FRAC_PI_2);
        let truth_translation = Vec3::new(0.1, -0.2, 0.05);
        let references = [
            Vec3::new(0.35, 0.0, 0.30),
            Vec3::new(0.25, 0.25, 0.30),
            Vec3::new(0.25, -0.25, 0.30),
            Vec3::new(0.30, 0.0, 0.55),
        ];
        let pairs: Vec<CalibrationPair> = references
            .iter()
            .map(|r| {
                let operator = truth_rotation.inverse() * (r - truth_translation);
                CalibrationPair::new(Pose::from_position(operator), Pose::from_position(*r))
            })
            .collect();

        let calibration = calibrate(&pairs, 3, 1e-3).unwrap();
        let retargeter = Retargeter::new(&RetargetConfig::default());
        for pair in &pairs {
            let out = retargeter.retarget(&pair.operator, &calibration);
            assert!(out.clamp.is_none());
            assert_relative_eq!(out.pose.position, pair.reference.position, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let inverted = WorkspaceBounds::Shell {
            center: Vec3::zeros(),
            inner_radius: 0.5,
            outer_radius: 0.2,
        };
        assert!(inverted.validate().is_err());
        assert!(unit_box().validate().is_ok());
    }
}
