//! Joint-space trajectory filter: velocity clamp followed by an EMA low-pass.

use crate::config::FilterConfig;
use crate::error::{TeleopError, TeleopResult};
use crate::types::{JointLimits, JointState};

/// Rate-limits and smooths successive IK solutions.
///
/// Stateless apart from its time constant; the previous commanded state is
/// passed in by the caller, so a hold or a re-seed never leaves stale filter
/// memory behind.
#[derive(Clone, Debug)]
pub struct TrajectoryFilter {
    time_constant: f64,
}

impl TrajectoryFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self { time_constant: config.time_constant.max(0.0) }
    }

    pub fn time_constant(&self) -> f64 {
        self.time_constant
    }

    /// EMA weight for one step of length `dt`.
    pub fn alpha(&self, dt: f64) -> f64 {
        if self.time_constant <= 0.0 {
            1.0
        } else {
            dt / (self.time_constant + dt)
        }
    }

    /// Per joint: clamp the step to `max_velocity · dt`, low-pass toward it,
    /// then project into `[min, max]`.
    ///
    /// With `previous` inside the limits, no joint moves more than
    /// `max_velocity · dt` from `previous`.
    pub fn filter(
        &self,
        candidate: &JointState,
        previous: &JointState,
        limits: &JointLimits,
        dt: f64,
    ) -> TeleopResult<JointState> {
        let dof = limits.dof();
        candidate.ensure_dof(dof)?;
        previous.ensure_dof(dof)?;

        if !(dt > 0.0) {
            return Ok(previous.clone());
        }

        let alpha = self.alpha(dt);
        let values = candidate
            .iter()
            .zip(previous.iter())
            .zip(limits.iter())
            .map(|((&c, &p), limit)| {
                let max_step = limit.max_velocity * dt;
                let clamped = p + (c - p).clamp(-max_step, max_step);
                limit.clamp(p + alpha * (clamped - p))
            })
            .collect();

        Ok(JointState::new(values))
    }
}

impl Default for TrajectoryFilter {
    fn default() -> Self {
        Self::new(&FilterConfig::default())
    }
}

/// Per-joint velocity implied by moving from `previous` to `next` in `dt`.
pub fn joint_velocities(next: &JointState, previous: &JointState, dt: f64) -> Result<Vec<f64>, TeleopError> {
    next.ensure_dof(previous.dof())?;
    Ok(next.iter().zip(previous.iter()).map(|(n, p)| (n - p) / dt).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JointLimit;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn limits() -> JointLimits {
        JointLimits::new(vec![JointLimit::new(-1.0, 1.0, 2.0), JointLimit::new(-3.0, 3.0, 0.5)]).unwrap()
    }

    #[test]
    fn test_large_jump_is_velocity_clamped() {
        let filter = TrajectoryFilter::new(&FilterConfig { time_constant: 0.0 });
        let out = filter
            .filter(&JointState::new(vec![1.0, 2.0]), &JointState::zeros(2), &limits(), 0.01)
            .unwrap();
        assert_relative_eq!(out[0], 0.02, epsilon = 1e-12);
        assert_relative_eq!(out[1], 0.005, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_time_constant_passes_small_steps_through() {
        let filter = TrajectoryFilter::new(&FilterConfig { time_constant: 0.0 });
        let candidate = JointState::new(vec![0.01, -0.001]);
        let out = filter.filter(&candidate, &JointState::zeros(2), &limits(), 0.01).unwrap();
        assert_eq!(out, candidate);
    }

    #[test]
    fn test_ema_moves_part_way() {
        let filter = TrajectoryFilter::new(&FilterConfig { time_constant: 0.03 });
        let dt = 0.01;
        let out = filter
            .filter(&JointState::new(vec![0.01, 0.0]), &JointState::zeros(2), &limits(), dt)
            .unwrap();
        assert_relative_eq!(filter.alpha(dt), 0.25, epsilon = 1e-12);
        assert_relative_eq!(out[0], 0.0025, epsilon = 1e-12);
    }

    #[test]
    fn test_output_projected_into_limits() {
        let filter = TrajectoryFilter::new(&FilterConfig { time_constant: 0.0 });
        let out = filter
            .filter(&JointState::new(vec![5.0, 0.0]), &JointState::new(vec![0.999, 0.0]), &limits(), 0.01)
            .unwrap();
        assert_eq!(out[0], 1.0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let filter = TrajectoryFilter::default();
        let result = filter.filter(&JointState::zeros(3), &JointState::zeros(2), &limits(), 0.01);
        assert!(matches!(result, Err(TeleopError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_random_steps_never_exceed_velocity_limit() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let limits = limits();

        for _ in 0..500 {
            let filter = TrajectoryFilter::new(&FilterConfig { time_constant: rng.gen_range(0.0..0.2) });
            let dt = rng.gen_range(0.001..0.05);
            let previous = JointState::new(limits.iter().map(|l| rng.gen_range(l.min..l.max)).collect());
            let candidate = JointState::new((0..limits.dof()).map(|_| rng.gen_range(-10.0..10.0)).collect());

            let out = filter.filter(&candidate, &previous, &limits, dt).unwrap();
            let velocities = joint_velocities(&out, &previous, dt).unwrap();
            for (v, limit) in velocities.iter().zip(limits.iter()) {
                assert!(v.abs() <= limit.max_velocity + 1e-9, "{} > {}", v, limit.max_velocity);
            }
            assert!(limits.contains(&out));
        }
    }
}
