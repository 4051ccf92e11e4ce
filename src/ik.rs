//! Damped least-squares IK with explicit iteration state.
//!
//! Each [`IkIteration::step`] evaluates the residual at the current estimate,
//! checks the exit conditions and applies one velocity-bounded, limit-projected
//! DLS update. [`IkSolver::solve`] simply steps until an outcome is produced.

use std::sync::Arc;

use crate::config::IkConfig;
use crate::error::TeleopResult;
use crate::kinematics::KinematicChain;
use crate::types::{
    Iso3, JointLimits, JointState, Pose, TaskMatrix, TaskVector, Vec3, POSE_DIM, POSITION_DIM,
};

// ─── Result ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum IkResult {
    Converged { joints: JointState, residual: f64, iterations: u32 },
    /// `joints` is the best state found.
    NotConverged { joints: JointState, residual: f64, iterations: u32 },
    /// The task Jacobian stayed rank-deficient; callers should hold position.
    SingularityDetected { joints: JointState, residual: f64, min_singular_value: f64 },
}

impl IkResult {
    pub fn joints(&self) -> &JointState {
        match self {
            IkResult::Converged { joints, .. }
            | IkResult::NotConverged { joints, .. }
            | IkResult::SingularityDetected { joints, .. } => joints,
        }
    }

    pub fn residual(&self) -> f64 {
        match self {
            IkResult::Converged { residual, .. }
            | IkResult::NotConverged { residual, .. }
            | IkResult::SingularityDetected { residual, .. } => *residual,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, IkResult::Converged { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            IkResult::Converged { .. } => "converged",
            IkResult::NotConverged { .. } => "not_converged",
            IkResult::SingularityDetected { .. } => "singular",
        }
    }
}

// ─── Iteration state ─────────────────────────────────────────────────────────

/// Explicit solver state for one solve.
#[derive(Clone, Debug)]
pub struct IkIteration {
    pub q: JointState,
    pub iteration: u32,
    pub best_q: JointState,
    pub best_residual: f64,
    pub last_residual: f64,
    /// Iterations in a row with the smallest singular value below threshold.
    pub singular_streak: u32,
    pub last_min_singular_value: f64,
    /// Iterations since the best residual last improved meaningfully.
    pub stall_count: u32,
    stall_reference: f64,
}

impl IkIteration {
    /// Start from `seed` projected into `limits`.
    pub fn new(seed: &JointState, limits: &JointLimits) -> Self {
        let mut q = seed.clone();
        limits.project(&mut q);
        Self {
            best_q: q.clone(),
            q,
            iteration: 0,
            best_residual: f64::INFINITY,
            last_residual: f64::INFINITY,
            singular_streak: 0,
            last_min_singular_value: f64::INFINITY,
            stall_count: 0,
            stall_reference: f64::INFINITY,
        }
    }

    fn not_converged(&self) -> IkResult {
        IkResult::NotConverged {
            joints: self.best_q.clone(),
            residual: self.best_residual,
            iterations: self.iteration,
        }
    }

    /// Evaluate the residual at `q`, check exits, then apply one update.
    pub fn step(
        &mut self,
        chain: &KinematicChain,
        config: &IkConfig,
        target: &Pose,
        limits: &JointLimits,
        tick_period: f64,
    ) -> Option<IkResult> {
        let q = self.q.as_slice();
        let (origins, axes, ee) = chain.joint_frames(q);
        let error = task_error(&ee, target, config.orientation_weight);
        let residual = error.norm();
        self.last_residual = residual;

        if residual < self.best_residual {
            self.best_residual = residual;
            self.best_q = self.q.clone();
        }

        if residual < config.tolerance {
            return Some(IkResult::Converged {
                joints: self.q.clone(),
                residual,
                iterations: self.iteration,
            });
        }
        if self.iteration >= config.max_iterations {
            return Some(self.not_converged());
        }

        let jacobian = task_jacobian(chain, &origins, &axes, &ee, config.orientation_weight);

        let min_sv = jacobian
            .singular_values()
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        self.last_min_singular_value = min_sv;
        if min_sv < config.singular_value_threshold {
            self.singular_streak += 1;
        } else {
            self.singular_streak = 0;
        }
        if self.singular_streak >= config.singular_consecutive {
            return Some(IkResult::SingularityDetected {
                joints: self.best_q.clone(),
                residual: self.best_residual,
                min_singular_value: min_sv,
            });
        }

        if self.best_residual < self.stall_reference - config.stall_improvement {
            self.stall_reference = self.best_residual;
            self.stall_count = 0;
        } else {
            self.stall_count += 1;
            if self.stall_count >= config.stall_window {
                log::debug!(
                    "IK stalled at residual {:.5} after {} iterations",
                    self.best_residual,
                    self.iteration
                );
                return Some(self.not_converged());
            }
        }

        let mut dq = damped_update(&jacobian, &error, config.damping);
        let pinned = pinned_joints(&self.q, &dq, limits);
        if !pinned.is_empty() {
            // Re-solve without the saturated joints so the rest still make progress
            let mut free = jacobian;
            for &i in &pinned {
                free.column_mut(i).fill(0.0);
            }
            dq = damped_update(&free, &error, config.damping);
        }
        clamp_step(&mut dq, limits, tick_period);

        for (value, delta) in self.q.as_mut_slice().iter_mut().zip(dq.iter()) {
            *value += delta;
        }
        limits.project(&mut self.q);
        self.iteration += 1;
        None
    }
}

// ─── Solver ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct IkSolver {
    chain: Arc<KinematicChain>,
    config: IkConfig,
}

impl IkSolver {
    pub fn new(chain: Arc<KinematicChain>, config: IkConfig) -> Self {
        Self { chain, config }
    }

    pub fn chain(&self) -> &KinematicChain {
        &self.chain
    }

    pub fn config(&self) -> &IkConfig {
        &self.config
    }

    /// Solve for `target` starting from `seed` (the previous accepted state).
    ///
    /// Every iterate, and therefore every returned state, lies within `limits`.
    pub fn solve(
        &self,
        target: &Pose,
        seed: &JointState,
        limits: &JointLimits,
        tick_period: f64,
    ) -> TeleopResult<IkResult> {
        let dof = self.chain.dof();
        seed.ensure_dof(dof)?;
        if limits.dof() != dof {
            return Err(crate::error::TeleopError::DimensionMismatch { expected: dof, got: limits.dof() });
        }

        let mut state = IkIteration::new(seed, limits);
        loop {
            if let Some(result) = state.step(&self.chain, &self.config, target, limits, tick_period) {
                return Ok(result);
            }
        }
    }
}

// ─── Numerics ────────────────────────────────────────────────────────────────

/// [position error; w · axis-angle orientation error]. Position only when `w == 0`.
fn task_error(ee: &Iso3, target: &Pose, orientation_weight: f64) -> TaskVector {
    let pos_err: Vec3 = target.position - ee.translation.vector;
    if orientation_weight <= 0.0 {
        return TaskVector::from_column_slice(pos_err.as_slice());
    }

    let rot_err = (target.orientation * ee.rotation.inverse()).scaled_axis() * orientation_weight;
    let mut error = TaskVector::zeros(POSE_DIM);
    error.fixed_rows_mut::<3>(0).copy_from(&pos_err);
    error.fixed_rows_mut::<3>(3).copy_from(&rot_err);
    error
}

fn task_jacobian(
    chain: &KinematicChain,
    origins: &[Vec3],
    axes: &[Vec3],
    ee: &Iso3,
    orientation_weight: f64,
) -> TaskMatrix {
    let full = chain.jacobian_from_frames(origins, axes, ee);
    if orientation_weight <= 0.0 {
        full.rows(0, POSITION_DIM).into_owned()
    } else {
        let mut weighted = full;
        weighted.rows_mut(3, 3).scale_mut(orientation_weight);
        weighted
    }
}

/// Joints sitting on a limit whose update would push them further out.
fn pinned_joints(q: &JointState, dq: &TaskVector, limits: &JointLimits) -> Vec<usize> {
    q.iter()
        .zip(dq.iter())
        .zip(limits.iter())
        .enumerate()
        .filter(|(_, ((&value, &delta), limit))| {
            (value <= limit.min && delta < 0.0) || (value >= limit.max && delta > 0.0)
        })
        .map(|(i, _)| i)
        .collect()
}

/// dq = Jᵀ (J Jᵀ + λ² I)⁻¹ e
fn damped_update(jacobian: &TaskMatrix, error: &TaskVector, damping: f64) -> TaskVector {
    let m = jacobian.nrows();
    let damped = jacobian * jacobian.transpose() + TaskMatrix::identity(m, m) * (damping * damping);

    let weights = match damped.clone().cholesky() {
        Some(chol) => chol.solve(error),
        None => match damped.lu().solve(error) {
            Some(w) => w,
            // No usable update; leave the estimate where it is
            None => return TaskVector::zeros(jacobian.ncols()),
        },
    };
    jacobian.transpose() * weights
}

/// Uniformly shrink `dq` so no joint moves faster than its velocity limit.
fn clamp_step(dq: &mut TaskVector, limits: &JointLimits, tick_period: f64) {
    let mut scale: f64 = 1.0;
    for (delta, limit) in dq.iter().zip(limits.iter()) {
        let max_step = limit.max_velocity * tick_period;
        if delta.abs() > max_step {
            scale = scale.min(max_step / delta.abs());
        }
    }
    if scale < 1.0 {
        *dq *= scale;
    }
}
