//! Fixed-period teleop control loop.
//!
//! ```text
//! Idle ─► Calibrating ─► Running ─► Paused ──► Running
//!              ▲            │  ▲        │
//!              └────────────┤  └─ Faulted ◄┘   (any) ─► Stopped
//! ```
//!
//! Each tick runs pose read → retarget → IK → filter → dispatch. A tick is
//! all-or-nothing: when any stage fails, the last commanded joint state is
//! re-sent instead and nothing from the failed stage reaches the backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backend::RobotBackend;
use crate::calibration::{CalibrationHandle, CalibrationPair, CalibrationTransform, CalibrationTranscript, Calibrator};
use crate::config::{ControlConfig, TeleopConfig};
use crate::error::{BackendError, TeleopError, TeleopResult};
use crate::health_monitor::{HealthMonitor, HealthReport};
use crate::ik::{IkResult, IkSolver};
use crate::kinematics::KinematicChain;
use crate::recovery::RecoveryGate;
use crate::retarget::Retargeter;
use crate::source::PoseSource;
use crate::trajectory::TrajectoryFilter;
use crate::types::{JointLimits, JointState, Pose, PoseSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Calibrating,
    Running,
    /// Holding the last command while IK is unreliable; solving continues.
    Paused,
    /// Holding position until an operator resume passes a health check.
    Faulted,
    /// Terminal; backend released.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LoopEvent {
    StateChanged { from: LoopState, to: LoopState, reason: String },
    PoseReused { streak: u32 },
    WorkspaceClamped { excess: f64 },
    IkNotConverged { residual: f64, streak: u32 },
    IkSingular { min_singular_value: f64 },
    MissedDeadline { streak: u32 },
    BackendFault(String),
}

/// Outcome of one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub state: LoopState,
    pub events: Vec<LoopEvent>,
    /// Joint state the backend accepted this tick, if any.
    pub dispatched: Option<JointState>,
}

impl TickReport {
    pub fn entered(&self, state: LoopState) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, LoopEvent::StateChanged { to, .. } if *to == state))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub held: u64,
    pub pose_reused: u64,
    pub boundary_clamps: u64,
    pub ik_converged: u64,
    pub ik_not_converged: u64,
    pub ik_singular: u64,
    pub missed_deadlines: u64,
    pub overruns: u64,
    pub faults: u64,
}

/// Point-in-time view of the loop for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LoopSnapshot {
    pub state: LoopState,
    pub stats: LoopStats,
    pub calibration_version: u64,
    pub calibration_rms_error: f64,
    pub commanded: Option<Vec<f64>>,
    pub last_residual: Option<f64>,
    pub health: HealthReport,
    pub recovery: String,
    pub fault_reason: Option<String>,
}

pub struct ControlLoop<S: PoseSource, B: RobotBackend> {
    state: LoopState,
    source: S,
    backend: B,
    calibration: CalibrationHandle,
    calibrator: Calibrator,
    retargeter: Retargeter,
    solver: IkSolver,
    filter: TrajectoryFilter,
    limits: Arc<JointLimits>,
    config: ControlConfig,
    tick_period: f64,
    health: HealthMonitor,
    recovery: RecoveryGate,
    last_pose: Option<PoseSample>,
    /// Last state the backend accepted; held on every failure path and used as the IK seed.
    commanded: Option<JointState>,
    paused_converged: u32,
    last_residual: Option<f64>,
    events: Vec<LoopEvent>,
    stats: LoopStats,
}

impl<S: PoseSource, B: RobotBackend> ControlLoop<S, B> {
    pub fn new(config: &TeleopConfig, source: S, backend: B, calibration: CalibrationHandle) -> TeleopResult<Self> {
        config.validate()?;
        let chain = Arc::new(KinematicChain::from_config(&config.robot)?);
        let limits = Arc::new(config.robot.joint_limits()?);
        let control = config.control.clone();

        Ok(Self {
            state: LoopState::Idle,
            source,
            backend,
            calibration,
            calibrator: Calibrator::new(&config.calibration),
            retargeter: Retargeter::new(&config.retarget),
            solver: IkSolver::new(chain, config.ik.clone()),
            filter: TrajectoryFilter::new(&config.filter),
            limits,
            tick_period: control.period().as_secs_f64(),
            health: HealthMonitor::new(&control),
            recovery: RecoveryGate::new(
                control.resume_cooldown(),
                control.max_resume_cooldown(),
                control.max_resume_attempts,
            ),
            config: control,
            last_pose: None,
            commanded: None,
            paused_converged: 0,
            last_residual: None,
            events: Vec::new(),
            stats: LoopStats::default(),
        })
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn commanded(&self) -> Option<&JointState> {
        self.commanded.as_ref()
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn calibration(&self) -> &CalibrationHandle {
        &self.calibration
    }

    pub fn snapshot(&self, now: Instant) -> LoopSnapshot {
        let calibration = self.calibration.load();
        LoopSnapshot {
            state: self.state,
            stats: self.stats.clone(),
            calibration_version: calibration.version,
            calibration_rms_error: calibration.rms_error,
            commanded: self.commanded.as_ref().map(|q| q.as_slice().to_vec()),
            last_residual: self.last_residual,
            health: self.health.check_health(now),
            recovery: self.recovery.status(now),
            fault_reason: self.recovery.reason().map(str::to_string),
        }
    }

    // ─── Operator transitions ────────────────────────────────────────────────

    /// Start (or restart) a calibration session. The robot holds position meanwhile.
    pub fn begin_calibration(&mut self) -> TeleopResult<()> {
        match self.state {
            LoopState::Idle | LoopState::Running | LoopState::Paused => {
                self.calibrator.reset();
                self.transition(LoopState::Calibrating, "calibration requested", Instant::now());
                Ok(())
            }
            state => Err(TeleopError::InvalidTransition { state, action: "begin_calibration" }),
        }
    }

    pub fn next_calibration_reference(&self) -> Option<Pose> {
        self.calibrator.next_reference()
    }

    /// Pair `operator` with the current guided reference point.
    pub fn record_guided_sample(&mut self, operator: Pose) -> TeleopResult<CalibrationPair> {
        self.require(LoopState::Calibrating, "record_guided_sample")?;
        self.calibrator.record(operator).ok_or_else(|| {
            TeleopError::Config(crate::error::ConfigError::Invalid(
                "no calibration reference points configured".to_string(),
            ))
        })
    }

    pub fn record_calibration_pair(&mut self, operator: Pose, reference: Pose) -> TeleopResult<()> {
        self.require(LoopState::Calibrating, "record_calibration_pair")?;
        self.calibrator.record_pair(CalibrationPair::new(operator, reference));
        Ok(())
    }

    /// Fit and publish the calibration, then start running.
    ///
    /// On a calibration error the loop stays in `Calibrating` with its samples
    /// so the operator can add more.
    pub fn finish_calibration(&mut self) -> TeleopResult<Arc<CalibrationTransform>> {
        self.require(LoopState::Calibrating, "finish_calibration")?;
        let transform = self.calibrator.fit()?;

        // Seed before publishing so a backend failure leaves the old calibration live
        if self.commanded.is_none() {
            let mut seed = self.backend.current_joint_state()?;
            seed.ensure_dof(self.limits.dof())?;
            self.limits.project(&mut seed);
            log::info!("Seeding IK from measured joint state {:?}", seed.as_slice());
            self.commanded = Some(seed);
        }

        let transform = self.calibration.publish(transform);
        self.last_pose = None;
        self.health.reset_streaks();
        self.transition(LoopState::Running, "calibration accepted", Instant::now());
        Ok(transform)
    }

    /// Replay a recorded session through a fresh calibration.
    pub fn calibrate_from_transcript(&mut self, transcript: &CalibrationTranscript) -> TeleopResult<Arc<CalibrationTransform>> {
        self.begin_calibration()?;
        for pair in &transcript.pairs {
            self.record_calibration_pair(pair.operator, pair.reference)?;
        }
        self.finish_calibration()
    }

    /// Operator resume. From `Paused` this always succeeds; from `Faulted`
    /// the backend must pass a health check and the retry cooldown must have
    /// elapsed.
    pub fn resume(&mut self, now: Instant) -> TeleopResult<()> {
        match self.state {
            LoopState::Paused => {
                self.health.ik_not_converged.reset_streak();
                self.transition(LoopState::Running, "operator resume", now);
                Ok(())
            }
            LoopState::Faulted => self.resume_from_fault(now),
            state => Err(TeleopError::InvalidTransition { state, action: "resume" }),
        }
    }

    fn resume_from_fault(&mut self, now: Instant) -> TeleopResult<()> {
        if !self.recovery.can_retry(now) {
            return Err(TeleopError::ResumeRefused(self.recovery.status(now)));
        }
        if let Err(e) = self.backend.health_check() {
            self.recovery.record_failed_attempt(now);
            return Err(TeleopError::ResumeRefused(format!("health check failed: {e}")));
        }

        // The robot may have drifted while faulted; continue from where it is
        match self.backend.current_joint_state() {
            Ok(mut measured) if measured.dof() == self.limits.dof() => {
                self.limits.project(&mut measured);
                self.commanded = Some(measured);
            }
            Ok(_) | Err(_) => log::warn!("Resuming without fresh joint feedback; seeding from last command"),
        }

        self.recovery.record_success(now);
        self.health.reset_streaks();
        self.paused_converged = 0;
        self.last_pose = None;
        self.transition(LoopState::Running, "operator resume after health check", now);
        Ok(())
    }

    /// Terminal shutdown. Releases the backend.
    pub fn stop(&mut self) {
        if self.state != LoopState::Stopped {
            self.transition(LoopState::Stopped, "shutdown requested", Instant::now());
            self.backend.shutdown();
        }
    }

    // ─── Tick ────────────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: Instant) -> TickReport {
        self.stats.ticks += 1;
        let dispatched = match self.state {
            LoopState::Idle | LoopState::Stopped => None,
            LoopState::Calibrating | LoopState::Faulted => self.hold(now),
            LoopState::Running | LoopState::Paused => self.step(now),
        };
        TickReport {
            state: self.state,
            events: std::mem::take(&mut self.events),
            dispatched,
        }
    }

    fn step(&mut self, now: Instant) -> Option<JointState> {
        let Some(seed) = self.commanded.clone() else {
            self.transition(LoopState::Faulted, "no joint state to seed IK", now);
            return None;
        };

        let pose = match self.source.read(self.config.pose_timeout()) {
            Ok(sample) => {
                self.health.pose.record_ok(now);
                self.last_pose = Some(sample);
                sample.pose
            }
            Err(err) => {
                let streak = self.health.pose.record_failure();
                if self.health.pose.exceeded() {
                    let reason = format!("pose data lost ({err}) for {streak} ticks");
                    self.transition(LoopState::Faulted, &reason, now);
                    return self.hold(now);
                }
                match self.last_pose {
                    Some(last) => {
                        log::debug!("Pose read failed ({}); reusing previous pose ({} in a row)", err, streak);
                        self.stats.pose_reused += 1;
                        self.events.push(LoopEvent::PoseReused { streak });
                        last.pose
                    }
                    None => return self.hold(now),
                }
            }
        };

        let calibration = self.calibration.load();
        let target = self.retargeter.retarget(&pose, &calibration);
        if let Some(clamp) = target.clamp {
            self.stats.boundary_clamps += 1;
            self.events.push(LoopEvent::WorkspaceClamped { excess: clamp.excess() });
        }

        let result = match self.solver.solve(&target.pose, &seed, &self.limits, self.tick_period) {
            Ok(result) => result,
            Err(e) => {
                self.transition(LoopState::Faulted, &format!("IK rejected its inputs: {e}"), now);
                return self.hold(now);
            }
        };
        self.last_residual = Some(result.residual());

        let Some(candidate) = self.assess(result, now) else {
            return self.hold(now);
        };

        match self.filter.filter(&candidate, &seed, &self.limits, self.tick_period) {
            Ok(filtered) => self.send(filtered, now),
            Err(e) => {
                self.transition(LoopState::Faulted, &format!("trajectory filter: {e}"), now);
                self.hold(now)
            }
        }
    }

    /// Update IK streaks and decide whether the solution may be dispatched.
    fn assess(&mut self, result: IkResult, now: Instant) -> Option<JointState> {
        match result {
            IkResult::Converged { joints, .. } => {
                self.stats.ik_converged += 1;
                self.health.ik_not_converged.record_ok(now);
                self.health.ik_failures.record_ok(now);
                if self.state == LoopState::Paused {
                    self.paused_converged += 1;
                    if self.paused_converged < self.config.resume_after_converged {
                        return None;
                    }
                    self.transition(LoopState::Running, "IK converging again", now);
                }
                Some(joints)
            }
            IkResult::NotConverged { joints, residual, .. } => {
                self.stats.ik_not_converged += 1;
                self.paused_converged = 0;
                let streak = self.health.ik_not_converged.record_failure();
                self.health.ik_failures.record_failure();
                self.events.push(LoopEvent::IkNotConverged { residual, streak });

                if self.health.ik_failures.exceeded() {
                    let reason = format!("IK failing for {} ticks", self.health.ik_failures.streak());
                    self.transition(LoopState::Faulted, &reason, now);
                    return None;
                }
                if self.state == LoopState::Paused {
                    return None;
                }
                if self.health.ik_not_converged.exceeded() {
                    let reason = format!("IK not converged {streak} ticks in a row (residual {residual:.4})");
                    self.transition(LoopState::Paused, &reason, now);
                    return None;
                }
                // Best effort below the pause threshold
                Some(joints)
            }
            IkResult::SingularityDetected { min_singular_value, .. } => {
                self.stats.ik_singular += 1;
                self.paused_converged = 0;
                self.health.ik_failures.record_failure();
                self.events.push(LoopEvent::IkSingular { min_singular_value });

                if self.health.ik_failures.exceeded() {
                    let reason = format!("IK failing for {} ticks", self.health.ik_failures.streak());
                    self.transition(LoopState::Faulted, &reason, now);
                } else if self.state == LoopState::Running {
                    let reason = format!("kinematic singularity (σmin {min_singular_value:.2e})");
                    self.transition(LoopState::Paused, &reason, now);
                }
                None
            }
        }
    }

    /// Re-send the last commanded state.
    fn hold(&mut self, now: Instant) -> Option<JointState> {
        let held = self.commanded.clone()?;
        self.stats.held += 1;
        self.send(held, now)
    }

    fn send(&mut self, target: JointState, now: Instant) -> Option<JointState> {
        match self.backend.dispatch(&target, self.config.dispatch_timeout()) {
            Ok(_) => {
                self.health.deadlines.record_ok(now);
                self.stats.dispatched += 1;
                self.commanded = Some(target.clone());
                Some(target)
            }
            Err(BackendError::Timeout) => {
                self.stats.missed_deadlines += 1;
                let streak = self.health.deadlines.record_failure();
                self.events.push(LoopEvent::MissedDeadline { streak });
                log::warn!("Dispatch missed its deadline ({} in a row)", streak);
                if self.health.deadlines.exceeded() && self.is_active() {
                    self.transition(LoopState::Faulted, &format!("{streak} consecutive missed dispatch deadlines"), now);
                }
                None
            }
            Err(e) => {
                if self.is_active() {
                    self.events.push(LoopEvent::BackendFault(e.to_string()));
                    self.transition(LoopState::Faulted, &format!("backend: {e}"), now);
                } else {
                    log::debug!("Hold dispatch failed in {:?}: {}", self.state, e);
                }
                None
            }
        }
    }

    fn is_active(&self) -> bool {
        matches!(self.state, LoopState::Running | LoopState::Paused)
    }

    fn require(&self, state: LoopState, action: &'static str) -> TeleopResult<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(TeleopError::InvalidTransition { state: self.state, action })
        }
    }

    fn transition(&mut self, to: LoopState, reason: &str, now: Instant) {
        let from = self.state;
        if from == to {
            return;
        }
        match to {
            LoopState::Faulted => {
                log::error!("[LOOP] {:?} → Faulted: {}", from, reason);
                self.stats.faults += 1;
                self.recovery.signal_fault(reason, now);
                // A pose from before the fault must never drive the arm again
                self.last_pose = None;
            }
            LoopState::Paused => {
                log::warn!("[LOOP] {:?} → Paused: {}", from, reason);
                self.paused_converged = 0;
            }
            _ => log::info!("[LOOP] {:?} → {:?}: {}", from, to, reason),
        }
        self.state = to;
        self.events.push(LoopEvent::StateChanged { from, to, reason: reason.to_string() });
    }

    // ─── Driver ──────────────────────────────────────────────────────────────

    /// Run at the configured rate until `stop` is set or the loop stops,
    /// then shut down. `observer` sees every tick on the control thread.
    pub fn run<F>(&mut self, stop: Arc<AtomicBool>, mut observer: F) -> LoopStats
    where
        F: FnMut(&Self, &TickReport),
    {
        let period = self.config.period();
        let mut deadline = Instant::now();
        log::info!("[LOOP] Control loop running at {:.0} Hz", self.config.rate_hz);

        while !stop.load(Ordering::Relaxed) && self.state != LoopState::Stopped {
            let report = self.tick(Instant::now());
            observer(self, &report);

            deadline += period;
            let now = Instant::now();
            if now > deadline {
                self.stats.overruns += 1;
                log::debug!("[LOOP] Tick overran by {:.2} ms", (now - deadline).as_secs_f64() * 1000.0);
                deadline = now;
            } else {
                thread::sleep(deadline - now);
            }
        }

        self.stop();
        log::info!(
            "[LOOP] Stopped after {} ticks ({} dispatched, {} missed deadlines, {} overruns)",
            self.stats.ticks,
            self.stats.dispatched,
            self.stats.missed_deadlines,
            self.stats.overruns
        );
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::error::SourceError;
    use crate::kinematics::tests::three_dof_arm;
    use crate::source::ScriptedPoseSource;
    use crate::types::Vec3;
    use std::time::Duration;

    fn config() -> TeleopConfig {
        let mut config = TeleopConfig::default();
        config.robot = three_dof_arm();
        config.control.rate_hz = 20.0;
        config
    }

    fn make_loop(config: &TeleopConfig, source: ScriptedPoseSource) -> ControlLoop<ScriptedPoseSource, SimulatedBackend> {
        let limits = Arc::new(config.robot.joint_limits().unwrap());
        let backend = SimulatedBackend::new(JointState::new(vec![0.0, 0.5, 0.5]), limits, config.control.period());
        ControlLoop::new(config, source, backend, CalibrationHandle::default()).unwrap()
    }

    fn identity_transcript() -> CalibrationTranscript {
        let points = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        CalibrationTranscript {
            pairs: points
                .iter()
                .map(|p| {
                    let pose = Pose::from_position(Vec3::new(p[0], p[1], p[2]));
                    CalibrationPair::new(pose, pose)
                })
                .collect(),
        }
    }

    #[test]
    fn test_tick_before_calibration_does_nothing() {
        let mut control = make_loop(&config(), ScriptedPoseSource::default());
        let report = control.tick(Instant::now());
        assert_eq!(report.state, LoopState::Idle);
        assert!(report.dispatched.is_none());
        assert_eq!(control.backend().dispatch_count(), 0);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut control = make_loop(&config(), ScriptedPoseSource::default());
        assert!(matches!(
            control.finish_calibration(),
            Err(TeleopError::InvalidTransition { state: LoopState::Idle, .. })
        ));
        assert!(control.resume(Instant::now()).is_err());
        control.stop();
        assert!(control.begin_calibration().is_err());
    }

    #[test]
    fn test_calibration_failure_stays_calibrating() {
        let mut control = make_loop(&config(), ScriptedPoseSource::default());
        control.begin_calibration().unwrap();
        let p = Pose::from_position(Vec3::new(0.1, 0.0, 0.0));
        control.record_calibration_pair(p, p).unwrap();
        assert!(matches!(control.finish_calibration(), Err(TeleopError::Calibration(_))));
        assert_eq!(control.state(), LoopState::Calibrating);
    }

    #[test]
    fn test_calibration_seeds_from_backend_and_runs() {
        let mut control = make_loop(&config(), ScriptedPoseSource::default());
        let transform = control.calibrate_from_transcript(&identity_transcript()).unwrap();
        assert!(transform.is_identity(1e-6));
        assert_eq!(transform.version, 1);
        assert_eq!(control.state(), LoopState::Running);
        assert_eq!(control.commanded(), Some(&JointState::new(vec![0.0, 0.5, 0.5])));
    }

    #[test]
    fn test_running_tick_dispatches_bounded_step() {
        let cfg = config();
        let target = Pose::from_position(Vec3::new(0.3, 0.1, 0.35));
        let source = ScriptedPoseSource::from_samples([PoseSample::new(0.0, target)]);
        let mut control = make_loop(&cfg, source);
        control.calibrate_from_transcript(&identity_transcript()).unwrap();
        let before = control.commanded().unwrap().clone();

        let report = control.tick(Instant::now());
        let sent = report.dispatched.unwrap();
        let dt = cfg.control.period().as_secs_f64();
        for (i, limit) in control.limits().iter().enumerate() {
            assert!((sent[i] - before[i]).abs() <= limit.max_velocity * dt + 1e-9);
        }
        assert_eq!(report.state, LoopState::Running);
    }

    #[test]
    fn test_backend_fault_then_resume_via_health_check() {
        let source = ScriptedPoseSource::new(
            (0..10).map(|i| Ok(PoseSample::new(i as f64, Pose::from_position(Vec3::new(0.3, 0.0, 0.35))))),
        );
        let mut control = make_loop(&config(), source);
        control.calibrate_from_transcript(&identity_transcript()).unwrap();
        control.tick(Instant::now());

        control.backend_mut().inject_fault("encoder lost");
        let report = control.tick(Instant::now());
        assert_eq!(report.state, LoopState::Faulted);
        assert!(report.events.iter().any(|e| matches!(e, LoopEvent::BackendFault(_))));

        // Still faulted: health check fails and the gate backs off
        let t0 = Instant::now();
        assert!(matches!(control.resume(t0), Err(TeleopError::ResumeRefused(_))));
        assert!(matches!(control.resume(t0), Err(TeleopError::ResumeRefused(_))));

        control.backend_mut().clear_fault();
        let later = t0 + Duration::from_secs(1);
        control.resume(later).unwrap();
        assert_eq!(control.state(), LoopState::Running);
    }

    #[test]
    fn test_missed_deadlines_escalate_to_fault() {
        let mut cfg = config();
        cfg.control.max_missed_deadlines = 2;
        let source = ScriptedPoseSource::new(
            (0..10).map(|i| Ok(PoseSample::new(i as f64, Pose::from_position(Vec3::new(0.3, 0.0, 0.35))))),
        );
        let mut control = make_loop(&cfg, source);
        control.calibrate_from_transcript(&identity_transcript()).unwrap();
        control.backend_mut().inject_timeouts(3);

        assert_eq!(control.tick(Instant::now()).state, LoopState::Running);
        assert_eq!(control.tick(Instant::now()).state, LoopState::Running);
        let report = control.tick(Instant::now());
        assert!(report.entered(LoopState::Faulted));
        assert_eq!(control.stats().missed_deadlines, 3);
    }

    #[test]
    fn test_rejected_samples_count_as_dropouts() {
        let mut cfg = config();
        cfg.control.max_pose_reuse = 1;
        let source = ScriptedPoseSource::new([
            Ok(PoseSample::new(0.0, Pose::from_position(Vec3::new(0.3, 0.0, 0.35)))),
            Err(SourceError::Rejected("bad frame".to_string())),
            Err(SourceError::Disconnected),
        ]);
        let mut control = make_loop(&cfg, source);
        control.calibrate_from_transcript(&identity_transcript()).unwrap();
        control.tick(Instant::now());
        assert_eq!(control.tick(Instant::now()).state, LoopState::Running);
        assert_eq!(control.tick(Instant::now()).state, LoopState::Faulted);
    }

    #[test]
    fn test_stop_is_terminal_and_releases_backend() {
        let mut control = make_loop(&config(), ScriptedPoseSource::default());
        control.calibrate_from_transcript(&identity_transcript()).unwrap();
        control.stop();
        assert_eq!(control.state(), LoopState::Stopped);
        assert!(control.backend_mut().health_check().is_err());
        assert!(control.tick(Instant::now()).dispatched.is_none());
    }

    #[test]
    fn test_run_exits_on_stop_flag() {
        let mut cfg = config();
        cfg.control.rate_hz = 200.0;
        let mut control = make_loop(&cfg, ScriptedPoseSource::default());
        control.calibrate_from_transcript(&identity_transcript()).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let mut seen = 0;
        let stats = control.run(stop, |_, _| {
            seen += 1;
            if seen == 5 {
                flag.store(true, Ordering::Relaxed);
            }
        });
        assert_eq!(stats.ticks, 5);
        assert_eq!(control.state(), LoopState::Stopped);
    }

    #[test]
    fn test_seed_failure_leaves_calibration_unpublished() {
        let mut control = make_loop(&config(), ScriptedPoseSource::default());
        control.backend_mut().shutdown();

        let result = control.calibrate_from_transcript(&identity_transcript());
        assert!(matches!(result, Err(TeleopError::Backend(_))));
        assert_eq!(control.state(), LoopState::Calibrating);
        assert_eq!(control.calibration().version(), 0);
        assert!(control.commanded().is_none());
    }
}
