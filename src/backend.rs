//! Robot backend boundary: the simulator and the hardware driver share one interface.
//!
//! The backend is chosen once at startup ([`Backend`]); the control loop is
//! generic over [`RobotBackend`] and never switches per tick.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};

use crate::error::BackendError;
use crate::handoff::{latest_value, SlotReader, SlotWriter};
use crate::types::{JointLimits, JointState};

/// Dispatch receipt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ack {
    pub sequence: u64,
    /// Time spent handing the command over.
    pub latency: Duration,
}

pub trait RobotBackend {
    /// Hand `target` to the robot, waiting at most `timeout`.
    fn dispatch(&mut self, target: &JointState, timeout: Duration) -> Result<Ack, BackendError>;

    /// Measured joint state; seeds IK when nothing has been commanded yet.
    fn current_joint_state(&mut self) -> Result<JointState, BackendError>;

    fn health_check(&mut self) -> Result<(), BackendError>;

    /// Release backend resources. Further dispatches fail with `Disconnected`.
    fn shutdown(&mut self);

    fn name(&self) -> &'static str;
}

// ─── Simulation ──────────────────────────────────────────────────────────────

/// First-order joint tracking: each dispatch moves every joint toward its
/// target by at most `max_velocity · step`.
pub struct SimulatedBackend {
    state: JointState,
    limits: Arc<JointLimits>,
    step: f64,
    sequence: u64,
    last_command: Option<JointState>,
    faulted: Option<String>,
    pending_fault: Option<String>,
    pending_timeouts: u32,
    shut_down: bool,
}

impl SimulatedBackend {
    pub fn new(initial: JointState, limits: Arc<JointLimits>, step: Duration) -> Self {
        let mut state = initial;
        limits.project(&mut state);
        Self {
            state,
            limits,
            step: step.as_secs_f64(),
            sequence: 0,
            last_command: None,
            faulted: None,
            pending_fault: None,
            pending_timeouts: 0,
            shut_down: false,
        }
    }

    /// Next dispatch reports `message` as a hardware fault; the backend stays
    /// faulted until [`Self::clear_fault`].
    pub fn inject_fault(&mut self, message: &str) {
        self.pending_fault = Some(message.to_string());
    }

    /// The next `count` dispatches time out.
    pub fn inject_timeouts(&mut self, count: u32) {
        self.pending_timeouts = count;
    }

    pub fn clear_fault(&mut self) {
        if let Some(msg) = self.faulted.take() {
            log::info!("[sim] Fault cleared: {}", msg);
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    pub fn last_command(&self) -> Option<&JointState> {
        self.last_command.as_ref()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> &JointState {
        &self.state
    }
}

impl RobotBackend for SimulatedBackend {
    fn dispatch(&mut self, target: &JointState, _timeout: Duration) -> Result<Ack, BackendError> {
        let started = Instant::now();
        if self.shut_down {
            return Err(BackendError::Disconnected);
        }
        if self.pending_timeouts > 0 {
            self.pending_timeouts -= 1;
            return Err(BackendError::Timeout);
        }
        if let Some(msg) = self.pending_fault.take() {
            log::warn!("[sim] Injected fault: {}", msg);
            self.faulted = Some(msg);
        }
        if let Some(msg) = &self.faulted {
            return Err(BackendError::Fault(msg.clone()));
        }
        if target.dof() != self.state.dof() {
            return Err(BackendError::Fault(format!(
                "command has {} joints, robot has {}",
                target.dof(),
                self.state.dof()
            )));
        }

        for ((q, &goal), limit) in self
            .state
            .as_mut_slice()
            .iter_mut()
            .zip(target.iter())
            .zip(self.limits.iter())
        {
            let max_step = limit.max_velocity * self.step;
            *q = limit.clamp(*q + (goal - *q).clamp(-max_step, max_step));
        }

        self.sequence += 1;
        self.last_command = Some(target.clone());
        Ok(Ack { sequence: self.sequence, latency: started.elapsed() })
    }

    fn current_joint_state(&mut self) -> Result<JointState, BackendError> {
        if self.shut_down {
            return Err(BackendError::Disconnected);
        }
        Ok(self.state.clone())
    }

    fn health_check(&mut self) -> Result<(), BackendError> {
        if self.shut_down {
            return Err(BackendError::Disconnected);
        }
        match &self.faulted {
            Some(msg) => Err(BackendError::Fault(msg.clone())),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) {
        if !self.shut_down {
            log::info!("[sim] Shut down after {} dispatches", self.sequence);
            self.shut_down = true;
        }
    }

    fn name(&self) -> &'static str {
        "simulation"
    }
}

// ─── Hardware ────────────────────────────────────────────────────────────────

/// Actuator driver. Runs on the backend's I/O thread and may block.
pub trait JointDriver: Send {
    fn write(&mut self, target: &JointState) -> Result<(), BackendError>;
    fn read(&mut self) -> Result<JointState, BackendError>;
    fn ping(&mut self) -> Result<(), BackendError>;
}

impl<D: JointDriver + ?Sized> JointDriver for Box<D> {
    fn write(&mut self, target: &JointState) -> Result<(), BackendError> {
        (**self).write(target)
    }

    fn read(&mut self) -> Result<JointState, BackendError> {
        (**self).read()
    }

    fn ping(&mut self) -> Result<(), BackendError> {
        (**self).ping()
    }
}

enum Query {
    Read(Sender<Result<JointState, BackendError>>),
    Ping(Sender<Result<(), BackendError>>),
}

/// Backend over a [`JointDriver`] running on its own thread.
///
/// Commands go through a one-deep queue with a bounded send, so a slow driver
/// turns into missed deadlines on the control thread instead of a stall.
pub struct HardwareBackend {
    commands: Option<Sender<JointState>>,
    queries: Option<Sender<Query>>,
    faults: Receiver<BackendError>,
    feedback: SlotReader<JointState>,
    last_feedback: Option<JointState>,
    query_timeout: Duration,
    sequence: u64,
    worker: Option<JoinHandle<()>>,
}

impl HardwareBackend {
    pub fn spawn<D: JointDriver + 'static>(driver: D, query_timeout: Duration) -> Result<Self, BackendError> {
        let (cmd_tx, cmd_rx) = channel::bounded::<JointState>(1);
        let (query_tx, query_rx) = channel::bounded::<Query>(4);
        let (fault_tx, fault_rx) = channel::bounded::<BackendError>(16);
        let (feedback_tx, feedback_rx) = latest_value();

        let worker = thread::Builder::new()
            .name("joint-driver".to_string())
            .spawn(move || driver_loop(driver, cmd_rx, query_rx, fault_tx, feedback_tx))
            .map_err(|e| BackendError::Fault(format!("failed to start driver thread: {e}")))?;

        Ok(Self {
            commands: Some(cmd_tx),
            queries: Some(query_tx),
            faults: fault_rx,
            feedback: feedback_rx,
            last_feedback: None,
            query_timeout,
            sequence: 0,
            worker: Some(worker),
        })
    }

    fn query<T>(&self, make: impl FnOnce(Sender<Result<T, BackendError>>) -> Query) -> Result<T, BackendError> {
        let queries = self.queries.as_ref().ok_or(BackendError::Disconnected)?;
        let (reply_tx, reply_rx) = channel::bounded(1);
        queries
            .send_timeout(make(reply_tx), self.query_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => BackendError::Timeout,
                SendTimeoutError::Disconnected(_) => BackendError::Disconnected,
            })?;
        reply_rx.recv_timeout(self.query_timeout).map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Disconnected
            }
        })?
    }
}

fn driver_loop<D: JointDriver>(
    mut driver: D,
    commands: Receiver<JointState>,
    queries: Receiver<Query>,
    faults: Sender<BackendError>,
    feedback: SlotWriter<JointState>,
) {
    enum Event {
        Command(JointState),
        Query(Query),
    }

    loop {
        let event = channel::select! {
            recv(commands) -> msg => msg.map(Event::Command),
            recv(queries) -> msg => msg.map(Event::Query),
        };

        match event {
            Ok(Event::Command(target)) => match driver.write(&target) {
                Ok(()) => match driver.read() {
                    Ok(state) => {
                        feedback.publish(state);
                    }
                    Err(e) => log::warn!("[driver] Feedback read failed: {}", e),
                },
                Err(e) => {
                    log::error!("[driver] Write failed: {}", e);
                    let _ = faults.try_send(e);
                }
            },
            Ok(Event::Query(Query::Read(reply))) => {
                let _ = reply.send(driver.read());
            }
            Ok(Event::Query(Query::Ping(reply))) => {
                let _ = reply.send(driver.ping());
            }
            // Either sender dropped: the backend is shutting down
            Err(_) => break,
        }
    }
    log::info!("[driver] I/O thread exiting");
}

impl RobotBackend for HardwareBackend {
    fn dispatch(&mut self, target: &JointState, timeout: Duration) -> Result<Ack, BackendError> {
        if let Ok(fault) = self.faults.try_recv() {
            return Err(fault);
        }
        let commands = self.commands.as_ref().ok_or(BackendError::Disconnected)?;
        let started = Instant::now();
        commands.send_timeout(target.clone(), timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => BackendError::Timeout,
            SendTimeoutError::Disconnected(_) => BackendError::Disconnected,
        })?;
        self.sequence += 1;
        Ok(Ack { sequence: self.sequence, latency: started.elapsed() })
    }

    fn current_joint_state(&mut self) -> Result<JointState, BackendError> {
        if let Ok(Some(state)) = self.feedback.try_latest() {
            self.last_feedback = Some(state);
        }
        match &self.last_feedback {
            Some(state) => Ok(state.clone()),
            None => self.query(Query::Read),
        }
    }

    fn health_check(&mut self) -> Result<(), BackendError> {
        // Drain faults reported since the last dispatch
        while self.faults.try_recv().is_ok() {}
        self.query(Query::Ping)
    }

    fn shutdown(&mut self) {
        self.commands.take();
        self.queries.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[driver] I/O thread panicked");
            }
            log::info!("[hardware] Shut down after {} dispatches", self.sequence);
        }
    }

    fn name(&self) -> &'static str {
        "hardware"
    }
}

impl Drop for HardwareBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Startup selection ───────────────────────────────────────────────────────

/// Backend picked once at startup.
pub enum Backend {
    Simulation(SimulatedBackend),
    Hardware(HardwareBackend),
}

impl RobotBackend for Backend {
    fn dispatch(&mut self, target: &JointState, timeout: Duration) -> Result<Ack, BackendError> {
        match self {
            Backend::Simulation(b) => b.dispatch(target, timeout),
            Backend::Hardware(b) => b.dispatch(target, timeout),
        }
    }

    fn current_joint_state(&mut self) -> Result<JointState, BackendError> {
        match self {
            Backend::Simulation(b) => b.current_joint_state(),
            Backend::Hardware(b) => b.current_joint_state(),
        }
    }

    fn health_check(&mut self) -> Result<(), BackendError> {
        match self {
            Backend::Simulation(b) => b.health_check(),
            Backend::Hardware(b) => b.health_check(),
        }
    }

    fn shutdown(&mut self) {
        match self {
            Backend::Simulation(b) => b.shutdown(),
            Backend::Hardware(b) => b.shutdown(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Backend::Simulation(b) => b.name(),
            Backend::Hardware(b) => b.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JointLimit;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn limits() -> Arc<JointLimits> {
        Arc::new(JointLimits::new(vec![JointLimit::new(-1.0, 1.0, 1.0); 2]).unwrap())
    }

    #[test]
    fn test_sim_tracks_within_velocity_limit() {
        let mut sim = SimulatedBackend::new(JointState::zeros(2), limits(), Duration::from_millis(10));
        let ack = sim.dispatch(&JointState::new(vec![0.5, -0.002]), Duration::from_millis(1)).unwrap();
        assert_eq!(ack.sequence, 1);
        let state = sim.current_joint_state().unwrap();
        assert!((state[0] - 0.01).abs() < 1e-12);
        assert!((state[1] + 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_sim_fault_persists_until_cleared() {
        let mut sim = SimulatedBackend::new(JointState::zeros(2), limits(), Duration::from_millis(10));
        sim.inject_fault("overcurrent");
        let timeout = Duration::from_millis(1);
        assert!(matches!(sim.dispatch(&JointState::zeros(2), timeout), Err(BackendError::Fault(_))));
        assert!(sim.health_check().is_err());
        sim.clear_fault();
        assert!(sim.health_check().is_ok());
        assert!(sim.dispatch(&JointState::zeros(2), timeout).is_ok());
    }

    #[test]
    fn test_sim_injected_timeouts() {
        let mut sim = SimulatedBackend::new(JointState::zeros(2), limits(), Duration::from_millis(10));
        sim.inject_timeouts(2);
        let timeout = Duration::from_millis(1);
        assert_eq!(sim.dispatch(&JointState::zeros(2), timeout), Err(BackendError::Timeout));
        assert_eq!(sim.dispatch(&JointState::zeros(2), timeout), Err(BackendError::Timeout));
        assert!(sim.dispatch(&JointState::zeros(2), timeout).is_ok());
    }

    #[test]
    fn test_sim_shutdown_disconnects() {
        let mut sim = SimulatedBackend::new(JointState::zeros(2), limits(), Duration::from_millis(10));
        sim.shutdown();
        assert_eq!(sim.dispatch(&JointState::zeros(2), Duration::ZERO), Err(BackendError::Disconnected));
    }

    /// In-memory driver that echoes commands back as feedback.
    struct LoopbackDriver {
        state: JointState,
        fail_writes: Arc<AtomicBool>,
        write_delay: Duration,
    }

    impl JointDriver for LoopbackDriver {
        fn write(&mut self, target: &JointState) -> Result<(), BackendError> {
            thread::sleep(self.write_delay);
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(BackendError::Fault("bus error".to_string()));
            }
            self.state = target.clone();
            Ok(())
        }

        fn read(&mut self) -> Result<JointState, BackendError> {
            Ok(self.state.clone())
        }

        fn ping(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn loopback(delay: Duration) -> (HardwareBackend, Arc<AtomicBool>) {
        let fail = Arc::new(AtomicBool::new(false));
        let driver = LoopbackDriver { state: JointState::zeros(2), fail_writes: fail.clone(), write_delay: delay };
        (HardwareBackend::spawn(driver, Duration::from_millis(200)).unwrap(), fail)
    }

    #[test]
    fn test_hardware_feedback_follows_commands() {
        let (mut hw, _) = loopback(Duration::ZERO);
        assert_eq!(hw.current_joint_state().unwrap(), JointState::zeros(2));
        hw.dispatch(&JointState::new(vec![0.3, 0.4]), Duration::from_millis(50)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hw.current_joint_state().unwrap(), JointState::new(vec![0.3, 0.4]));
        assert!(hw.health_check().is_ok());
        hw.shutdown();
        assert_eq!(hw.dispatch(&JointState::zeros(2), Duration::ZERO), Err(BackendError::Disconnected));
    }

    #[test]
    fn test_hardware_slow_driver_times_out() {
        let (mut hw, _) = loopback(Duration::from_millis(100));
        let timeout = Duration::from_millis(5);
        // First command is taken by the driver, second fills the queue
        hw.dispatch(&JointState::zeros(2), timeout).unwrap();
        thread::sleep(Duration::from_millis(10));
        hw.dispatch(&JointState::zeros(2), timeout).unwrap();
        assert_eq!(hw.dispatch(&JointState::zeros(2), timeout), Err(BackendError::Timeout));
    }

    #[test]
    fn test_hardware_write_failure_surfaces_as_fault() {
        let (mut hw, fail) = loopback(Duration::ZERO);
        fail.store(true, Ordering::Relaxed);
        hw.dispatch(&JointState::zeros(2), Duration::from_millis(50)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            hw.dispatch(&JointState::zeros(2), Duration::from_millis(50)),
            Err(BackendError::Fault(_))
        ));
    }
}
