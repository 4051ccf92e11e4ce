use std::time::{Duration, Instant};

/// Operator-resume gate for the Faulted state.
///
/// A resume is only attempted once the cooldown has elapsed; every failed
/// health check stretches the cooldown by 1.5x up to `max_cooldown`.
#[derive(Clone, Debug)]
pub struct RecoveryGate {
    pub fault_active: bool,
    pub next_retry_time: Instant,
    pub attempts: u32,
    /// 0 = unlimited
    pub max_attempts: u32,
    pub base_cooldown: Duration,
    pub current_cooldown: Duration,
    pub max_cooldown: Duration,
    reason: Option<String>,
}

impl RecoveryGate {
    pub fn new(base_cooldown: Duration, max_cooldown: Duration, max_attempts: u32) -> Self {
        RecoveryGate {
            fault_active: false,
            next_retry_time: Instant::now(),
            attempts: 0,
            max_attempts,
            base_cooldown,
            current_cooldown: base_cooldown,
            max_cooldown,
            reason: None,
        }
    }

    /// Enter the fault; the first resume may be tried immediately.
    pub fn signal_fault(&mut self, reason: &str, now: Instant) {
        if !self.fault_active {
            self.fault_active = true;
            self.attempts = 0;
            self.current_cooldown = self.base_cooldown;
            self.next_retry_time = now;
        }
        self.reason = Some(reason.to_string());
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn can_retry(&self, now: Instant) -> bool {
        self.fault_active && now >= self.next_retry_time && self.can_attempt()
    }

    pub fn can_attempt(&self) -> bool {
        self.max_attempts == 0 || self.attempts < self.max_attempts
    }

    pub fn time_until_retry(&self, now: Instant) -> Duration {
        self.next_retry_time.saturating_duration_since(now)
    }

    /// Health check failed: back off before the next attempt.
    pub fn record_failed_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        let wait = self.current_cooldown;
        self.next_retry_time = now + wait;
        self.current_cooldown = Duration::from_secs_f64(
            (self.current_cooldown.as_secs_f64() * 1.5).min(self.max_cooldown.as_secs_f64()),
        );

        log::warn!(
            "[RECOVERY] Resume attempt {} failed, next attempt in {:.2}s",
            self.attempts,
            wait.as_secs_f64()
        );
    }

    pub fn record_success(&mut self, now: Instant) {
        log::info!("[RECOVERY] ✓ Resumed after {} failed attempt(s)", self.attempts);
        self.fault_active = false;
        self.attempts = 0;
        self.current_cooldown = self.base_cooldown;
        self.next_retry_time = now;
        self.reason = None;
    }

    pub fn status(&self, now: Instant) -> String {
        if !self.fault_active {
            return "OK".to_string();
        }
        if !self.can_attempt() {
            return format!("MAX_ATTEMPTS_EXCEEDED ({})", self.attempts);
        }
        if !self.can_retry(now) {
            return format!(
                "RESUME_PENDING (waiting {:.1}s, attempt {})",
                self.time_until_retry(now).as_secs_f64(),
                self.attempts
            );
        }
        format!("READY_TO_RESUME (attempt {})", self.attempts)
    }
}

impl Default for RecoveryGate {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let mut gate = RecoveryGate::new(Duration::from_secs(1), Duration::from_secs(30), 0);
        let t0 = Instant::now();
        gate.signal_fault("overcurrent", t0);
        assert!(gate.can_retry(t0));

        gate.record_failed_attempt(t0);
        assert!(!gate.can_retry(t0 + Duration::from_millis(900)));
        assert!(gate.can_retry(t0 + Duration::from_secs(1)));

        let t1 = t0 + Duration::from_secs(1);
        gate.record_failed_attempt(t1);
        assert!(!gate.can_retry(t1 + Duration::from_millis(1400)));
        assert!(gate.can_retry(t1 + Duration::from_millis(1500)));
    }

    #[test]
    fn test_cooldown_is_capped() {
        let mut gate = RecoveryGate::new(Duration::from_secs(1), Duration::from_secs(2), 0);
        let t0 = Instant::now();
        gate.signal_fault("x", t0);
        for _ in 0..10 {
            gate.record_failed_attempt(t0);
        }
        assert!(gate.current_cooldown <= Duration::from_secs(2));
    }

    #[test]
    fn test_max_attempts() {
        let mut gate = RecoveryGate::new(Duration::ZERO, Duration::ZERO, 2);
        let t0 = Instant::now();
        gate.signal_fault("x", t0);
        gate.record_failed_attempt(t0);
        assert!(gate.can_retry(t0));
        gate.record_failed_attempt(t0);
        assert!(!gate.can_retry(t0));
        assert!(gate.status(t0).starts_with("MAX_ATTEMPTS_EXCEEDED"));
    }

    #[test]
    fn test_success_resets() {
        let mut gate = RecoveryGate::default();
        let t0 = Instant::now();
        gate.signal_fault("x", t0);
        gate.record_failed_attempt(t0);
        gate.record_success(t0);
        assert!(!gate.fault_active);
        assert_eq!(gate.attempts, 0);
        assert_eq!(gate.status(t0), "OK");
    }
}
