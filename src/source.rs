//! Pose source boundary and the sources shipped with the crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::hand::{operator_pose, HandLandmarks};
use crate::handoff::{SlotError, SlotReader, SlotWriter};
use crate::smoothing::LandmarkSmoother;
use crate::types::{Pose, PoseSample, Quat, Vec3};

/// Yields timestamped operator poses. Timestamps are monotonic per source.
pub trait PoseSource {
    /// Wait at most `timeout` for the next sample.
    fn read(&mut self, timeout: Duration) -> Result<PoseSample, SourceError>;
}

impl<S: PoseSource + ?Sized> PoseSource for Box<S> {
    fn read(&mut self, timeout: Duration) -> Result<PoseSample, SourceError> {
        (**self).read(timeout)
    }
}

/// Rejects any timestamp that does not move forward.
#[derive(Debug, Default, Clone, Copy)]
struct MonotonicGuard {
    last: Option<f64>,
}

impl MonotonicGuard {
    fn check(&mut self, timestamp: f64) -> Result<(), SourceError> {
        if !timestamp.is_finite() {
            return Err(SourceError::Rejected(format!("non-finite timestamp {timestamp}")));
        }
        if let Some(last) = self.last {
            if timestamp <= last {
                return Err(SourceError::NonMonotonic { last, got: timestamp });
            }
        }
        self.last = Some(timestamp);
        Ok(())
    }
}

fn slot_error(err: SlotError) -> SourceError {
    match err {
        SlotError::Timeout => SourceError::Timeout,
        SlotError::Closed => SourceError::Disconnected,
    }
}

// ─── Channel source ──────────────────────────────────────────────────────────

/// Reads poses published by an I/O task through the latest-value slot.
pub struct ChannelPoseSource {
    reader: SlotReader<PoseSample>,
    guard: MonotonicGuard,
}

impl ChannelPoseSource {
    pub fn new(reader: SlotReader<PoseSample>) -> Self {
        Self { reader, guard: MonotonicGuard::default() }
    }
}

impl PoseSource for ChannelPoseSource {
    fn read(&mut self, timeout: Duration) -> Result<PoseSample, SourceError> {
        let sample = self.reader.recv_timeout(timeout).map_err(slot_error)?;
        self.guard.check(sample.timestamp)?;
        Ok(sample)
    }
}

// ─── Hand-landmark source ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LandmarkSample {
    pub timestamp: f64,
    pub landmarks: HandLandmarks,
}

/// Turns tracked hand landmarks into smoothed operator poses.
pub struct LandmarkPoseSource {
    reader: SlotReader<LandmarkSample>,
    smoother: LandmarkSmoother,
    guard: MonotonicGuard,
}

impl LandmarkPoseSource {
    pub fn new(reader: SlotReader<LandmarkSample>, smoother: LandmarkSmoother) -> Self {
        Self { reader, smoother, guard: MonotonicGuard::default() }
    }
}

impl PoseSource for LandmarkPoseSource {
    fn read(&mut self, timeout: Duration) -> Result<PoseSample, SourceError> {
        let sample = self.reader.recv_timeout(timeout).map_err(slot_error)?;
        self.guard.check(sample.timestamp)?;

        let smoothed = self.smoother.apply(&sample.landmarks);
        match operator_pose(&smoothed) {
            Some(pose) => Ok(PoseSample::new(sample.timestamp, pose)),
            None => {
                // A collapsed hand poisons the window; start over
                self.smoother.reset();
                Err(SourceError::Rejected("hand landmarks do not span a palm".to_string()))
            }
        }
    }
}

// ─── Scripted source ─────────────────────────────────────────────────────────

/// Replays a fixed sequence of read outcomes; once exhausted every read times out.
///
/// Used to replay recorded sessions and to drive the loop in tests.
#[derive(Debug, Default)]
pub struct ScriptedPoseSource {
    script: VecDeque<Result<PoseSample, SourceError>>,
    guard: MonotonicGuard,
}

impl ScriptedPoseSource {
    pub fn new(script: impl IntoIterator<Item = Result<PoseSample, SourceError>>) -> Self {
        Self { script: script.into_iter().collect(), guard: MonotonicGuard::default() }
    }

    pub fn from_samples(samples: impl IntoIterator<Item = PoseSample>) -> Self {
        Self::new(samples.into_iter().map(Ok))
    }

    pub fn push(&mut self, outcome: Result<PoseSample, SourceError>) {
        self.script.push_back(outcome);
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl PoseSource for ScriptedPoseSource {
    fn read(&mut self, _timeout: Duration) -> Result<PoseSample, SourceError> {
        let sample = self.script.pop_front().unwrap_or(Err(SourceError::Timeout))?;
        self.guard.check(sample.timestamp)?;
        Ok(sample)
    }
}

// ─── Synthetic generator ─────────────────────────────────────────────────────

/// Parameters of the synthetic operator motion (a slow horizontal circle).
///
/// The circle is defined in the robot base frame; poses are reported in an
/// operator frame offset from it by `operator_rotation` and `operator_offset`,
/// so calibration has a real transform to recover.
#[derive(Clone, Debug)]
pub struct SyntheticMotion {
    pub rate_hz: f64,
    pub center: Vec3,
    pub radius: f64,
    pub period_s: f64,
    pub operator_rotation: Quat,
    pub operator_offset: Vec3,
}

impl Default for SyntheticMotion {
    fn default() -> Self {
        Self {
            rate_hz: 60.0,
            center: Vec3::new(0.35, 0.0, 0.35),
            radius: 0.08,
            period_s: 8.0,
            operator_rotation: Quat::from_axis_angle(&Vec3::z_axis(), 0.3),
            operator_offset: Vec3::new(-0.2, 0.1, -0.3),
        }
    }
}

impl SyntheticMotion {
    /// Where the hand should drive the tool, in the robot base frame.
    pub fn robot_pose_at(&self, t: f64) -> Pose {
        let phase = 2.0 * std::f64::consts::PI * t / self.period_s;
        let position = self.center + Vec3::new(phase.cos(), phase.sin(), 0.0) * self.radius;
        // Gentle wrist roll so orientation also moves
        let orientation = Quat::from_axis_angle(&Vec3::x_axis(), 0.2 * phase.sin());
        Pose::new(position, orientation)
    }

    /// The same hand as the tracker sees it, in the operator frame.
    pub fn pose_at(&self, t: f64) -> Pose {
        self.operator_pose_for(&self.robot_pose_at(t))
    }

    /// Operator-frame pose of a hand placed at `reference` (robot frame).
    pub fn operator_pose_for(&self, reference: &Pose) -> Pose {
        Pose::new(
            self.operator_rotation * reference.position + self.operator_offset,
            self.operator_rotation * reference.orientation,
        )
    }
}

/// Publish synthetic operator poses until `stop` is set. Returns the sample count.
pub async fn synthetic_pose_loop(writer: SlotWriter<PoseSample>, motion: SyntheticMotion, stop: Arc<AtomicBool>) -> u64 {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / motion.rate_hz));
    let start = Instant::now();
    let mut sample_count = 0u64;

    while !stop.load(Ordering::Relaxed) {
        interval.tick().await;
        let t = start.elapsed().as_secs_f64();
        writer.publish(PoseSample::new(t, motion.pose_at(t)));
        sample_count += 1;
        if sample_count % 600 == 0 {
            log::debug!("[pose] {} synthetic samples", sample_count);
        }
    }

    log::info!("[pose] Synthetic source stopped after {} samples", sample_count);
    sample_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hand::tests::flat_hand;
    use crate::handoff::latest_value;

    #[test]
    fn test_channel_source_rejects_backwards_timestamps() {
        let (writer, reader) = latest_value();
        let mut source = ChannelPoseSource::new(reader);
        let timeout = Duration::from_millis(5);

        writer.publish(PoseSample::new(1.0, Pose::identity()));
        assert!(source.read(timeout).is_ok());
        writer.publish(PoseSample::new(0.5, Pose::identity()));
        assert!(matches!(source.read(timeout), Err(SourceError::NonMonotonic { .. })));
        writer.publish(PoseSample::new(1.5, Pose::identity()));
        assert_eq!(source.read(timeout).unwrap().timestamp, 1.5);
    }

    #[test]
    fn test_channel_source_times_out_then_disconnects() {
        let (writer, reader) = latest_value::<PoseSample>();
        let mut source = ChannelPoseSource::new(reader);
        assert_eq!(source.read(Duration::from_millis(1)), Err(SourceError::Timeout));
        drop(writer);
        assert_eq!(source.read(Duration::from_millis(1)), Err(SourceError::Disconnected));
    }

    #[test]
    fn test_landmark_source_yields_wrist_pose() {
        let (writer, reader) = latest_value();
        let mut source = LandmarkPoseSource::new(reader, LandmarkSmoother::default());
        let wrist = Vec3::new(0.1, 0.2, 0.3);
        writer.publish(LandmarkSample { timestamp: 0.1, landmarks: flat_hand(wrist) });

        let sample = source.read(Duration::from_millis(5)).unwrap();
        assert!((sample.pose.position - wrist).norm() < 1e-12);
    }

    #[test]
    fn test_landmark_source_rejects_collapsed_hand() {
        let (writer, reader) = latest_value();
        let mut source = LandmarkPoseSource::new(reader, LandmarkSmoother::default());
        let mut hand = flat_hand(Vec3::zeros());
        hand.knuckles = [hand.wrist; 5];
        writer.publish(LandmarkSample { timestamp: 0.1, landmarks: hand });
        assert!(matches!(source.read(Duration::from_millis(5)), Err(SourceError::Rejected(_))));
    }

    #[test]
    fn test_scripted_source_times_out_when_exhausted() {
        let mut source = ScriptedPoseSource::from_samples([PoseSample::new(0.0, Pose::identity())]);
        assert!(source.read(Duration::ZERO).is_ok());
        assert_eq!(source.read(Duration::ZERO), Err(SourceError::Timeout));
    }

    #[test]
    fn test_channel_source_rejects_non_finite_timestamps() {
        let (writer, reader) = latest_value();
        let mut source = ChannelPoseSource::new(reader);
        let timeout = Duration::from_millis(5);

        writer.publish(PoseSample::new(f64::NAN, Pose::identity()));
        assert!(matches!(source.read(timeout), Err(SourceError::Rejected(_))));
        writer.publish(PoseSample::new(f64::INFINITY, Pose::identity()));
        assert!(matches!(source.read(timeout), Err(SourceError::Rejected(_))));

        // Ordering still holds afterwards
        writer.publish(PoseSample::new(2.0, Pose::identity()));
        assert!(source.read(timeout).is_ok());
        writer.publish(PoseSample::new(1.0, Pose::identity()));
        assert!(matches!(source.read(timeout), Err(SourceError::NonMonotonic { .. })));
    }

    #[test]
    fn test_synthetic_motion_stays_on_circle() {
        let motion = SyntheticMotion::default();
        for i in 0..20 {
            let pose = motion.robot_pose_at(i as f64 * 0.37);
            assert!(((pose.position - motion.center).norm() - motion.radius).abs() < 1e-12);
        }
    }

    #[test]
    fn test_guided_calibration_recovers_synthetic_operator_frame() {
        use crate::calibration::{calibrate, CalibrationPair};
        use crate::config::CalibrationConfig;

        let motion = SyntheticMotion::default();
        let config = CalibrationConfig::default();
        let pairs: Vec<_> = config
            .reference_points
            .iter()
            .map(|p| {
                let reference = Pose::from_position(*p);
                CalibrationPair::new(motion.operator_pose_for(&reference), reference)
            })
            .collect();

        let transform = calibrate(&pairs, config.min_samples, config.degeneracy_eps).unwrap();
        assert!(!transform.is_identity(1e-3));
        for i in 0..10 {
            let t = i as f64 * 0.9;
            let mapped = transform.apply_point(&motion.pose_at(t).position);
            assert!((mapped - motion.robot_pose_at(t).position).norm() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_synthetic_loop_publishes_until_stopped() {
        let (writer, reader) = latest_value();
        let stop = Arc::new(AtomicBool::new(false));
        let motion = SyntheticMotion { rate_hz: 200.0, ..SyntheticMotion::default() };
        let task = tokio::spawn(synthetic_pose_loop(writer, motion, stop.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.store(true, Ordering::Relaxed);
        let count = task.await.unwrap();
        assert!(count > 0);
        assert!(reader.try_latest().unwrap().is_some());
    }
}
