//! Operator-to-robot frame calibration.
//!
//! The operator moves through a short guided sequence of reference points;
//! each recorded operator pose is paired with the robot-frame reference and
//! a rigid transform is fitted with the Kabsch algorithm (SVD of the
//! centred cross-covariance). The result is published as an immutable,
//! versioned snapshot through [`CalibrationHandle`].

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::config::CalibrationConfig;
use crate::error::CalibrationError;
use crate::types::{Mat3, Pose, Quat, Rot3, Vec3};

/// Fewest points that pin down a rigid transform.
pub const MIN_RIGID_SAMPLES: usize = 3;

/// One operator pose recorded while the operator held a reference pose.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CalibrationPair {
    pub operator: Pose,
    pub reference: Pose,
}

impl CalibrationPair {
    pub fn new(operator: Pose, reference: Pose) -> Self {
        Self { operator, reference }
    }
}

/// Recorded calibration session, as handed over by the persistence layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CalibrationTranscript {
    pub pairs: Vec<CalibrationPair>,
}

impl CalibrationTranscript {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ─── Transform ───────────────────────────────────────────────────────────────

/// Rigid map from the operator frame into the robot base frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTransform {
    pub rotation: Quat,
    pub translation: Vec3,
    /// Bumped every time a transform is published.
    pub version: u64,
    pub rms_error: f64,
    pub sample_count: usize,
}

impl CalibrationTransform {
    pub fn identity() -> Self {
        Self {
            rotation: Quat::identity(),
            translation: Vec3::zeros(),
            version: 0,
            rms_error: 0.0,
            sample_count: 0,
        }
    }

    pub fn apply_point(&self, point: &Vec3) -> Vec3 {
        self.rotation * point + self.translation
    }

    pub fn apply(&self, pose: &Pose) -> Pose {
        Pose::new(self.apply_point(&pose.position), self.rotation * pose.orientation)
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            translation: -(rotation * self.translation),
            rotation,
            ..self.clone()
        }
    }

    pub fn is_identity(&self, epsilon: f64) -> bool {
        self.rotation.angle() < epsilon && self.translation.norm() < epsilon
    }
}

/// Best-fit rigid transform mapping operator positions onto reference positions.
pub fn calibrate(
    samples: &[CalibrationPair],
    min_samples: usize,
    degeneracy_eps: f64,
) -> Result<CalibrationTransform, CalibrationError> {
    let needed = min_samples.max(MIN_RIGID_SAMPLES);
    if samples.len() < needed {
        return Err(CalibrationError::InsufficientSamples { got: samples.len(), needed });
    }

    let n = samples.len() as f64;
    let mut c_op = Vec3::zeros();
    let mut c_ref = Vec3::zeros();
    for pair in samples {
        c_op += pair.operator.position;
        c_ref += pair.reference.position;
    }
    c_op /= n;
    c_ref /= n;

    // Cross-covariance (reference × operator). Both point sets must span a
    // plane, otherwise H is rank-deficient and the rotation is arbitrary.
    let mut h = Mat3::zeros();
    for pair in samples {
        h += (pair.reference.position - c_ref) * (pair.operator.position - c_op).transpose();
    }
    let operators: Vec<Vec3> = samples.iter().map(|p| p.operator.position).collect();
    let references: Vec<Vec3> = samples.iter().map(|p| p.reference.position).collect();
    if points_degenerate(&operators, degeneracy_eps) || points_degenerate(&references, degeneracy_eps) {
        return Err(CalibrationError::DegenerateGeometry);
    }

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(CalibrationError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(CalibrationError::SvdFailed)?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }

    let rotation = Quat::from_rotation_matrix(&Rot3::from_matrix_unchecked(r));
    let translation = c_ref - rotation * c_op;

    let sq_err: f64 = samples
        .iter()
        .map(|p| (rotation * p.operator.position + translation - p.reference.position).norm_squared())
        .sum();

    Ok(CalibrationTransform {
        rotation,
        translation,
        version: 0,
        rms_error: (sq_err / n).sqrt(),
        sample_count: samples.len(),
    })
}

/// True when `points` are coincident or collinear: the second-largest
/// eigenvalue of their centred scatter is below `eps` times the largest.
pub fn points_degenerate(points: &[Vec3], eps: f64) -> bool {
    if points.is_empty() {
        return true;
    }
    let centroid = points.iter().fold(Vec3::zeros(), |acc, p| acc + p) / points.len() as f64;
    let scatter = points.iter().fold(Mat3::zeros(), |acc, p| {
        let d = p - centroid;
        acc + d * d.transpose()
    });
    let mut eig: Vec<f64> = scatter.symmetric_eigenvalues().iter().copied().collect();
    eig.sort_by(|a, b| b.total_cmp(a));
    eig[0] <= f64::EPSILON || eig[1] <= eps * eig[0]
}

// ─── Shared snapshot ─────────────────────────────────────────────────────────

/// Atomically swappable calibration snapshot shared with the control loop.
///
/// Readers take an `Arc` per tick; publishing swaps the pointer, so a tick
/// sees either the old or the new transform and never a mix.
#[derive(Clone)]
pub struct CalibrationHandle {
    current: Arc<ArcSwap<CalibrationTransform>>,
}

impl CalibrationHandle {
    pub fn new(initial: CalibrationTransform) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    pub fn load(&self) -> Arc<CalibrationTransform> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Publish a freshly computed transform, stamping the next version.
    ///
    /// The version bump and the swap happen in one `rcu` step, so concurrent
    /// publishers never share a version. Returns the snapshot that was stored.
    pub fn publish(&self, transform: CalibrationTransform) -> Arc<CalibrationTransform> {
        let mut published = None;
        self.current.rcu(|current| {
            let next = Arc::new(CalibrationTransform { version: current.version + 1, ..transform.clone() });
            published = Some(Arc::clone(&next));
            next
        });
        let published = published.unwrap_or_else(|| self.load());
        log::info!(
            "Publishing calibration v{} ({} samples, rms {:.4} m)",
            published.version,
            published.sample_count,
            published.rms_error
        );
        published
    }
}

impl Default for CalibrationHandle {
    fn default() -> Self {
        Self::new(CalibrationTransform::identity())
    }
}

// ─── Guided session ──────────────────────────────────────────────────────────

/// Guided calibration session: walks the operator through the configured
/// reference points and collects the paired samples.
pub struct Calibrator {
    reference_points: Vec<Vec3>,
    samples: Vec<CalibrationPair>,
    min_samples: usize,
    degeneracy_eps: f64,
}

impl Calibrator {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            reference_points: config.reference_points.clone(),
            samples: Vec::new(),
            min_samples: config.min_samples,
            degeneracy_eps: config.degeneracy_eps,
        }
    }

    /// Reference the operator should move to next. Cycles once the list is
    /// exhausted so more samples can always be requested.
    pub fn next_reference(&self) -> Option<Pose> {
        if self.reference_points.is_empty() {
            return None;
        }
        let idx = self.samples.len() % self.reference_points.len();
        Some(Pose::from_position(self.reference_points[idx]))
    }

    /// Record the operator pose for the current reference point.
    pub fn record(&mut self, operator: Pose) -> Option<CalibrationPair> {
        let reference = self.next_reference()?;
        let pair = CalibrationPair::new(operator, reference);
        self.samples.push(pair);
        log::debug!(
            "Calibration sample {} recorded for reference {:?}",
            self.samples.len(),
            reference.position
        );
        Some(pair)
    }

    /// Record an explicit pair (e.g. replayed from a transcript).
    pub fn record_pair(&mut self, pair: CalibrationPair) {
        self.samples.push(pair);
    }

    pub fn samples(&self) -> &[CalibrationPair] {
        &self.samples
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn is_ready(&self) -> bool {
        self.samples.len() >= self.min_samples.max(MIN_RIGID_SAMPLES)
    }

    /// Fit the collected samples without publishing.
    pub fn fit(&self) -> Result<CalibrationTransform, CalibrationError> {
        calibrate(&self.samples, self.min_samples, self.degeneracy_eps).map_err(|err| {
            log::warn!("Calibration not accepted ({}); collect more samples", err);
            err
        })
    }

    /// Fit and publish. On failure the collected samples are kept.
    pub fn finish(&self, handle: &CalibrationHandle) -> Result<Arc<CalibrationTransform>, CalibrationError> {
        Ok(handle.publish(self.fit()?))
    }
}
