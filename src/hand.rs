//! Hand landmarks → operator pose.
//!
//! The hand frame is anchored at the wrist: +y points at the middle-finger
//! knuckle, +z is the palm normal and +x completes a right-handed frame.

use serde::{Deserialize, Serialize};

use crate::types::{Mat3, Pose, Quat, Rot3, Vec3};

pub const FINGER_COUNT: usize = 5;
pub const LANDMARK_COUNT: usize = 1 + 2 * FINGER_COUNT;

/// Finger order for `knuckles` and `tips`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finger {
    Thumb = 0,
    Index = 1,
    Middle = 2,
    Ring = 3,
    Pinky = 4,
}

/// Tracked hand keypoints in the sensor frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandLandmarks {
    pub wrist: Vec3,
    pub knuckles: [Vec3; FINGER_COUNT],
    pub tips: [Vec3; FINGER_COUNT],
}

impl HandLandmarks {
    pub fn knuckle(&self, finger: Finger) -> Vec3 {
        self.knuckles[finger as usize]
    }

    pub fn tip(&self, finger: Finger) -> Vec3 {
        self.tips[finger as usize]
    }

    /// Wrist, knuckles (thumb..pinky), tips (thumb..pinky).
    pub fn to_array(&self) -> [Vec3; LANDMARK_COUNT] {
        let mut out = [Vec3::zeros(); LANDMARK_COUNT];
        out[0] = self.wrist;
        out[1..=FINGER_COUNT].copy_from_slice(&self.knuckles);
        out[FINGER_COUNT + 1..].copy_from_slice(&self.tips);
        out
    }

    pub fn from_array(points: &[Vec3; LANDMARK_COUNT]) -> Self {
        let mut knuckles = [Vec3::zeros(); FINGER_COUNT];
        let mut tips = [Vec3::zeros(); FINGER_COUNT];
        knuckles.copy_from_slice(&points[1..=FINGER_COUNT]);
        tips.copy_from_slice(&points[FINGER_COUNT + 1..]);
        Self { wrist: points[0], knuckles, tips }
    }
}

/// Wrist-anchored hand frame in sensor coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HandFrame {
    pub origin: Vec3,
    /// Columns are the hand x, y, z axes.
    pub rotation: Rot3,
}

const MIN_SPAN: f64 = 1e-9;

impl HandFrame {
    /// None when the landmarks do not span a palm (coincident or collinear points).
    pub fn from_landmarks(hand: &HandLandmarks) -> Option<Self> {
        let to_middle = hand.knuckle(Finger::Middle) - hand.wrist;
        let y = to_middle.try_normalize(MIN_SPAN)?;

        let palm_normal =
            (hand.knuckle(Finger::Index) - hand.wrist).cross(&(hand.knuckle(Finger::Pinky) - hand.wrist));
        // Gram-Schmidt against y
        let z = (palm_normal - y * palm_normal.dot(&y)).try_normalize(MIN_SPAN)?;
        let x = y.cross(&z);

        Some(Self {
            origin: hand.wrist,
            rotation: Rot3::from_matrix_unchecked(Mat3::from_columns(&[x, y, z])),
        })
    }

    pub fn to_local(&self, point: &Vec3) -> Vec3 {
        self.rotation.inverse() * (point - self.origin)
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_rotation_matrix(&self.rotation)
    }
}

/// Operator pose: wrist position plus hand-frame orientation.
pub fn operator_pose(hand: &HandLandmarks) -> Option<Pose> {
    let frame = HandFrame::from_landmarks(hand)?;
    Some(Pose::new(frame.origin, frame.orientation()))
}

/// All landmarks in hand-local coordinates. `mirror` flips x so a left hand
/// reads like a right one.
pub fn local_coordinates(hand: &HandLandmarks, mirror: bool) -> Option<[Vec3; LANDMARK_COUNT]> {
    let frame = HandFrame::from_landmarks(hand)?;
    let mut points = hand.to_array();
    for p in points.iter_mut() {
        *p = frame.to_local(p);
        if mirror {
            p.x = -p.x;
        }
    }
    Some(points)
}
