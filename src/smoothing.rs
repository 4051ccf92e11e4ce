use std::collections::{HashMap, VecDeque};

use crate::hand::{HandLandmarks, LANDMARK_COUNT};
use crate::types::Vec3;

/// Default landmark window (frames).
pub const DEFAULT_WINDOW: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowWeights {
    /// Plain moving average.
    Uniform,
    /// Hann taper; older and newest frames count less than the middle.
    Hann,
}

/// Windowed smoothing of hand landmarks to suppress tracker jitter.
pub struct LandmarkSmoother {
    window: VecDeque<[Vec3; LANDMARK_COUNT]>,
    window_size: usize,
    weights: WindowWeights,
    weights_cache: HashMap<usize, Vec<f64>>,
}

impl LandmarkSmoother {
    pub fn new(window_size: usize, weights: WindowWeights) -> Self {
        let window_size = window_size.max(1);
        LandmarkSmoother {
            window: VecDeque::with_capacity(window_size),
            window_size,
            weights,
            weights_cache: HashMap::new(),
        }
    }

    /// Push a frame and return the smoothed landmarks over the current window.
    pub fn apply(&mut self, frame: &HandLandmarks) -> HandLandmarks {
        self.window.push_back(frame.to_array());
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let length = self.window.len();
        if length == 1 {
            return *frame;
        }

        let weights = self
            .weights_cache
            .entry(length)
            .or_insert_with(|| compute_weights(self.weights, length));

        let mut smoothed = [Vec3::zeros(); LANDMARK_COUNT];
        for (points, weight) in self.window.iter().zip(weights.iter()) {
            for (acc, p) in smoothed.iter_mut().zip(points.iter()) {
                *acc += p * *weight;
            }
        }
        HandLandmarks::from_array(&smoothed)
    }

    /// Drop history, e.g. after the hand was lost.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

impl Default for LandmarkSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, WindowWeights::Uniform)
    }
}

/// Normalized window weights. Hann: 0.5 - 0.5·cos(2πi/(n-1)).
fn compute_weights(kind: WindowWeights, length: usize) -> Vec<f64> {
    if length <= 1 {
        return vec![1.0];
    }
    if kind == WindowWeights::Uniform || length == 2 {
        return vec![1.0 / length as f64; length];
    }

    let mut weights: Vec<f64> = (0..length)
        .map(|i| {
            let angle = (2.0 * std::f64::consts::PI * i as f64) / (length as f64 - 1.0);
            0.5 - 0.5 * angle.cos()
        })
        .collect();

    let sum: f64 = weights.iter().sum();
    let total = if sum > 0.0 { sum } else { 1.0 };
    weights.iter_mut().for_each(|w| *w /= total);
    weights
}
