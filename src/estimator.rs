//! Convergence oracle over the macroscopic stress sequence.
//!
//! The CG residual norm is a poor stopping signal for this problem: the
//! quantity of interest is the volume-averaged stress, which settles well
//! before the pointwise residual does. The estimator therefore watches the
//! per-iteration stress tensors and extrapolates the remaining error from
//! the tail of the sequence, assuming geometric decay of the successive
//! differences.

use crate::types::StressTensor;

/// Estimates the relative error of the macroscopic stress from its
/// per-iteration history.
#[derive(Debug, Clone, Default)]
pub struct ErrorEstimator {
    history: Vec<[f64; 6]>,
}

impl ErrorEstimator {
    /// Create an estimator with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one iteration's volume-averaged stress.
    pub fn add_stress_data(&mut self, stress: &StressTensor) {
        self.history.push(stress.components());
    }

    /// Number of recorded iterations.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// True iff no stress has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Clear the history (a new solve starts a new sequence).
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Estimated relative error of the latest stress.
    ///
    /// With fewer than three samples the sequence tail is unknown and the
    /// estimate is infinite. Otherwise, for the last two successive
    /// differences d_n and d_{n-1} (max norm over the six Voigt
    /// components), the remaining error is extrapolated as the geometric
    /// tail d_n * rho / (1 - rho) with rho = d_n / d_{n-1} clamped below 1,
    /// and reported relative to the magnitude of the latest stress. A
    /// stationary sequence reports zero.
    pub fn estimated_relative_error(&self) -> f64 {
        let n = self.history.len();
        if n < 3 {
            return f64::INFINITY;
        }
        let d1 = diff_norm(&self.history[n - 1], &self.history[n - 2]);
        if d1 == 0.0 {
            return 0.0;
        }
        let d0 = diff_norm(&self.history[n - 2], &self.history[n - 3]);
        let rho = if d0 > 0.0 { (d1 / d0).clamp(0.0, 0.99) } else { 0.99 };
        let tail = d1 * rho / (1.0 - rho);
        let scale = self.history[n - 1]
            .iter()
            .fold(0.0f64, |acc, c| acc.max(c.abs()));
        tail / scale.max(f64::MIN_POSITIVE)
    }

    /// The recorded stress sequence, oldest first.
    pub fn history(&self) -> impl Iterator<Item = StressTensor> + '_ {
        self.history.iter().map(|c| StressTensor::new(*c))
    }
}

fn diff_norm(a: &[f64; 6], b: &[f64; 6]) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0f64, |acc, (x, y)| acc.max((x - y).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn push(est: &mut ErrorEstimator, s11: f64) {
        est.add_stress_data(&StressTensor::new([s11, 0.0, 0.0, 0.0, 0.0, 0.0]));
    }

    #[test]
    fn test_short_history_is_inconclusive() {
        let mut est = ErrorEstimator::new();
        assert!(est.estimated_relative_error().is_infinite());
        push(&mut est, 1.0);
        push(&mut est, 2.0);
        assert!(est.estimated_relative_error().is_infinite());
    }

    #[test]
    fn test_stationary_sequence_reports_zero() {
        let mut est = ErrorEstimator::new();
        for _ in 0..5 {
            push(&mut est, 3.0);
        }
        assert_relative_eq!(est.estimated_relative_error(), 0.0);
    }

    #[test]
    fn test_geometric_sequence_tail() {
        // s_n = 1 - 0.5^n converges to 1 with ratio 0.5; after samples at
        // n = 0,1,2 the differences are 0.5, 0.25 so the tail estimate is
        // 0.25 * 0.5 / 0.5 = 0.25 relative to s_2 = 0.75.
        let mut est = ErrorEstimator::new();
        for n in 0..3 {
            push(&mut est, 1.0 - 0.5f64.powi(n));
        }
        assert_relative_eq!(est.estimated_relative_error(), 0.25 / 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_estimate_shrinks_as_the_sequence_settles() {
        let mut est = ErrorEstimator::new();
        for n in 0..12 {
            push(&mut est, 1.0 - 0.5f64.powi(n));
        }
        let late = est.estimated_relative_error();
        let mut early = ErrorEstimator::new();
        for n in 0..4 {
            push(&mut early, 1.0 - 0.5f64.powi(n));
        }
        assert!(late < early.estimated_relative_error());
        assert!(late < 1e-2);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut est = ErrorEstimator::new();
        push(&mut est, 1.0);
        assert_eq!(est.len(), 1);
        est.reset();
        assert!(est.is_empty());
        assert!(est.estimated_relative_error().is_infinite());
    }
}
