//! Per-sample EMA loss tracking
//!
//! One entry per dataset index plus a running per-class maximum keyed by
//! the ground-truth label. A stored value of exactly zero means the index
//! has not been visited yet, so the first update stores the raw loss.

use crate::error::{DebiasError, DebiasResult};

/// Guard for classes whose running max is still zero.
pub const NORMALIZE_EPS: f32 = 1e-8;

#[derive(Debug, Clone)]
pub struct PerSampleLossTracker {
    labels: Vec<u32>,
    ema: Vec<f32>,
    updates: Vec<u32>,
    class_max: Vec<f32>,
    alpha: f32,
}

impl PerSampleLossTracker {
    /// Build over the full label array of the supervised dataset.
    pub fn new(labels: &[u32], num_classes: usize, alpha: f32) -> DebiasResult<Self> {
        if labels.is_empty() {
            return Err(DebiasError::MissingLabels);
        }
        if let Some(&bad) = labels.iter().find(|&&c| c as usize >= num_classes) {
            return Err(DebiasError::ClassOutOfRange {
                class: bad as usize,
                num_classes,
            });
        }
        Ok(Self {
            labels: labels.to_vec(),
            ema: vec![0.0; labels.len()],
            updates: vec![0; labels.len()],
            class_max: vec![0.0; num_classes],
            alpha,
        })
    }

    pub fn len(&self) -> usize {
        self.ema.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ema.is_empty()
    }

    /// Fold a batch of detached per-example losses into the tracker.
    ///
    /// All indices are checked before any state changes.
    pub fn update(&mut self, losses: &[f32], indices: &[usize]) -> DebiasResult<()> {
        if losses.len() != indices.len() {
            return Err(DebiasError::LengthMismatch {
                what: "losses per index",
                expected: indices.len(),
                actual: losses.len(),
            });
        }
        self.check_indices(indices)?;

        for (&loss, &index) in losses.iter().zip(indices) {
            let prev = self.ema[index];
            let next = if prev == 0.0 {
                loss
            } else {
                self.alpha * prev + (1.0 - self.alpha) * loss
            };
            self.ema[index] = next;
            self.updates[index] += 1;

            let class = self.labels[index] as usize;
            self.class_max[class] = self.class_max[class].max(next);
        }
        Ok(())
    }

    /// `ema[i] / max(class_max[label(i)], eps)` for each index.
    pub fn normalized(&self, indices: &[usize]) -> DebiasResult<Vec<f32>> {
        self.check_indices(indices)?;
        Ok(indices
            .iter()
            .map(|&i| {
                let max = self.class_max[self.labels[i] as usize];
                self.ema[i] / max.max(NORMALIZE_EPS)
            })
            .collect())
    }

    /// Running max for class `c`; zero if the class was never observed.
    pub fn class_max(&self, c: usize) -> f32 {
        self.class_max.get(c).copied().unwrap_or(0.0)
    }

    pub fn ema(&self, index: usize) -> Option<f32> {
        self.ema.get(index).copied()
    }

    /// Number of updates applied to `index`.
    pub fn times_updated(&self, index: usize) -> u32 {
        self.updates.get(index).copied().unwrap_or(0)
    }

    /// Indices that have received at least one update.
    pub fn touched(&self) -> impl Iterator<Item = usize> + '_ {
        self.updates
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n > 0)
            .map(|(i, _)| i)
    }

    fn check_indices(&self, indices: &[usize]) -> DebiasResult<()> {
        match indices.iter().find(|&&i| i >= self.ema.len()) {
            Some(&index) => Err(DebiasError::IndexOutOfRange {
                index,
                len: self.ema.len(),
            }),
            None => Ok(()),
        }
    }
}

/// `na / (na + nc + eps)`: how bias-aligned each example looks.
pub fn loss_weights(norm_align: &[f32], norm_conflict: &[f32]) -> Vec<f32> {
    norm_align
        .iter()
        .zip(norm_conflict)
        .map(|(&a, &c)| a / (a + c + NORMALIZE_EPS))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_requires_labels() {
        assert!(matches!(
            PerSampleLossTracker::new(&[], 2, 0.7),
            Err(DebiasError::MissingLabels)
        ));
        assert!(matches!(
            PerSampleLossTracker::new(&[0, 4], 2, 0.7),
            Err(DebiasError::ClassOutOfRange { class: 4, .. })
        ));
    }

    #[test]
    fn test_unvisited_normalizes_to_zero() {
        let tracker = PerSampleLossTracker::new(&[0, 1, 1], 2, 0.7).unwrap();
        let norm = tracker.normalized(&[0, 1, 2]).unwrap();
        assert_eq!(norm, vec![0.0, 0.0, 0.0]);
        assert_eq!(tracker.class_max(1), 0.0);
        assert_eq!(tracker.class_max(9), 0.0);
    }

    #[test]
    fn test_ema_rule() {
        let mut tracker = PerSampleLossTracker::new(&[0], 1, 0.7).unwrap();
        tracker.update(&[2.0], &[0]).unwrap();
        assert_relative_eq!(tracker.ema(0).unwrap(), 2.0);

        tracker.update(&[1.0], &[0]).unwrap();
        assert_relative_eq!(tracker.ema(0).unwrap(), 0.7 * 2.0 + 0.3 * 1.0, epsilon = 1e-6);

        let prev = tracker.ema(0).unwrap();
        tracker.update(&[5.0], &[0]).unwrap();
        assert_relative_eq!(tracker.ema(0).unwrap(), 0.7 * prev + 0.3 * 5.0, epsilon = 1e-6);
        assert_eq!(tracker.times_updated(0), 3);
    }

    #[test]
    fn test_zero_ema_is_treated_as_unvisited() {
        let mut tracker = PerSampleLossTracker::new(&[0], 1, 0.7).unwrap();
        tracker.update(&[0.0], &[0]).unwrap();
        tracker.update(&[3.0], &[0]).unwrap();
        assert_relative_eq!(tracker.ema(0).unwrap(), 3.0);
    }

    #[test]
    fn test_class_max_is_monotone() {
        let mut tracker = PerSampleLossTracker::new(&[0, 0, 1], 2, 0.7).unwrap();
        let mut last = 0.0;
        for loss in [1.0, 4.0, 0.1, 0.2, 3.0] {
            tracker.update(&[loss], &[1]).unwrap();
            assert!(tracker.class_max(0) >= last);
            last = tracker.class_max(0);
        }
        // Peak EMA was 0.7 * 1.0 + 0.3 * 4.0 after the second update.
        assert_relative_eq!(last, 1.9, epsilon = 1e-6);
        assert_eq!(tracker.class_max(1), 0.0);
    }

    #[test]
    fn test_normalized_uses_ground_truth_class() {
        let mut tracker = PerSampleLossTracker::new(&[0, 0, 1], 2, 0.7).unwrap();
        tracker.update(&[2.0, 1.0, 0.5], &[0, 1, 2]).unwrap();
        let norm = tracker.normalized(&[0, 1, 2]).unwrap();
        assert_relative_eq!(norm[0], 1.0);
        assert_relative_eq!(norm[1], 0.5);
        assert_relative_eq!(norm[2], 1.0);
    }

    #[test]
    fn test_out_of_range_index_fails_without_side_effects() {
        let mut tracker = PerSampleLossTracker::new(&[0, 1], 2, 0.7).unwrap();
        let err = tracker.update(&[1.0, 1.0], &[0, 2]).unwrap_err();
        assert!(matches!(err, DebiasError::IndexOutOfRange { index: 2, len: 2 }));
        assert_eq!(tracker.times_updated(0), 0);
        assert!(tracker.normalized(&[5]).is_err());
    }

    #[test]
    fn test_mismatched_lengths_are_rejected() {
        let mut tracker = PerSampleLossTracker::new(&[0, 1, 0], 2, 0.7).unwrap();
        let err = tracker.update(&[1.0, 2.0], &[0, 1, 2]).unwrap_err();
        assert!(matches!(err, DebiasError::LengthMismatch { expected: 3, actual: 2, .. }));
        assert!((0..3).all(|i| tracker.times_updated(i) == 0));
    }

    #[test]
    fn test_loss_weights() {
        let w = loss_weights(&[0.5, 0.0, 1.0, 0.0], &[0.5, 1.0, 0.0, 0.0]);
        assert_relative_eq!(w[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(w[1], 0.0);
        assert_relative_eq!(w[2], 1.0, epsilon = 1e-6);
        assert_eq!(w[3], 0.0);
        assert!(w.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)));
    }
}
