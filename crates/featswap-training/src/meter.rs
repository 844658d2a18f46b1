//! Accuracy bucketed by attribute tuple

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DebiasError, DebiasResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    pub correct: u64,
    pub total: u64,
}

impl BucketCount {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return f64::NAN;
        }
        self.correct as f64 / self.total as f64
    }
}

/// Correct/total counts per observed attribute tuple. The arity and the
/// size of each attribute's value range are fixed at construction.
#[derive(Debug, Clone)]
pub struct AttributewiseAccuracyMeter {
    dims: Vec<usize>,
    buckets: BTreeMap<Vec<u32>, BucketCount>,
}

impl AttributewiseAccuracyMeter {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            buckets: BTreeMap::new(),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn add(&mut self, correct: &[bool], attributes: &[Vec<u32>]) -> DebiasResult<()> {
        if correct.len() != attributes.len() {
            return Err(DebiasError::LengthMismatch {
                what: "attribute tuples per prediction",
                expected: correct.len(),
                actual: attributes.len(),
            });
        }
        for key in attributes {
            self.check_key(key)?;
        }
        for (&hit, key) in correct.iter().zip(attributes) {
            let bucket = self.buckets.entry(key.clone()).or_default();
            bucket.total += 1;
            if hit {
                bucket.correct += 1;
            }
        }
        Ok(())
    }

    /// Mean accuracy of every observed bucket. Unseen buckets are absent.
    pub fn get_mean(&self) -> BTreeMap<Vec<u32>, f64> {
        self.buckets
            .iter()
            .map(|(key, count)| (key.clone(), count.accuracy()))
            .collect()
    }

    pub fn counts(&self) -> &BTreeMap<Vec<u32>, BucketCount> {
        &self.buckets
    }

    pub fn overall(&self) -> f64 {
        self.pooled(|_| true).accuracy()
    }

    /// Unweighted mean over observed buckets.
    pub fn bucket_mean(&self) -> f64 {
        if self.buckets.is_empty() {
            return f64::NAN;
        }
        let sum: f64 = self.buckets.values().map(BucketCount::accuracy).sum();
        sum / self.buckets.len() as f64
    }

    /// Pooled accuracy over buckets whose first two attributes differ.
    pub fn conflicting(&self) -> f64 {
        self.pooled(|key| key.len() >= 2 && key[0] != key[1]).accuracy()
    }

    fn pooled(&self, keep: impl Fn(&[u32]) -> bool) -> BucketCount {
        self.buckets
            .iter()
            .filter(|(key, _)| keep(key))
            .fold(BucketCount::default(), |acc, (_, c)| BucketCount {
                correct: acc.correct + c.correct,
                total: acc.total + c.total,
            })
    }

    fn check_key(&self, key: &[u32]) -> DebiasResult<()> {
        if key.len() != self.dims.len() {
            return Err(DebiasError::AttributeArity {
                key: key.to_vec(),
                expected: self.dims.len(),
            });
        }
        for (&value, &dim) in key.iter().zip(&self.dims) {
            if value as usize >= dim {
                return Err(DebiasError::ClassOutOfRange {
                    class: value as usize,
                    num_classes: dim,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_bucket_all_correct() {
        let mut meter = AttributewiseAccuracyMeter::new(&[2, 2]);
        meter.add(&[true, true], &[vec![1, 0], vec![1, 0]]).unwrap();
        meter.add(&[true], &[vec![1, 0]]).unwrap();

        let mean = meter.get_mean();
        assert_eq!(mean.get(&vec![1, 0]), Some(&1.0));
        assert!(!mean.contains_key(&vec![0, 0]));
        assert_eq!(meter.counts()[&vec![1, 0]].total, 3);
    }

    #[test]
    fn test_summaries() {
        let mut meter = AttributewiseAccuracyMeter::new(&[2, 2]);
        meter
            .add(
                &[true, true, true, false, true, false],
                &[vec![0, 0], vec![0, 0], vec![1, 1], vec![1, 1], vec![0, 1], vec![1, 0]],
            )
            .unwrap();
        assert_eq!(meter.overall(), 4.0 / 6.0);
        // Buckets: 1.0, 0.5, 1.0, 0.0
        assert_eq!(meter.bucket_mean(), 0.625);
        assert_eq!(meter.conflicting(), 0.5);
    }

    #[test]
    fn test_empty_meter_is_nan() {
        let meter = AttributewiseAccuracyMeter::new(&[2, 2]);
        assert!(meter.get_mean().is_empty());
        assert!(meter.overall().is_nan());
        assert!(meter.bucket_mean().is_nan());
    }

    #[test]
    fn test_rejects_out_of_range_attribute() {
        let mut meter = AttributewiseAccuracyMeter::new(&[2, 2]);
        assert!(matches!(
            meter.add(&[true], &[vec![0, 2]]),
            Err(DebiasError::ClassOutOfRange { class: 2, num_classes: 2 })
        ));
        assert!(matches!(
            meter.add(&[true], &[vec![0]]),
            Err(DebiasError::AttributeArity { expected: 2, .. })
        ));
        assert!(meter.get_mean().is_empty());
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let mut meter = AttributewiseAccuracyMeter::new(&[2, 2]);
        let err = meter.add(&[true, false], &[vec![0, 0]]).unwrap_err();
        assert!(matches!(err, DebiasError::LengthMismatch { expected: 2, actual: 1, .. }));
        assert!(meter.counts().is_empty());
    }
}
