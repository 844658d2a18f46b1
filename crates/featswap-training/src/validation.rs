//! Validation pass over a held-out source

use candle_core::{Device, D};
use featswap_core::{ClassifierInput, Networks};
use serde::{Deserialize, Serialize};

use crate::dataset::BatchSource;
use crate::error::DebiasResult;
use crate::meter::AttributewiseAccuracyMeter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketAccuracy {
    pub attributes: Vec<u32>,
    pub accuracy: f64,
    pub count: u64,
}

/// Accuracy summary for one classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub overall: f64,
    pub buckets: Vec<BucketAccuracy>,
    /// Unweighted mean over observed buckets.
    pub bucket_mean: f64,
    /// Pooled accuracy over buckets with target != bias.
    pub conflicting: f64,
}

impl ValidationReport {
    pub fn from_meter(meter: &AttributewiseAccuracyMeter) -> Self {
        let buckets = meter
            .counts()
            .iter()
            .map(|(key, count)| BucketAccuracy {
                attributes: key.clone(),
                accuracy: count.accuracy(),
                count: count.total,
            })
            .collect();
        Self {
            overall: meter.overall(),
            buckets,
            bucket_mean: meter.bucket_mean(),
            conflicting: meter.conflicting(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub bias: ValidationReport,
    pub debias: ValidationReport,
}

pub struct ValidationPass {
    attr_dims: Vec<usize>,
    device: Device,
}

impl ValidationPass {
    /// `attr_dims`: value range of each attribute column, `[num_classes, num_bias]`.
    pub fn new(attr_dims: Vec<usize>, device: Device) -> Self {
        Self { attr_dims, device }
    }

    /// Score both classifiers in inference mode. The networks' previous
    /// mode is restored whether or not the pass succeeds.
    pub fn run(&self, nets: &mut Networks, source: &dyn BatchSource) -> DebiasResult<ValidationResult> {
        let was_training = nets.is_training();
        nets.set_train(false);
        let result = self.score(nets, source);
        nets.set_train(was_training);
        result
    }

    fn score(&self, nets: &Networks, source: &dyn BatchSource) -> DebiasResult<ValidationResult> {
        let mut meter_b = AttributewiseAccuracyMeter::new(&self.attr_dims);
        let mut meter_d = AttributewiseAccuracyMeter::new(&self.attr_dims);

        for batch in source.epoch()? {
            let batch = batch?.to_device(&self.device)?;
            let label = batch.targets()?;

            let (z_l, z_b) = nets.extract(&batch.images)?;
            let z = ClassifierInput::inference(&z_l.stop(), &z_b.stop())?;
            let pred_d = nets.debiased_c.forward(&z)?.argmax(D::Minus1)?;
            let pred_b = nets.biased_c.forward(&z)?.argmax(D::Minus1)?;

            let correct_d: Vec<bool> = pred_d.eq(&label)?.to_vec1::<u8>()?.into_iter().map(|c| c != 0).collect();
            let correct_b: Vec<bool> = pred_b.eq(&label)?.to_vec1::<u8>()?.into_iter().map(|c| c != 0).collect();

            let attributes = batch.attributes_host()?;
            meter_d.add(&correct_d, &attributes)?;
            meter_b.add(&correct_b, &attributes)?;
        }

        Ok(ValidationResult {
            bias: ValidationReport::from_meter(&meter_b),
            debias: ValidationReport::from_meter(&meter_d),
        })
    }
}
