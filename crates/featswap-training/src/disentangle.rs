//! Disentangled latent losses with per-sample reweighting

use candle_core::Tensor;
use featswap_core::{
    per_sample_cross_entropy, ClassifierInput, GeneralizedCrossEntropy, LiveLatent, Networks,
};

use crate::error::DebiasResult;
use crate::tracker::{loss_weights, PerSampleLossTracker};

/// Per-example outputs of one disentanglement pass. Every vector has the
/// batch length; averaging is left to the caller.
#[derive(Debug, Clone)]
pub struct DisentangleOutput {
    pub z_l: LiveLatent,
    pub z_b: LiveLatent,
    /// `W(z) * CE(C_d([z_l, sg(z_b)]), y)`
    pub conflict_loss: Tensor,
    /// `GCE(C_b([sg(z_l), z_b]), y)`
    pub align_loss: Tensor,
    /// Detached, in `[0, 1]`.
    pub loss_weight: Tensor,
}

pub struct DisentanglementStep {
    conflict_ema: PerSampleLossTracker,
    align_ema: PerSampleLossTracker,
    bias_criterion: GeneralizedCrossEntropy,
}

impl DisentanglementStep {
    /// `labels` is the full target column of the supervised dataset.
    pub fn new(labels: &[u32], num_classes: usize, alpha: f32, gce_q: f64) -> DebiasResult<Self> {
        Ok(Self {
            conflict_ema: PerSampleLossTracker::new(labels, num_classes, alpha)?,
            align_ema: PerSampleLossTracker::new(labels, num_classes, alpha)?,
            bias_criterion: GeneralizedCrossEntropy::new(gce_q),
        })
    }

    pub fn conflict_tracker(&self) -> &PerSampleLossTracker {
        &self.conflict_ema
    }

    pub fn align_tracker(&self) -> &PerSampleLossTracker {
        &self.align_ema
    }

    pub fn bias_criterion(&self) -> &GeneralizedCrossEntropy {
        &self.bias_criterion
    }

    pub fn forward(
        &mut self,
        nets: &Networks,
        x: &Tensor,
        indices: &[usize],
        label: &Tensor,
    ) -> DebiasResult<DisentangleOutput> {
        let (z_l, z_b) = nets.extract(x)?;

        let pred_conflict = nets
            .debiased_c
            .forward(&ClassifierInput::conflict(&z_l, &z_b.stop())?)?;
        let pred_align = nets
            .biased_c
            .forward(&ClassifierInput::align(&z_l.stop(), &z_b)?)?;

        let ce_conflict = per_sample_cross_entropy(&pred_conflict, label)?;
        let ce_align = per_sample_cross_entropy(&pred_align, label)?;

        self.conflict_ema
            .update(&ce_conflict.detach().to_vec1::<f32>()?, indices)?;
        self.align_ema
            .update(&ce_align.detach().to_vec1::<f32>()?, indices)?;

        let norm_conflict = self.conflict_ema.normalized(indices)?;
        let norm_align = self.align_ema.normalized(indices)?;
        let weight = loss_weights(&norm_align, &norm_conflict);
        let loss_weight = Tensor::from_vec(weight, indices.len(), x.device())?;

        let conflict_loss = ce_conflict.mul(&loss_weight)?;
        let align_loss = self.bias_criterion.forward(&pred_align, label)?;

        Ok(DisentangleOutput {
            z_l,
            z_b,
            conflict_loss,
            align_loss,
            loss_weight,
        })
    }
}
