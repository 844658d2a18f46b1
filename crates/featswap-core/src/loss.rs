//! Per-sample classification losses
//!
//! Both losses return one value per example; reduction is left to the
//! caller because the trainer reweights before averaging.

use candle_core::{Result, Tensor, D};
use serde::{Deserialize, Serialize};

/// Cross-entropy per example: `-log softmax(logits)[y]`.
///
/// `logits`: [batch, num_classes], `labels`: [batch] (u32).
pub fn per_sample_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    log_probs
        .gather(&labels.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()
}

/// Generalized cross-entropy.
///
/// `GCE(x, y) = CE(x, y) * q * p_y^q` with `p_y` detached, so the factor
/// only rescales the CE gradient. Examples the classifier already finds
/// easy (`p_y -> 1`) keep their full CE gradient while hard ones are damped,
/// which is what lets the biased branch latch onto the shortcut.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeneralizedCrossEntropy {
    pub q: f64,
}

impl Default for GeneralizedCrossEntropy {
    fn default() -> Self {
        Self { q: 0.7 }
    }
}

impl GeneralizedCrossEntropy {
    pub fn new(q: f64) -> Self {
        Self { q }
    }

    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let probs = candle_nn::ops::softmax(&logits.detach(), D::Minus1)?;
        let p_y = probs.gather(&labels.unsqueeze(1)?, 1)?.squeeze(1)?;
        // Weight is 0 where p_y underflows to 0.
        let weight = (p_y.powf(self.q)? * self.q)?;
        per_sample_cross_entropy(logits, labels)?.mul(&weight)
    }
}
