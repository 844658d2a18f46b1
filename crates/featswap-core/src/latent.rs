//! Latent handles for the two extractor roles.
//!
//! A classifier never sees a raw tensor: its input is a `ClassifierInput`
//! that can only be assembled from one live latent and one stopped latent
//! (or two stopped ones at inference time). The live half is the only path
//! gradients take back into an extractor, so the debiased classifier can
//! train `z_l` alone and the biased classifier `z_b` alone.

use candle_core::{Result, Tensor};

/// Latent that still carries gradient history to its extractor.
#[derive(Debug, Clone)]
pub struct LiveLatent(Tensor);

/// Latent cut from the autograd graph.
#[derive(Debug, Clone)]
pub struct StoppedLatent(Tensor);

impl LiveLatent {
    pub fn new(tensor: Tensor) -> Self {
        Self(tensor)
    }

    /// Stop-gradient copy of this latent.
    pub fn stop(&self) -> StoppedLatent {
        StoppedLatent(self.0.detach())
    }

    /// Reorder rows along the batch dimension. Gradients flow through the
    /// gather back into the original rows.
    pub fn permute_rows(&self, permutation: &Tensor) -> Result<Self> {
        Ok(Self(self.0.index_select(permutation, 0)?))
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn batch_size(&self) -> Result<usize> {
        self.0.dim(0)
    }
}

impl StoppedLatent {
    pub fn tensor(&self) -> &Tensor {
        &self.0
    }
}

/// Concatenated `[z_l, z_b]` fed to a classifier.
#[derive(Debug, Clone)]
pub struct ClassifierInput(Tensor);

impl ClassifierInput {
    /// Input for the debiased classifier: only `z_l` is trained through it.
    pub fn conflict(z_l: &LiveLatent, z_b: &StoppedLatent) -> Result<Self> {
        Ok(Self(Tensor::cat(&[z_l.tensor(), z_b.tensor()], 1)?))
    }

    /// Input for the biased classifier: only `z_b` is trained through it.
    pub fn align(z_l: &StoppedLatent, z_b: &LiveLatent) -> Result<Self> {
        Ok(Self(Tensor::cat(&[z_l.tensor(), z_b.tensor()], 1)?))
    }

    /// Gradient-free input for evaluation.
    pub fn inference(z_l: &StoppedLatent, z_b: &StoppedLatent) -> Result<Self> {
        Ok(Self(Tensor::cat(&[z_l.tensor(), z_b.tensor()], 1)?))
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }
}
