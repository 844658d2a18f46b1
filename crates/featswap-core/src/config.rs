//! Debiasing configuration
//!
//! Hyperparameters for the feature-swap solver, with presets for the
//! benchmark datasets it was tuned on.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Feature extractor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchKind {
    /// Flatten + fully connected layers (colored MNIST).
    Mlp,
    /// Strided convolutions + global average pooling.
    Conv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebiasConfig {
    // Data
    pub num_classes: usize,
    pub image_channels: usize,
    pub image_size: usize,
    pub batch_size: usize,

    // Networks
    pub arch: ArchKind,
    pub feature_dim: usize,
    pub dropout: f64,

    // Schedule
    pub total_iter: usize,
    /// Feature swapping starts once `iteration + 1 > swap_iter`.
    pub swap_iter: usize,
    pub print_every: usize,
    pub save_every: usize,
    pub eval_every: usize,

    // Objective weights
    pub lambda_dis_align: f64,
    pub lambda_swap: f64,
    pub lambda_swap_align: f64,

    // Reweighting
    pub ema_alpha: f64,
    pub gce_q: f64,

    // Optimizer
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub do_lr_scheduling: bool,
    pub lr_decay_step: usize,
    pub lr_gamma: f64,

    pub seed: u64,
}

impl Default for DebiasConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            image_channels: 3,
            image_size: 28,
            batch_size: 256,

            arch: ArchKind::Mlp,
            feature_dim: 100,
            dropout: 0.0,

            total_iter: 50_000,
            swap_iter: 10_000,
            print_every: 500,
            save_every: 500,
            eval_every: 500,

            lambda_dis_align: 1.0,
            lambda_swap: 1.0,
            lambda_swap_align: 1.0,

            ema_alpha: 0.7,
            gce_q: 0.7,

            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            do_lr_scheduling: true,
            lr_decay_step: 10_000,
            lr_gamma: 0.5,

            seed: 7777,
        }
    }
}

impl DebiasConfig {
    /// Colored MNIST: MLP extractors, strong align weighting.
    pub fn cmnist() -> Self {
        Self {
            num_classes: 10,
            image_channels: 3,
            image_size: 28,
            arch: ArchKind::Mlp,
            lr: 1e-2,
            lambda_dis_align: 10.0,
            lambda_swap_align: 10.0,
            ..Default::default()
        }
    }

    /// Corrupted CIFAR-10.
    pub fn cifar10c() -> Self {
        Self {
            num_classes: 10,
            image_channels: 3,
            image_size: 32,
            arch: ArchKind::Conv,
            feature_dim: 256,
            lr: 5e-4,
            lambda_dis_align: 5.0,
            lambda_swap_align: 5.0,
            ..Default::default()
        }
    }

    /// Biased FFHQ (age / gender), binary target.
    pub fn bffhq() -> Self {
        Self {
            num_classes: 2,
            image_channels: 3,
            image_size: 64,
            batch_size: 64,
            arch: ArchKind::Conv,
            feature_dim: 256,
            lr: 1e-4,
            lambda_dis_align: 2.0,
            lambda_swap_align: 2.0,
            lambda_swap: 0.1,
            ..Default::default()
        }
    }

    /// Small everything, for smoke runs and tests.
    pub fn tiny() -> Self {
        Self {
            num_classes: 2,
            image_channels: 3,
            image_size: 8,
            batch_size: 4,
            feature_dim: 8,
            total_iter: 20,
            swap_iter: 10,
            print_every: 5,
            save_every: 10,
            eval_every: 10,
            lr_decay_step: 10,
            ..Default::default()
        }
    }

    /// Look up a preset by dataset name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "cmnist" => Some(Self::cmnist()),
            "cifar10c" => Some(Self::cifar10c()),
            "bffhq" => Some(Self::bffhq()),
            "tiny" | "synthetic" => Some(Self::tiny()),
            _ => None,
        }
    }

    /// Load a full configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Builder: override the swap warm-up threshold.
    pub fn with_swap_iter(mut self, swap_iter: usize) -> Self {
        self.swap_iter = swap_iter;
        self
    }

    /// Builder: override the number of iterations.
    pub fn with_total_iter(mut self, total_iter: usize) -> Self {
        self.total_iter = total_iter;
        self
    }

    /// Width of the concatenated `[z_l, z_b]` classifier input.
    pub fn latent_dim(&self) -> usize {
        2 * self.feature_dim
    }

    /// Flattened size of one input image.
    pub fn input_numel(&self) -> usize {
        self.image_channels * self.image_size * self.image_size
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_classes < 2 {
            anyhow::bail!("num_classes must be at least 2 (got {})", self.num_classes);
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.feature_dim == 0 {
            anyhow::bail!("feature_dim must be positive");
        }
        if self.print_every == 0 || self.save_every == 0 || self.eval_every == 0 {
            anyhow::bail!(
                "print_every ({}), save_every ({}) and eval_every ({}) must be positive",
                self.print_every,
                self.save_every,
                self.eval_every
            );
        }
        if !(0.0..1.0).contains(&self.ema_alpha) {
            anyhow::bail!("ema_alpha must be in [0, 1) (got {})", self.ema_alpha);
        }
        if self.gce_q <= 0.0 {
            anyhow::bail!("gce_q must be positive (got {})", self.gce_q);
        }
        if self.lr <= 0.0 {
            anyhow::bail!("lr must be positive (got {})", self.lr);
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1) (got {})", self.dropout);
        }
        if self.do_lr_scheduling && self.lr_decay_step == 0 {
            anyhow::bail!("lr_decay_step must be positive when scheduling is enabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for name in ["cmnist", "cifar10c", "bffhq", "tiny"] {
            let config = DebiasConfig::preset(name).unwrap();
            assert!(config.validate().is_ok(), "preset {name} should validate");
        }
        assert!(DebiasConfig::preset("imagenet").is_none());
    }

    #[test]
    fn test_validation() {
        let mut invalid = DebiasConfig::tiny();
        invalid.eval_every = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = DebiasConfig::tiny();
        invalid.ema_alpha = 1.0;
        assert!(invalid.validate().is_err());

        let mut invalid = DebiasConfig::tiny();
        invalid.num_classes = 1;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        let config = DebiasConfig::bffhq().with_swap_iter(123);
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;

        let loaded = DebiasConfig::from_json_file(&path)?;
        assert_eq!(loaded.swap_iter, 123);
        assert_eq!(loaded.arch, ArchKind::Conv);
        assert_eq!(loaded.latent_dim(), 512);
        Ok(())
    }
}
