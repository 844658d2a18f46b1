//! Feature extractors and classifiers
//!
//! Two extractors produce `z_l` and `z_b` from the same image, two linear
//! classifiers read the concatenated `[z_l, z_b]`. Each module is built on
//! its own `VarMap` so it can be optimized and checkpointed independently.

use candle_core::{DType, Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder, VarMap};

use crate::config::{ArchKind, DebiasConfig};
use crate::latent::{ClassifierInput, LiveLatent};
use crate::roles::Roles;

/// Anything that maps an image batch to a `[batch, feature_dim]` latent.
pub trait FeatureExtractor {
    /// `train` enables stochastic regularization (dropout).
    fn extract(&self, x: &Tensor, train: bool) -> Result<Tensor>;

    fn feature_dim(&self) -> usize;
}

/// Fully connected extractor over flattened pixels.
pub struct MlpExtractor {
    layers: Vec<Linear>,
    dropout: Dropout,
    feature_dim: usize,
}

impl MlpExtractor {
    pub fn new(input_dim: usize, hidden: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let layers = vec![
            candle_nn::linear(input_dim, hidden, vb.pp("fc1"))?,
            candle_nn::linear(hidden, hidden, vb.pp("fc2"))?,
            candle_nn::linear(hidden, hidden, vb.pp("fc3"))?,
        ];
        Ok(Self {
            layers,
            dropout: Dropout::new(dropout as f32),
            feature_dim: hidden,
        })
    }
}

impl FeatureExtractor for MlpExtractor {
    fn extract(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.flatten_from(1)?;
        for layer in &self.layers {
            h = layer.forward(&h)?.relu()?;
            h = self.dropout.forward_t(&h, train)?;
        }
        Ok(h)
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

/// Three stride-2 convolutions followed by global average pooling.
pub struct ConvExtractor {
    convs: Vec<Conv2d>,
    dropout: Dropout,
    feature_dim: usize,
}

impl ConvExtractor {
    pub fn new(in_channels: usize, feature_dim: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let widths = [in_channels, feature_dim / 4, feature_dim / 2, feature_dim];
        let mut convs = Vec::with_capacity(3);
        for (i, pair) in widths.windows(2).enumerate() {
            convs.push(candle_nn::conv2d(
                pair[0].max(1),
                pair[1].max(1),
                3,
                cfg,
                vb.pp(format!("conv{}", i + 1)),
            )?);
        }
        Ok(Self {
            convs,
            dropout: Dropout::new(dropout as f32),
            feature_dim,
        })
    }
}

impl FeatureExtractor for ConvExtractor {
    fn extract(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for conv in &self.convs {
            h = conv.forward(&h)?.relu()?;
        }
        // [B, C, H, W] -> [B, C]
        let pooled = h.mean(D::Minus1)?.mean(D::Minus1)?;
        self.dropout.forward_t(&pooled, train)
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

/// Linear head over `[z_l, z_b]`.
pub struct Classifier {
    head: Linear,
}

impl Classifier {
    pub fn new(latent_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            head: candle_nn::linear(latent_dim, num_classes, vb.pp("fc"))?,
        })
    }

    /// Unnormalized class scores.
    pub fn forward(&self, input: &ClassifierInput) -> Result<Tensor> {
        self.head.forward(input.tensor())
    }
}

/// The four modules of the solver plus their train/eval mode.
pub struct Networks {
    pub biased_f: Box<dyn FeatureExtractor>,
    pub debiased_f: Box<dyn FeatureExtractor>,
    pub biased_c: Classifier,
    pub debiased_c: Classifier,
    train: bool,
}

impl Networks {
    /// Build all four modules, each on the var map of its role.
    pub fn new(config: &DebiasConfig, varmaps: &Roles<VarMap>, device: &Device) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let biased_f = build_extractor(config, role_vb(&varmaps.biased_f, device))?;
        let debiased_f = build_extractor(config, role_vb(&varmaps.debiased_f, device))?;
        let latent_dim = biased_f.feature_dim() + debiased_f.feature_dim();

        Ok(Self {
            biased_f,
            debiased_f,
            biased_c: Classifier::new(latent_dim, config.num_classes, role_vb(&varmaps.biased_c, device))?,
            debiased_c: Classifier::new(
                latent_dim,
                config.num_classes,
                role_vb(&varmaps.debiased_c, device),
            )?,
            train: true,
        })
    }

    /// `(z_l, z_b)` for a batch, in the current mode.
    pub fn extract(&self, x: &Tensor) -> Result<(LiveLatent, LiveLatent)> {
        let z_l = self.debiased_f.extract(x, self.train)?;
        let z_b = self.biased_f.extract(x, self.train)?;
        Ok((LiveLatent::new(z_l), LiveLatent::new(z_b)))
    }

    pub fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    pub fn is_training(&self) -> bool {
        self.train
    }
}

fn role_vb<'a>(map: &VarMap, device: &Device) -> VarBuilder<'a> {
    VarBuilder::from_varmap(map, DType::F32, device)
}

fn build_extractor(config: &DebiasConfig, vb: VarBuilder) -> Result<Box<dyn FeatureExtractor>> {
    Ok(match config.arch {
        ArchKind::Mlp => Box::new(MlpExtractor::new(
            config.input_numel(),
            config.feature_dim,
            config.dropout,
            vb,
        )?),
        ArchKind::Conv => Box::new(ConvExtractor::new(
            config.image_channels,
            config.feature_dim,
            config.dropout,
            vb,
        )?),
    })
}
