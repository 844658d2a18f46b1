//! Unbounded batch pulls over finite sources
//!
//! An exhausted (or never started) source is restarted transparently; the
//! restart is the only epoch signal. An optional unsupervised source is
//! pulled in lockstep with the supervised one.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use std::str::FromStr;

use crate::dataset::{Batch, BatchSource};
use crate::error::{DebiasError, DebiasResult};

/// How each pull is assembled. Resolved once, when the cycle is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Batch only.
    Supervised,
    /// Batch plus shuffled target-domain labels and their one-hot maps
    /// broadcast to `spatial x spatial`.
    Counterfactual { num_classes: usize, spatial: usize },
}

impl FetchMode {
    pub const DEFAULT_SPATIAL: usize = 16;
    pub const DEFAULT_NUM_CLASSES: usize = 10;

    /// Parse a mode tag with explicit conditioning sizes.
    pub fn resolve(tag: &str, num_classes: usize, spatial: usize) -> DebiasResult<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "test" | "sup" | "supervised" => Ok(Self::Supervised),
            "featureswap" | "ours" | "counterfactual" => Ok(Self::Counterfactual {
                num_classes,
                spatial,
            }),
            _ => Err(DebiasError::UnsupportedMode(tag.to_string())),
        }
    }
}

impl FromStr for FetchMode {
    type Err = DebiasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s, Self::DEFAULT_NUM_CLASSES, Self::DEFAULT_SPATIAL)
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supervised => write!(f, "sup"),
            Self::Counterfactual { .. } => write!(f, "featureswap"),
        }
    }
}

/// Target-domain conditioning for one batch.
#[derive(Debug, Clone)]
pub struct Counterfactual {
    /// Batch targets under a fresh permutation, `[N]` u32.
    pub y_trg: Tensor,
    /// One-hot of the true targets, `[N, C, S, S]`.
    pub c_src: Tensor,
    /// One-hot of `y_trg`, `[N, C, S, S]`.
    pub c_trg: Tensor,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub batch: Batch,
    pub unsup: Option<Batch>,
    pub counterfactual: Option<Counterfactual>,
}

struct Cursor {
    source: Box<dyn BatchSource>,
    active: Option<Box<dyn Iterator<Item = DebiasResult<Batch>>>>,
    epochs: u64,
}

impl Cursor {
    fn new(source: Box<dyn BatchSource>) -> Self {
        Self {
            source,
            active: None,
            epochs: 0,
        }
    }

    fn pull(&mut self) -> DebiasResult<Batch> {
        if let Some(iter) = self.active.as_mut() {
            if let Some(batch) = iter.next() {
                return batch;
            }
        }
        let mut fresh = self.source.epoch()?;
        self.epochs += 1;
        let first = fresh.next().ok_or(DebiasError::EmptySource)?;
        self.active = Some(fresh);
        first
    }
}

pub struct InputCycle {
    sup: Cursor,
    unsup: Option<Cursor>,
    mode: FetchMode,
    rng: StdRng,
    device: Device,
}

impl InputCycle {
    pub fn new(source: Box<dyn BatchSource>, mode: FetchMode, device: Device) -> Self {
        Self {
            sup: Cursor::new(source),
            unsup: None,
            mode,
            rng: StdRng::seed_from_u64(0),
            device,
        }
    }

    /// Pull an unsupervised batch alongside every supervised one.
    pub fn with_unsupervised(mut self, source: Box<dyn BatchSource>) -> Self {
        self.unsup = Some(Cursor::new(source));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    /// Fresh iterators drawn from the supervised source so far.
    pub fn epochs_started(&self) -> u64 {
        self.sup.epochs
    }

    pub fn unsup_epochs_started(&self) -> Option<u64> {
        self.unsup.as_ref().map(|c| c.epochs)
    }

    pub fn num_examples(&self) -> usize {
        self.sup.source.num_examples()
    }

    pub fn next(&mut self) -> DebiasResult<Fetched> {
        let batch = self.sup.pull()?.to_device(&self.device)?;
        let unsup = match self.unsup.as_mut() {
            Some(cursor) => Some(cursor.pull()?.to_device(&self.device)?),
            None => None,
        };
        let counterfactual = match self.mode {
            FetchMode::Supervised => None,
            FetchMode::Counterfactual {
                num_classes,
                spatial,
            } => Some(self.counterfactual(&batch, num_classes, spatial)?),
        };
        Ok(Fetched {
            batch,
            unsup,
            counterfactual,
        })
    }

    fn counterfactual(&mut self, batch: &Batch, num_classes: usize, spatial: usize) -> DebiasResult<Counterfactual> {
        let y = batch.targets()?.to_vec1::<u32>()?;
        let mut y_trg = y.clone();
        y_trg.shuffle(&mut self.rng);

        let c_src = one_hot_map(&y, num_classes, spatial, &self.device)?;
        let c_trg = one_hot_map(&y_trg, num_classes, spatial, &self.device)?;
        let n = y_trg.len();
        Ok(Counterfactual {
            y_trg: Tensor::from_vec(y_trg, n, &self.device)?,
            c_src,
            c_trg,
        })
    }
}

/// `[N]` labels -> `[N, C, S, S]` indicator maps.
pub fn one_hot_map(labels: &[u32], num_classes: usize, spatial: usize, device: &Device) -> DebiasResult<Tensor> {
    let plane = spatial * spatial;
    let mut data = vec![0.0f32; labels.len() * num_classes * plane];
    for (n, &label) in labels.iter().enumerate() {
        let class = label as usize;
        if class >= num_classes {
            return Err(DebiasError::ClassOutOfRange { class, num_classes });
        }
        let start = (n * num_classes + class) * plane;
        data[start..start + plane].fill(1.0);
    }
    Ok(Tensor::from_vec(data, (labels.len(), num_classes, spatial, spatial), device)?)
}
