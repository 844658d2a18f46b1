//! featswap training pipeline
//!
//! Data sources, the unbounded input cycle, per-sample loss tracking,
//! the disentanglement and swap passes, validation, checkpoints and the
//! training loop that ties them together.

pub mod checkpoint;
pub mod dataset;
pub mod disentangle;
pub mod error;
pub mod input_cycle;
pub mod meter;
pub mod reporter;
pub mod swap;
pub mod tracker;
pub mod trainer;
pub mod validation;

pub use checkpoint::{CheckpointSelector, CheckpointStore};
pub use dataset::{Batch, BatchSource, DataLoader, Example, InMemoryDataset};
pub use disentangle::{DisentangleOutput, DisentanglementStep};
pub use error::{DebiasError, DebiasResult};
pub use input_cycle::{Counterfactual, FetchMode, Fetched, InputCycle};
pub use meter::AttributewiseAccuracyMeter;
pub use reporter::{Reporter, RunLogReporter, StepRecord, TracingReporter};
pub use swap::{SwapAugmentationStep, SwapOutput};
pub use tracker::PerSampleLossTracker;
pub use trainer::{FeatureSwapTrainer, StepLosses, TrainOutcome, DEBIAS_TAG, INTERRUPTED_TAG};
pub use validation::{ValidationPass, ValidationReport, ValidationResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
