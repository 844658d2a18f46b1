//! featswap core - Candle-based building blocks for debiased classification
//!
//! Configuration, the four network roles, stop-gradient latent handles and
//! the per-sample losses used by the feature-swap solver.

pub mod config;
pub mod latent;
pub mod loss;
pub mod model;
pub mod roles;

pub use config::{ArchKind, DebiasConfig};
pub use latent::{ClassifierInput, LiveLatent, StoppedLatent};
pub use loss::{per_sample_cross_entropy, GeneralizedCrossEntropy};
pub use model::{Classifier, ConvExtractor, FeatureExtractor, MlpExtractor, Networks};
pub use roles::{NetRole, Roles};

/// featswap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
