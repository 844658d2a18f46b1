//! featswap optimizer
//!
//! Step-decay schedule applied to each of the solver's four `AdamW`
//! optimizers.

pub mod scheduler;

pub use scheduler::StepLr;

/// Optimizer crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
