//! featswap CLI - Train and evaluate debiased classifiers
//!
//! Usage:
//!   featswap train --preset cmnist --train-dir data/cmnist/train --valid-dir data/cmnist/valid
//!   featswap train --preset tiny --total-iter 200
//!   featswap eval --preset cmnist --valid-dir data/cmnist/test --checkpoint-step 50000

mod evaluate;
mod setup;
mod train;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "featswap",
    about = "Feature-swap debiasing: train and evaluate bias-robust classifiers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Hyperparameter preset: cmnist, cifar10c, bffhq, tiny
    #[arg(long, default_value = "tiny")]
    pub preset: String,

    /// Full configuration as JSON (overrides --preset)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Batch size override
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Validation images (`*_<target>_<bias>.png`); synthetic data when absent
    #[arg(long)]
    pub valid_dir: Option<PathBuf>,

    /// Number of synthetic examples per split when no directory is given
    #[arg(long, default_value = "512")]
    pub synthetic_size: usize,

    /// Share of bias-conflicting synthetic examples
    #[arg(long, default_value = "0.05")]
    pub conflict_ratio: f64,

    /// Directory for checkpoints and logs
    #[arg(long, default_value = "runs/featswap")]
    pub output_dir: PathBuf,

    /// Random seed override
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the four feature-swap modules
    Train {
        #[command(flatten)]
        common: CommonArgs,

        /// Training images (`*_<target>_<bias>.png`); synthetic data when absent
        #[arg(long)]
        train_dir: Option<PathBuf>,

        /// Unlabeled images pulled alongside each supervised batch
        #[arg(long)]
        unsup_dir: Option<PathBuf>,

        /// Keep only this share of the training set labeled; the rest
        /// becomes the unsupervised source
        #[arg(long)]
        labeled_ratio: Option<f64>,

        /// Fetch mode: sup (plain batches) or featureswap (adds target-domain maps)
        #[arg(long, default_value = "sup")]
        mode: String,

        /// Total iterations override
        #[arg(long)]
        total_iter: Option<usize>,

        /// Iteration after which the swap augmentation starts
        #[arg(long)]
        swap_iter: Option<usize>,

        /// Learning rate override
        #[arg(long)]
        lr: Option<f64>,

        /// Weight of the align-path loss in the disentanglement term
        #[arg(long)]
        lambda_dis_align: Option<f64>,

        /// Weight of the whole swap term
        #[arg(long)]
        lambda_swap: Option<f64>,

        /// Weight of the align-path loss inside the swap term
        #[arg(long)]
        lambda_swap_align: Option<f64>,

        /// Disable step-decay learning-rate scheduling
        #[arg(long)]
        no_lr_scheduling: bool,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Evaluate a saved checkpoint on a validation or test split
    Eval {
        #[command(flatten)]
        common: CommonArgs,

        /// Iteration of the checkpoint to load
        #[arg(long)]
        checkpoint_step: usize,

        /// Tag of the checkpoint to load
        #[arg(long, default_value = "debias")]
        tag: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            common,
            train_dir,
            unsup_dir,
            labeled_ratio,
            mode,
            total_iter,
            swap_iter,
            lr,
            lambda_dis_align,
            lambda_swap,
            lambda_swap_align,
            no_lr_scheduling,
            no_progress,
        } => {
            train::run(train::TrainOptions {
                common,
                train_dir,
                unsup_dir,
                labeled_ratio,
                mode,
                total_iter,
                swap_iter,
                lr,
                lambda_dis_align,
                lambda_swap,
                lambda_swap_align,
                no_lr_scheduling,
                no_progress,
            })?;
        }

        Commands::Eval {
            common,
            checkpoint_step,
            tag,
        } => {
            evaluate::run(common, checkpoint_step, tag)?;
        }
    }

    Ok(())
}
