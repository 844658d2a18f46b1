//! Train subcommand - Full feature-swap training pipeline
//!
//! Supports:
//! - Image-folder or synthetic data
//! - Optional unsupervised source (--unsup-dir or --labeled-ratio)
//! - Auto-save on SIGTERM/SIGINT at the next iteration boundary
//! - Periodic checkpointing, logging and validation from the config

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use featswap_training::{
    CheckpointStore, DataLoader, FeatureSwapTrainer, FetchMode, InMemoryDataset, InputCycle, Reporter,
    RunLogReporter, StepRecord, ValidationReport,
};

use crate::setup;
use crate::CommonArgs;

pub struct TrainOptions {
    pub common: CommonArgs,
    pub train_dir: Option<PathBuf>,
    pub unsup_dir: Option<PathBuf>,
    pub labeled_ratio: Option<f64>,
    pub mode: String,
    pub total_iter: Option<usize>,
    pub swap_iter: Option<usize>,
    pub lr: Option<f64>,
    pub lambda_dis_align: Option<f64>,
    pub lambda_swap: Option<f64>,
    pub lambda_swap_align: Option<f64>,
    pub no_lr_scheduling: bool,
    pub no_progress: bool,
}

/// Run log plus a progress bar; log lines are printed above the bar.
struct ProgressReporter {
    inner: RunLogReporter,
    pb: ProgressBar,
}

impl Reporter for ProgressReporter {
    fn log_step(&mut self, record: &StepRecord) -> Result<()> {
        self.pb.set_message(format!(
            "dis {:.4}/{:.4} swap {:.4}/{:.4} w {:.3}",
            record.dis_conflict, record.dis_align, record.swap_conflict, record.swap_align, record.loss_weight
        ));
        let inner = &mut self.inner;
        self.pb.suspend(|| inner.log_step(record))
    }

    fn report_validation(&mut self, report: &ValidationReport, iteration: usize, which: &str) -> Result<()> {
        let inner = &mut self.inner;
        self.pb.suspend(|| inner.report_validation(report, iteration, which))
    }

    fn on_iteration(&mut self, iteration: usize, _total: usize) {
        self.pb.set_position(iteration as u64);
    }

    fn note(&mut self, message: &str) {
        self.pb.suspend(|| tracing::info!("{}", message));
    }
}

pub fn run(opts: TrainOptions) -> Result<()> {
    println!("\n=== Feature-swap Training ===\n");

    // Setup SIGTERM/SIGINT handler for graceful shutdown
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n  SIGTERM/SIGINT received! Saving checkpoint before exit...");
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .ok();

    // 1. Device and configuration
    let device = setup::select_device()?;
    let mut config = setup::resolve_config(&opts.common)?;
    if let Some(v) = opts.total_iter {
        config.total_iter = v;
    }
    if let Some(v) = opts.swap_iter {
        config.swap_iter = v;
    }
    if let Some(v) = opts.lr {
        config.lr = v;
    }
    if let Some(v) = opts.lambda_dis_align {
        config.lambda_dis_align = v;
    }
    if let Some(v) = opts.lambda_swap {
        config.lambda_swap = v;
    }
    if let Some(v) = opts.lambda_swap_align {
        config.lambda_swap_align = v;
    }
    if opts.no_lr_scheduling {
        config.do_lr_scheduling = false;
    }
    config.validate()?;

    let mode = FetchMode::resolve(&opts.mode, config.num_classes, FetchMode::DEFAULT_SPATIAL)?;

    std::fs::create_dir_all(&opts.common.output_dir)
        .with_context(|| format!("creating {}", opts.common.output_dir.display()))?;
    let config_path = opts.common.output_dir.join("config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

    println!("  Preset: {}", opts.common.preset);
    println!("  Arch: {:?}, feature dim: {}", config.arch, config.feature_dim);
    println!("  Iterations: {} (swap after {})", config.total_iter, config.swap_iter);
    println!("  Batch size: {}, LR: {:.1e}", config.batch_size, config.lr);
    println!(
        "  Lambdas: dis_align {}, swap {}, swap_align {}",
        config.lambda_dis_align, config.lambda_swap, config.lambda_swap_align
    );

    // 2. Data
    let train = setup::load_split(opts.train_dir.as_deref(), &config, &opts.common, config.seed)?;
    let valid = setup::load_split(
        opts.common.valid_dir.as_deref(),
        &config,
        &opts.common,
        config.seed.wrapping_add(1),
    )?;

    let (sup, unsup) = match (opts.labeled_ratio, &opts.unsup_dir) {
        (Some(_), Some(_)) => anyhow::bail!("--labeled-ratio and --unsup-dir are mutually exclusive"),
        (Some(ratio), None) => {
            let (labeled, unlabeled) = train.split_labeled(ratio, config.seed)?;
            println!("  Labeled: {}, unlabeled: {}", labeled.len(), unlabeled.len());
            (labeled, (!unlabeled.is_empty()).then_some(unlabeled))
        }
        (None, Some(dir)) => {
            let unlabeled = InMemoryDataset::load_image_folder(dir, config.image_size as u32, config.image_channels)
                .with_context(|| format!("loading unsupervised images from {}", dir.display()))?;
            (train, Some(unlabeled))
        }
        (None, None) => (train, None),
    };
    let sup = Arc::new(sup);

    // 3. Trainer, input cycle, store, reporter
    let mut trainer = FeatureSwapTrainer::new(config.clone(), device.clone())?;
    trainer.set_loss_ema(&sup.y_array())?;

    let loader = DataLoader::new(Arc::clone(&sup), config.batch_size, device.clone()).shuffled(config.seed);
    let mut cycle = InputCycle::new(Box::new(loader), mode, device.clone()).with_seed(config.seed);
    if let Some(unsup) = unsup {
        let unsup_loader =
            DataLoader::new(Arc::new(unsup), config.batch_size, device.clone()).shuffled(config.seed.wrapping_add(2));
        cycle = cycle.with_unsupervised(Box::new(unsup_loader));
    }
    let val_loader = DataLoader::new(Arc::new(valid), config.batch_size, device.clone());

    let store = CheckpointStore::new(opts.common.output_dir.join("checkpoints"));
    let pb = if opts.no_progress {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(config.total_iter as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar().template("  {bar:30.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")?,
    );
    let mut reporter = ProgressReporter {
        inner: RunLogReporter::new(&opts.common.output_dir)?,
        pb,
    };

    println!("  Samples: {}, mode: {}\n", sup.len(), mode);

    // 4. Train
    let outcome = trainer.train(&mut cycle, &val_loader, &store, &mut reporter, &shutdown)?;
    reporter.pb.finish_and_clear();

    if outcome.interrupted {
        println!("\n  Training interrupted at iteration {}", outcome.iterations);
    } else {
        println!("\n=== Training Complete ===");
    }
    println!("  Checkpoints: {}", store.dir().display());
    println!("  Training log: {}", reporter.inner.path().display());
    if let (Some(acc), Some(iter)) = (reporter.inner.log().best_debias_acc, reporter.inner.log().best_debias_iter) {
        println!("  Best debiased accuracy: {:.4} (iteration {})", acc, iter);
    }
    println!("  Supervised epochs: {}", cycle.epochs_started());

    Ok(())
}
