//! Eval subcommand - restore a checkpoint and report test accuracy

use anyhow::Result;
use std::sync::Arc;

use featswap_training::{CheckpointSelector, CheckpointStore, DataLoader, FeatureSwapTrainer, TracingReporter};

use crate::setup;
use crate::CommonArgs;

pub fn run(common: CommonArgs, checkpoint_step: usize, tag: String) -> Result<()> {
    println!("\n=== Feature-swap Evaluation ===\n");

    let device = setup::select_device()?;
    let config = setup::resolve_config(&common)?;
    config.validate()?;

    let valid = setup::load_split(common.valid_dir.as_deref(), &config, &common, config.seed.wrapping_add(1))?;
    let val_loader = DataLoader::new(Arc::new(valid), config.batch_size, device.clone());

    let store = CheckpointStore::new(common.output_dir.join("checkpoints"));
    let selector = CheckpointSelector::new(checkpoint_step, tag);
    println!("  Checkpoint: {} in {}", selector, store.dir().display());

    let mut trainer = FeatureSwapTrainer::new(config, device)?;
    let result = trainer.evaluate(&selector, &val_loader, &store, &mut TracingReporter)?;

    println!("\n  Biased classifier:   acc {:.4}, conflicting {:.4}", result.bias.overall, result.bias.conflicting);
    println!(
        "  Debiased classifier: acc {:.4}, conflicting {:.4}",
        result.debias.overall, result.debias.conflicting
    );
    for bucket in &result.debias.buckets {
        println!(
            "    attrs {:?}: {:.4} ({} samples)",
            bucket.attributes, bucket.accuracy, bucket.count
        );
    }

    let out = common
        .output_dir
        .join(format!("eval_{}.json", selector));
    std::fs::write(&out, serde_json::to_string_pretty(&result)?)?;
    println!("\n  Report: {}", out.display());

    Ok(())
}
