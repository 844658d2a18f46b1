//! End-to-end checks of the feature-swap training loop on tiny data.

use anyhow::Result;
use candle_core::Device;
use featswap_core::DebiasConfig;
use featswap_training::{
    CheckpointSelector, CheckpointStore, DataLoader, DebiasError, Example, FeatureSwapTrainer,
    FetchMode, InMemoryDataset, InputCycle, RunLogReporter, TracingReporter, DEBIAS_TAG,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Targets [0, 1, 0, 1], biases [0, 0, 1, 1].
fn four_example_dataset() -> Result<InMemoryDataset> {
    let attrs = [[0u32, 0], [1, 0], [0, 1], [1, 1]];
    let examples = attrs
        .iter()
        .enumerate()
        .map(|(i, a)| Example {
            index: i,
            image: (0..3 * 8 * 8).map(|p| ((p + i * 7) % 11) as f32 / 10.0).collect(),
            attributes: *a,
            filename: format!("{i}_{}_{}.png", a[0], a[1]),
        })
        .collect();
    Ok(InMemoryDataset::new(examples, [3, 8, 8])?)
}

#[test]
fn one_step_on_four_examples_updates_every_tracker_entry() -> Result<()> {
    let ds = four_example_dataset()?;
    let mut trainer = FeatureSwapTrainer::new(DebiasConfig::tiny(), Device::Cpu)?;
    trainer.set_loss_ema(&ds.y_array())?;

    let batch = ds.collate(&[0, 1, 2, 3], &Device::Cpu)?;
    let losses = trainer.train_step(0, &batch)?;

    assert!(losses.is_finite(), "{losses:?}");
    assert!(losses.dis_conflict > 0.0);
    assert!(losses.dis_align > 0.0);
    assert!((0.0..=1.0).contains(&losses.loss_weight));

    let dis = trainer.disentangle().expect("trackers built");
    for tracker in [dis.align_tracker(), dis.conflict_tracker()] {
        assert_eq!(tracker.touched().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        for i in 0..4 {
            assert_eq!(tracker.times_updated(i), 1);
            assert!(tracker.ema(i).is_some_and(|v| v.is_finite() && v > 0.0));
        }
    }
    Ok(())
}

#[test]
fn swap_terms_are_zero_during_warmup() -> Result<()> {
    let config = DebiasConfig::tiny().with_swap_iter(100).with_total_iter(200);
    let ds = InMemoryDataset::synthetic_biased(16, 2, 0.2, 8, 4)?;
    let mut trainer = FeatureSwapTrainer::new(config, Device::Cpu)?;
    trainer.set_loss_ema(&ds.y_array())?;
    let batch = ds.collate(&[0, 1, 2, 3, 4, 5], &Device::Cpu)?;

    let at_50 = trainer.train_step(50, &batch)?;
    assert!(!at_50.swapped);
    assert_eq!(at_50.swap_conflict, 0.0);
    assert_eq!(at_50.swap_align, 0.0);

    let at_150 = trainer.train_step(150, &batch)?;
    assert!(at_150.swapped);
    assert!(at_150.swap_conflict != 0.0 || at_150.swap_align != 0.0);
    assert!(at_150.is_finite());
    Ok(())
}

#[test]
fn full_run_checkpoints_and_evaluates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = DebiasConfig::tiny().with_total_iter(12).with_swap_iter(4);
    let save_every = config.save_every;

    let train = Arc::new(InMemoryDataset::synthetic_biased(12, 2, 0.1, 8, 7)?);
    let valid = Arc::new(InMemoryDataset::synthetic_biased(6, 2, 0.5, 8, 8)?);

    let mut trainer = FeatureSwapTrainer::new(config.clone(), Device::Cpu)?;
    trainer.set_loss_ema(&train.y_array())?;

    let source = DataLoader::new(Arc::clone(&train), 5, Device::Cpu).shuffled(1);
    let mut cycle = InputCycle::new(Box::new(source), FetchMode::Supervised, Device::Cpu);
    let val = DataLoader::new(Arc::clone(&valid), 4, Device::Cpu);
    let store = CheckpointStore::new(dir.path().join("ckpt"));
    let mut reporter = RunLogReporter::new(dir.path())?;

    let outcome = trainer.train(&mut cycle, &val, &store, &mut reporter, &AtomicBool::new(false))?;
    assert!(!outcome.interrupted);
    assert_eq!(outcome.iterations, 12);
    // 12 pulls of 5-example batches over 12 examples: 3 batches per epoch.
    assert_eq!(cycle.epochs_started(), 4);

    assert!(store.exists(save_every, DEBIAS_TAG));
    assert!(store.exists(12, DEBIAS_TAG));
    assert_eq!(reporter.log().steps.len(), 12 / config.print_every);
    assert!(reporter.log().best_debias_acc.is_some());

    let mut fresh = FeatureSwapTrainer::new(config, Device::Cpu)?;
    let selected = CheckpointSelector::new(12, DEBIAS_TAG);
    let restored = fresh.evaluate(&selected, &val, &store, &mut TracingReporter)?;
    let trained = trainer.validate(&val)?;
    assert_eq!(restored.debias.overall, trained.debias.overall);
    assert_eq!(restored.bias.overall, trained.bias.overall);
    Ok(())
}

#[test]
fn evaluating_a_missing_checkpoint_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path());
    let val = DataLoader::new(
        Arc::new(InMemoryDataset::synthetic_biased(4, 2, 0.5, 8, 2)?),
        4,
        Device::Cpu,
    );
    let mut trainer = FeatureSwapTrainer::new(DebiasConfig::tiny(), Device::Cpu)?;

    let err = trainer
        .evaluate(&CheckpointSelector::new(15000, DEBIAS_TAG), &val, &store, &mut TracingReporter)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DebiasError>(),
        Some(DebiasError::CheckpointNotFound { .. })
    ));
    Ok(())
}

#[test]
fn training_without_labels_is_rejected() -> Result<()> {
    let ds = Arc::new(InMemoryDataset::synthetic_biased(4, 2, 0.0, 8, 2)?);
    let mut trainer = FeatureSwapTrainer::new(DebiasConfig::tiny(), Device::Cpu)?;
    let mut cycle = InputCycle::new(
        Box::new(DataLoader::new(Arc::clone(&ds), 2, Device::Cpu)),
        FetchMode::Supervised,
        Device::Cpu,
    );
    let val = DataLoader::new(ds, 2, Device::Cpu);
    let dir = tempfile::tempdir()?;
    let store = CheckpointStore::new(dir.path());

    let err = trainer
        .train(&mut cycle, &val, &store, &mut TracingReporter, &AtomicBool::new(false))
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<DebiasError>(), Some(DebiasError::MissingLabels)));

    assert!(matches!(
        trainer.set_loss_ema(&[]).unwrap_err().downcast_ref::<DebiasError>(),
        Some(DebiasError::MissingLabels)
    ));
    Ok(())
}
