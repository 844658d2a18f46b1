//! Device, configuration and dataset resolution shared by the subcommands

use anyhow::{Context, Result};
use candle_core::Device;
use featswap_core::DebiasConfig;
use featswap_training::InMemoryDataset;
use std::path::Path;

use crate::CommonArgs;

pub fn select_device() -> Result<Device> {
    let device = Device::cuda_if_available(0)?;
    if device.is_cuda() {
        tracing::info!("CUDA available, using GPU");
    } else {
        tracing::info!("No CUDA, using CPU");
    }
    Ok(device)
}

/// Preset (or JSON file) plus the overrides common to every subcommand.
pub fn resolve_config(common: &CommonArgs) -> Result<DebiasConfig> {
    let mut config = match &common.config {
        Some(path) => DebiasConfig::from_json_file(path)?,
        None => DebiasConfig::preset(&common.preset).with_context(|| {
            format!(
                "Unknown preset: {}. Use: cmnist, cifar10c, bffhq, tiny",
                common.preset
            )
        })?,
    };
    if let Some(batch_size) = common.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(seed) = common.seed {
        config.seed = seed;
    }
    Ok(config)
}

/// Images under `dir`, or a synthetic biased set of `synthetic_size`.
pub fn load_split(
    dir: Option<&Path>,
    config: &DebiasConfig,
    common: &CommonArgs,
    seed: u64,
) -> Result<InMemoryDataset> {
    match dir {
        Some(dir) => {
            let ds = InMemoryDataset::load_image_folder(dir, config.image_size as u32, config.image_channels)
                .with_context(|| format!("loading images from {}", dir.display()))?;
            tracing::info!(
                "Loaded {} images from {} ({:.1}% bias-conflicting)",
                ds.len(),
                dir.display(),
                100.0 * ds.conflict_ratio()
            );
            Ok(ds)
        }
        None => {
            if config.image_channels != 3 {
                anyhow::bail!(
                    "synthetic data is 3-channel; config asks for {} channels",
                    config.image_channels
                );
            }
            let ds = InMemoryDataset::synthetic_biased(
                common.synthetic_size,
                config.num_classes,
                common.conflict_ratio,
                config.image_size,
                seed,
            )?;
            tracing::info!(
                "Generated {} synthetic examples ({:.1}% bias-conflicting)",
                ds.len(),
                100.0 * ds.conflict_ratio()
            );
            Ok(ds)
        }
    }
}
