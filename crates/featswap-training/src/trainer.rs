//! Training orchestration
//!
//! Four modules, four AdamW optimizers and one backward pass per iteration.
//! The swap term joins the objective once `i + 1 > swap_iter`; before that
//! it is a real zero tensor so every record has the same shape.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use featswap_core::{DebiasConfig, Networks, Roles};
use featswap_optimizer::StepLr;

use crate::checkpoint::{CheckpointSelector, CheckpointStore};
use crate::dataset::{Batch, BatchSource};
use crate::disentangle::DisentanglementStep;
use crate::error::DebiasError;
use crate::input_cycle::InputCycle;
use crate::reporter::{format_elapsed, Reporter, StepRecord};
use crate::swap::SwapAugmentationStep;
use crate::validation::{ValidationPass, ValidationResult};

/// Tag of the periodic and final checkpoints.
pub const DEBIAS_TAG: &str = "debias";
/// Tag of the checkpoint written on shutdown.
pub const INTERRUPTED_TAG: &str = "interrupted";

/// Batch means of one iteration's loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepLosses {
    pub dis_conflict: f32,
    pub dis_align: f32,
    pub swap_conflict: f32,
    pub swap_align: f32,
    pub loss_weight: f32,
    pub total: f32,
    pub swapped: bool,
}

impl StepLosses {
    pub fn is_finite(&self) -> bool {
        [
            self.dis_conflict,
            self.dis_align,
            self.swap_conflict,
            self.swap_align,
            self.loss_weight,
            self.total,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub iterations: usize,
    pub interrupted: bool,
    pub last: Option<StepLosses>,
}

pub struct FeatureSwapTrainer {
    config: DebiasConfig,
    device: Device,
    varmaps: Roles<VarMap>,
    nets: Networks,
    optims: Roles<AdamW>,
    schedulers: Option<Roles<StepLr>>,
    dis: Option<DisentanglementStep>,
    swap: SwapAugmentationStep,
    validation: ValidationPass,
    rng: StdRng,
}

impl FeatureSwapTrainer {
    pub fn new(config: DebiasConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let varmaps = Roles::from_fn(|_| VarMap::new());
        let nets = Networks::new(&config, &varmaps, &device).context("building networks")?;

        let params = ParamsAdamW {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: 1e-8,
            weight_decay: config.weight_decay,
        };
        let optims = varmaps.try_map(|_, map| AdamW::new(map.all_vars(), params.clone()))?;
        let schedulers = config
            .do_lr_scheduling
            .then(|| Roles::from_fn(|_| StepLr::new(config.lr, config.lr_decay_step, config.lr_gamma)));

        let swap = SwapAugmentationStep::new(featswap_core::GeneralizedCrossEntropy::new(config.gce_q));
        let validation = ValidationPass::new(vec![config.num_classes, config.num_classes], device.clone());
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            device,
            varmaps,
            nets,
            optims,
            schedulers,
            dis: None,
            swap,
            validation,
            rng,
        })
    }

    /// Build the per-sample loss trackers from the supervised label array.
    pub fn set_loss_ema(&mut self, labels: &[u32]) -> Result<()> {
        self.dis = Some(DisentanglementStep::new(
            labels,
            self.config.num_classes,
            self.config.ema_alpha as f32,
            self.config.gce_q,
        )?);
        Ok(())
    }

    pub fn config(&self) -> &DebiasConfig {
        &self.config
    }

    pub fn networks(&self) -> &Networks {
        &self.nets
    }

    pub fn varmaps(&self) -> &Roles<VarMap> {
        &self.varmaps
    }

    pub fn disentangle(&self) -> Option<&DisentanglementStep> {
        self.dis.as_ref()
    }

    /// Current rate of the biased extractor's optimizer.
    pub fn learning_rate(&self) -> f64 {
        self.optims.biased_f.learning_rate()
    }

    pub fn learning_rates(&self) -> Roles<f64> {
        self.optims.map(|_, opt| opt.learning_rate())
    }

    /// One forward/backward/update on `batch` at iteration `i` (zero based).
    pub fn train_step(&mut self, i: usize, batch: &Batch) -> Result<StepLosses> {
        let dis = self.dis.as_mut().ok_or(DebiasError::MissingLabels)?;
        let batch = batch.to_device(&self.device)?;
        let label = batch.targets()?;
        let indices = batch.indices_host()?;

        let out = dis.forward(&self.nets, &batch.images, &indices, &label)?;

        let swapped = i + 1 > self.config.swap_iter;
        let (swap_conflict, swap_align) = if swapped {
            let s = self.swap.forward(
                &self.nets,
                &out.z_l,
                &out.z_b,
                &label,
                &out.loss_weight,
                &mut self.rng,
            )?;
            (s.conflict_loss, s.align_loss)
        } else {
            let zero = Tensor::zeros(1, DType::F32, &self.device)?;
            (zero.clone(), zero)
        };

        let dis_conflict = out.conflict_loss.mean_all()?;
        let dis_align = out.align_loss.mean_all()?;
        let swap_conflict = swap_conflict.mean_all()?;
        let swap_align = swap_align.mean_all()?;

        let loss_dis = (&dis_conflict + (&dis_align * self.config.lambda_dis_align)?)?;
        let loss_swap = (&swap_conflict + (&swap_align * self.config.lambda_swap_align)?)?;
        let loss = (loss_dis + (loss_swap * self.config.lambda_swap)?)?;

        let grads = loss.backward()?;
        self.optims
            .try_for_each_mut(|_, opt| opt.step(&grads))?;

        Ok(StepLosses {
            dis_conflict: dis_conflict.to_scalar::<f32>()?,
            dis_align: dis_align.to_scalar::<f32>()?,
            swap_conflict: swap_conflict.to_scalar::<f32>()?,
            swap_align: swap_align.to_scalar::<f32>()?,
            loss_weight: out.loss_weight.mean_all()?.to_scalar::<f32>()?,
            total: loss.to_scalar::<f32>()?,
            swapped,
        })
    }

    /// Advance every scheduler by one iteration.
    pub fn step_schedulers(&mut self) {
        let Some(schedulers) = self.schedulers.as_mut() else {
            return;
        };
        schedulers.biased_f.step(&mut self.optims.biased_f);
        schedulers.debiased_f.step(&mut self.optims.debiased_f);
        schedulers.biased_c.step(&mut self.optims.biased_c);
        schedulers.debiased_c.step(&mut self.optims.debiased_c);
    }

    pub fn validate(&mut self, val_source: &dyn BatchSource) -> Result<ValidationResult> {
        Ok(self.validation.run(&mut self.nets, val_source)?)
    }

    pub fn train(
        &mut self,
        cycle: &mut InputCycle,
        val_source: &dyn BatchSource,
        store: &CheckpointStore,
        reporter: &mut dyn Reporter,
        shutdown: &AtomicBool,
    ) -> Result<TrainOutcome> {
        if self.dis.is_none() {
            return Err(DebiasError::MissingLabels.into());
        }
        let total = self.config.total_iter;
        tracing::info!(
            "=== Start training === {} iterations, swap after {}, {} training examples",
            total,
            self.config.swap_iter,
            cycle.num_examples()
        );

        let start = Instant::now();
        let mut last = None;
        let mut last_saved = None;
        let mut epochs_seen = cycle.epochs_started();

        for i in 0..total {
            if shutdown.load(Ordering::SeqCst) {
                store.save(i, INTERRUPTED_TAG, &self.varmaps)?;
                reporter.note(&format!(
                    "Training interrupted at iteration {}; checkpoint saved to {}",
                    i,
                    store.dir().display()
                ));
                return Ok(TrainOutcome {
                    iterations: i,
                    interrupted: true,
                    last,
                });
            }

            let fetched = cycle.next()?;
            if cycle.epochs_started() != epochs_seen {
                epochs_seen = cycle.epochs_started();
                tracing::debug!(epoch = epochs_seen, iteration = i, "supervised source restarted");
            }

            let losses = self
                .train_step(i, &fetched.batch)
                .with_context(|| format!("iteration {}", i + 1))?;
            if !losses.is_finite() {
                tracing::warn!(iteration = i + 1, "non-finite loss: {:?}", losses);
            }
            last = Some(losses);
            let iteration = i + 1;

            if iteration % self.config.print_every == 0 {
                reporter.log_step(&StepRecord {
                    iteration,
                    total_iter: total,
                    elapsed: format_elapsed(start.elapsed()),
                    lr: self.learning_rate(),
                    dis_conflict: losses.dis_conflict,
                    dis_align: losses.dis_align,
                    swap_conflict: losses.swap_conflict,
                    swap_align: losses.swap_align,
                    loss_weight: losses.loss_weight,
                })?;
            }

            if iteration % self.config.save_every == 0 {
                store.save(iteration, DEBIAS_TAG, &self.varmaps)?;
                last_saved = Some(iteration);
            }

            if iteration % self.config.eval_every == 0 {
                let result = self.validate(val_source)?;
                reporter.report_validation(&result.bias, iteration, "bias")?;
                reporter.report_validation(&result.debias, iteration, "debias")?;
            }

            self.step_schedulers();
            reporter.on_iteration(iteration, total);
        }

        if last_saved != Some(total) {
            store.save(total, DEBIAS_TAG, &self.varmaps)?;
        }
        reporter.note(&format!(
            "Training complete: {} iterations in {}",
            total,
            format_elapsed(start.elapsed())
        ));

        Ok(TrainOutcome {
            iterations: total,
            interrupted: false,
            last,
        })
    }

    /// Restore `selector` and report `bias_test` / `debias_test`.
    pub fn evaluate(
        &mut self,
        selector: &CheckpointSelector,
        val_source: &dyn BatchSource,
        store: &CheckpointStore,
        reporter: &mut dyn Reporter,
    ) -> Result<ValidationResult> {
        store
            .load_selected(selector, &mut self.varmaps)
            .with_context(|| format!("loading checkpoint {}", selector))?;

        let result = self.validate(val_source)?;
        reporter.report_validation(&result.bias, selector.step, "bias_test")?;
        reporter.report_validation(&result.debias, selector.step, "debias_test")?;
        Ok(result)
    }
}
