//! Training and validation reporting

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::validation::ValidationReport;

/// Periodic training log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub iteration: usize,
    pub total_iter: usize,
    pub elapsed: String,
    pub lr: f64,
    pub dis_conflict: f32,
    pub dis_align: f32,
    pub swap_conflict: f32,
    pub swap_align: f32,
    pub loss_weight: f32,
}

/// `H:MM:SS`, seconds truncated.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub trait Reporter {
    fn log_step(&mut self, record: &StepRecord) -> Result<()>;

    /// `which` is `bias`, `debias`, `bias_test` or `debias_test`.
    fn report_validation(&mut self, report: &ValidationReport, iteration: usize, which: &str) -> Result<()>;

    /// Called once per finished iteration.
    fn on_iteration(&mut self, _iteration: usize, _total: usize) {}

    /// Free-form status line (checkpoint saved, interrupted, ...).
    fn note(&mut self, message: &str) {
        tracing::info!("{}", message);
    }
}

#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn log_step(&mut self, r: &StepRecord) -> Result<()> {
        tracing::info!(
            "Elapsed time [{}], Iteration [{}/{}], LR [{:.4}] dis_conflict: [{:.6}] dis_align: [{:.6}] swap_conflict: [{:.6}] swap_align: [{:.6}]",
            r.elapsed,
            r.iteration,
            r.total_iter,
            r.lr,
            r.dis_conflict,
            r.dis_align,
            r.swap_conflict,
            r.swap_align,
        );
        tracing::info!("Average loss weight: {:.4}", r.loss_weight);
        Ok(())
    }

    fn report_validation(&mut self, report: &ValidationReport, iteration: usize, which: &str) -> Result<()> {
        tracing::info!(
            "[{}] iter {} | acc {:.4} | bucket mean {:.4} | conflicting {:.4}",
            which,
            iteration,
            report.overall,
            report.bucket_mean,
            report.conflicting
        );
        for bucket in &report.buckets {
            tracing::debug!(
                "[{}] attrs {:?}: {:.4} ({} samples)",
                which,
                bucket.attributes,
                bucket.accuracy,
                bucket.count
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationEntry {
    pub iteration: usize,
    pub which: String,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    pub steps: Vec<StepRecord>,
    pub validations: Vec<ValidationEntry>,
    pub best_debias_acc: Option<f64>,
    pub best_debias_iter: Option<usize>,
}

/// Tracing output plus a `training_log.json` rewritten on every record.
pub struct RunLogReporter {
    path: PathBuf,
    log: RunLog,
    inner: TracingReporter,
}

impl RunLogReporter {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        Ok(Self {
            path: dir.join("training_log.json"),
            log: RunLog::default(),
            inner: TracingReporter,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.log)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

impl Reporter for RunLogReporter {
    fn log_step(&mut self, record: &StepRecord) -> Result<()> {
        self.inner.log_step(record)?;
        self.log.steps.push(record.clone());
        self.save()
    }

    fn report_validation(&mut self, report: &ValidationReport, iteration: usize, which: &str) -> Result<()> {
        self.inner.report_validation(report, iteration, which)?;
        if which == "debias" && self.log.best_debias_acc.map_or(true, |best| report.overall > best) {
            self.log.best_debias_acc = Some(report.overall);
            self.log.best_debias_iter = Some(iteration);
            tracing::info!("New best debiased accuracy {:.4} at iteration {}", report.overall, iteration);
        }
        self.log.validations.push(ValidationEntry {
            iteration,
            which: which.to_string(),
            report: report.clone(),
        });
        self.save()
    }
}
