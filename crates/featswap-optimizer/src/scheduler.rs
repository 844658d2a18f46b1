//! Step-decay learning-rate schedule

use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

/// `lr = base_lr * gamma^(floor(step / step_size))`, stepped once per
/// training iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    current_step: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            current_step: 0,
        }
    }

    /// Advance one iteration and push the new rate into the optimizer.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    pub fn get_lr(&self) -> f64 {
        let decays = (self.current_step / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_nn::{AdamW, ParamsAdamW};

    #[test]
    fn test_decays_every_step_size() -> candle_core::Result<()> {
        let mut opt = AdamW::new(
            vec![],
            ParamsAdamW {
                lr: 0.1,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        let mut sched = StepLr::new(0.1, 3, 0.5);

        let mut seen = Vec::new();
        for _ in 0..7 {
            sched.step(&mut opt);
            seen.push(opt.learning_rate());
        }
        let expected = [0.1, 0.1, 0.05, 0.05, 0.05, 0.025, 0.025];
        for (lr, want) in seen.iter().zip(expected) {
            assert_relative_eq!(*lr, want, epsilon = 1e-12);
        }
        assert_eq!(sched.current_step(), 7);
        Ok(())
    }
}
