//! In-batch feature swap
//!
//! Recombines each example's `z_l` with another example's `z_b` and
//! scores the recombinations with the same two classifiers. The conflict
//! path reuses the reweighting computed by the disentanglement pass.

use candle_core::Tensor;
use featswap_core::{per_sample_cross_entropy, ClassifierInput, GeneralizedCrossEntropy, LiveLatent, Networks};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::DebiasResult;

#[derive(Debug, Clone)]
pub struct SwapOutput {
    pub z_b_swap: LiveLatent,
    pub label_swap: Tensor,
    /// `W(z) * CE(C_d([z_l, sg(z_b~)]), y)`
    pub conflict_loss: Tensor,
    /// `GCE(C_b([sg(z_l), z_b~]), y~)`
    pub align_loss: Tensor,
    pub permutation: Vec<u32>,
}

pub struct SwapAugmentationStep {
    bias_criterion: GeneralizedCrossEntropy,
}

impl SwapAugmentationStep {
    pub fn new(bias_criterion: GeneralizedCrossEntropy) -> Self {
        Self { bias_criterion }
    }

    /// Swap under a uniformly drawn permutation of the batch.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        nets: &Networks,
        z_l: &LiveLatent,
        z_b: &LiveLatent,
        label: &Tensor,
        loss_weight: &Tensor,
        rng: &mut R,
    ) -> DebiasResult<SwapOutput> {
        let n = z_b.batch_size()?;
        let mut permutation: Vec<u32> = (0..n as u32).collect();
        permutation.shuffle(rng);
        self.forward_with_permutation(nets, z_l, z_b, label, loss_weight, permutation)
    }

    pub fn forward_with_permutation(
        &self,
        nets: &Networks,
        z_l: &LiveLatent,
        z_b: &LiveLatent,
        label: &Tensor,
        loss_weight: &Tensor,
        permutation: Vec<u32>,
    ) -> DebiasResult<SwapOutput> {
        let perm = Tensor::new(permutation.as_slice(), label.device())?;
        let z_b_swap = z_b.permute_rows(&perm)?;
        let label_swap = label.index_select(&perm, 0)?;

        let pred_mix_conflict = nets
            .debiased_c
            .forward(&ClassifierInput::conflict(z_l, &z_b_swap.stop())?)?;
        let pred_mix_align = nets
            .biased_c
            .forward(&ClassifierInput::align(&z_l.stop(), &z_b_swap)?)?;

        let conflict_loss = per_sample_cross_entropy(&pred_mix_conflict, label)?.mul(loss_weight)?;
        let align_loss = self.bias_criterion.forward(&pred_mix_align, &label_swap)?;

        Ok(SwapOutput {
            z_b_swap,
            label_swap,
            conflict_loss,
            align_loss,
            permutation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disentangle::DisentanglementStep;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use candle_nn::VarMap;
    use featswap_core::{DebiasConfig, Roles};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn eval_nets() -> anyhow::Result<(Networks, Roles<VarMap>)> {
        let mut config = DebiasConfig::tiny();
        config.num_classes = 3;
        let varmaps = Roles::from_fn(|_| VarMap::new());
        let mut nets = Networks::new(&config, &varmaps, &Device::Cpu)?;
        // No dropout so both passes see the same latents.
        nets.set_train(false);
        Ok((nets, varmaps))
    }

    #[test]
    fn test_permutation_is_a_bijection() -> anyhow::Result<()> {
        let (nets, _maps) = eval_nets()?;
        let device = Device::Cpu;
        let x = Tensor::rand(0f32, 1f32, (6, 3, 8, 8), &device)?;
        let y = Tensor::new(&[0u32, 1, 2, 0, 1, 2], &device)?;
        let (z_l, z_b) = nets.extract(&x)?;
        let w = Tensor::ones(6, candle_core::DType::F32, &device)?;

        let swap = SwapAugmentationStep::new(GeneralizedCrossEntropy::default());
        let out = swap.forward(&nets, &z_l, &z_b, &y, &w, &mut StdRng::seed_from_u64(3))?;

        let mut sorted = out.permutation.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);

        let labels = y.to_vec1::<u32>()?;
        let swapped = out.label_swap.to_vec1::<u32>()?;
        for (i, &p) in out.permutation.iter().enumerate() {
            assert_eq!(swapped[i], labels[p as usize]);
        }
        assert_eq!(out.conflict_loss.dims(), &[6]);
        Ok(())
    }

    #[test]
    fn test_identity_swap_matches_plain_losses() -> anyhow::Result<()> {
        let (nets, _maps) = eval_nets()?;
        let device = Device::Cpu;
        let x = Tensor::rand(0f32, 1f32, (4, 3, 8, 8), &device)?;
        let y = Tensor::new(&[0u32, 1, 2, 1], &device)?;

        let mut dis = DisentanglementStep::new(&[0, 1, 2, 1], 3, 0.7, 0.7)?;
        let plain = dis.forward(&nets, &x, &[0, 1, 2, 3], &y)?;

        let swap = SwapAugmentationStep::new(*dis.bias_criterion());
        let out = swap.forward_with_permutation(
            &nets,
            &plain.z_l,
            &plain.z_b,
            &y,
            &plain.loss_weight,
            vec![0, 1, 2, 3],
        )?;

        let a = plain.conflict_loss.to_vec1::<f32>()?;
        let b = out.conflict_loss.to_vec1::<f32>()?;
        for (a, b) in a.iter().zip(&b) {
            assert_relative_eq!(*a, *b, epsilon = 1e-5);
        }
        let a = plain.align_loss.to_vec1::<f32>()?;
        let b = out.align_loss.to_vec1::<f32>()?;
        for (a, b) in a.iter().zip(&b) {
            assert_relative_eq!(*a, *b, epsilon = 1e-5);
        }
        Ok(())
    }
}
