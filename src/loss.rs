use tch::{Reduction, Tensor};

/// libtorch's "no ignore index" sentinel.
const NO_IGNORE: i64 = -100;

/// Mean next-token cross-entropy over every (batch, position) pair.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropy {
    ignore_index: i64,
}

impl Default for CrossEntropy {
    fn default() -> Self {
        CrossEntropy {
            ignore_index: NO_IGNORE,
        }
    }
}

impl CrossEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets equal to `ignore_index` (typically the padding id) add nothing
    /// to the loss or its gradient.
    pub fn with_ignore_index(ignore_index: i64) -> Self {
        CrossEntropy { ignore_index }
    }

    /// `logits` `[batch, seq_len, vocab]`, `targets` `[batch, seq_len]` -> scalar.
    pub fn loss(&self, logits: &Tensor, targets: &Tensor) -> Tensor {
        let vocab = logits.size().last().copied().unwrap_or(1);
        logits.view([-1, vocab]).cross_entropy_loss::<Tensor>(
            &targets.view([-1]),
            None,
            Reduction::Mean,
            self.ignore_index,
            0.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn scalar(t: &Tensor) -> f64 {
        f64::try_from(t).unwrap()
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros([2, 3, 10], (Kind::Float, Device::Cpu));
        let targets = Tensor::from_slice2(&[&[1i64, 2, 3], &[4, 5, 6]]);
        let loss = CrossEntropy::new().loss(&logits, &targets);
        assert!((scalar(&loss) - (10f64).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_confident_correct_prediction_is_near_zero() {
        let targets = Tensor::from_slice2(&[&[1i64, 3]]);
        let logits = targets.one_hot(5).to_kind(Kind::Float) * 50.0;
        let loss = CrossEntropy::new().loss(&logits, &targets);
        assert!(scalar(&loss) < 1e-6);
    }

    #[test]
    fn test_ignored_targets_do_not_count() {
        const PAD: i64 = 1;
        // position 0 is predicted perfectly, position 1 is hopeless but padding
        let logits = Tensor::from_slice(&[50.0f32, 0.0, 0.0, 0.0, 0.0, 50.0]).view([1, 2, 3]);
        let targets = Tensor::from_slice2(&[&[0i64, PAD]]);
        let plain = scalar(&CrossEntropy::new().loss(&logits, &targets));
        let ignoring = scalar(&CrossEntropy::with_ignore_index(PAD).loss(&logits, &targets));
        assert!(plain > 10.0);
        assert!(ignoring < 1e-6);
    }

    #[test]
    fn test_gradient_skips_ignored_positions() {
        const PAD: i64 = 1;
        let logits = Tensor::randn([1, 3, 4], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let targets = Tensor::from_slice2(&[&[2i64, PAD, 3]]);
        CrossEntropy::with_ignore_index(PAD).loss(&logits, &targets).backward();
        let grad = logits.grad();
        assert_eq!(scalar(&grad.get(0).get(1).abs().sum(Kind::Float)), 0.0);
        assert!(scalar(&grad.get(0).get(0).abs().sum(Kind::Float)) > 0.0);
    }
}
