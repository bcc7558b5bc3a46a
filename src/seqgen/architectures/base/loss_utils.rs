//! Masked loss primitives shared by the reconstruction loss and the
//! embedding predictor.

use burn::tensor::{activation, backend::Backend, ElementConversion, Int, Tensor};

use super::error::ConfigError;

/// Cross-entropy flavour: which label is ignored and how much smoothing is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossEntropySpec {
    pub ignore_index: i64,
    pub label_smoothing: Option<f32>,
}

/// Cross-entropy used inside the full model loss.
pub const MODEL_CROSS_ENTROPY: CrossEntropySpec = CrossEntropySpec {
    ignore_index: 0,
    label_smoothing: Some(0.15),
};

/// Cross-entropy used by the standalone classification heads.
pub const HEAD_CROSS_ENTROPY: CrossEntropySpec = CrossEntropySpec {
    ignore_index: 0,
    label_smoothing: None,
};

/// A scalar loss together with the number of positions (or sequences) it was
/// averaged over. A loss with `valid_count == 0` is undefined: its tensor is
/// zero so it can still be summed, but it must not be reported as a value.
#[derive(Debug, Clone)]
pub struct MaskedLoss<B: Backend> {
    pub value: Tensor<B, 1>,
    pub valid_count: usize,
}

impl<B: Backend> MaskedLoss<B> {
    pub fn is_defined(&self) -> bool {
        self.valid_count > 0
    }

    /// Host-side value, `NaN` when undefined.
    pub fn scalar(&self) -> f32 {
        if self.is_defined() {
            self.value.clone().into_scalar().elem::<f32>()
        } else {
            f32::NAN
        }
    }
}

fn count_true<B: Backend>(mask: Tensor<B, 1>) -> usize {
    mask.sum().into_scalar().elem::<f32>().round().max(0.0) as usize
}

/// Cross-entropy over `[N, C]` logits with an ignored label.
///
/// Ignored positions are excluded from both numerator and denominator. With
/// label smoothing `eps`, each valid position contributes
/// `(1 - eps) * nll + eps * mean_c(-log p_c)`.
///
/// # Errors
/// Any non-ignored target outside `[0, C)` is a configuration error.
pub fn masked_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    spec: CrossEntropySpec,
) -> Result<MaskedLoss<B>, ConfigError> {
    let [n, num_classes] = logits.dims();
    let [n_targets] = targets.dims();
    if n != n_targets {
        return Err(ConfigError::width("cross-entropy targets", n, n_targets));
    }
    let device = logits.device();
    if n == 0 {
        return Ok(MaskedLoss {
            value: Tensor::zeros([1], &device),
            valid_count: 0,
        });
    }

    let mask = targets.clone().not_equal_elem(spec.ignore_index);
    let mask_f = mask.clone().float();
    let valid_count = count_true(mask_f.clone());

    // Ignored labels may be anything; replace them so gather stays in range.
    let safe_targets = targets.mask_fill(mask.bool_not(), 0);
    let min_target = safe_targets.clone().min().into_scalar().elem::<i64>();
    let max_target = safe_targets.clone().max().into_scalar().elem::<i64>();
    if min_target < 0 || max_target >= num_classes as i64 {
        return Err(ConfigError::Invalid(format!(
            "class ids must lie in [0, {}), found range [{}, {}]",
            num_classes, min_target, max_target
        )));
    }

    let log_probs = activation::log_softmax(logits, 1);
    let nll = log_probs
        .clone()
        .gather(1, safe_targets.reshape([n, 1]))
        .reshape([n])
        .neg();

    let per_position = match spec.label_smoothing {
        Some(eps) if eps > 0.0 => {
            let smooth = log_probs.mean_dim(1).reshape([n]).neg();
            nll.mul_scalar(1.0 - eps) + smooth.mul_scalar(eps)
        }
        _ => nll,
    };

    let value = (per_position * mask_f)
        .sum()
        .div_scalar(valid_count.max(1) as f32);

    Ok(MaskedLoss { value, valid_count })
}

/// Squared error averaged per sequence over valid positions, then averaged over
/// the sequences that have at least one valid position.
///
/// `mask` is `1.0` at valid positions and `0.0` elsewhere; all inputs `[batch, seq]`.
/// `valid_count` is the number of contributing sequences.
pub fn masked_mse_per_sequence<B: Backend>(
    pred: Tensor<B, 2>,
    target: Tensor<B, 2>,
    mask: Tensor<B, 2>,
) -> MaskedLoss<B> {
    let squared = (pred - target).powf_scalar(2.0);
    let per_seq_sum = (squared * mask.clone()).sum_dim(1);
    let per_seq_count = mask.sum_dim(1);

    let seq_valid = per_seq_count.clone().greater_elem(0.0).float();
    let per_seq_mean = per_seq_sum / per_seq_count.clamp_min(1.0);

    let valid_count = count_true(seq_valid.clone().flatten(0, 1));
    let value = (per_seq_mean * seq_valid)
        .sum()
        .div_scalar(valid_count.max(1) as f32);

    MaskedLoss { value, valid_count }
}

/// Squared error summed over every valid position of the batch and divided by
/// the number of valid positions.
pub fn masked_mse_fused<B: Backend>(
    pred: Tensor<B, 2>,
    target: Tensor<B, 2>,
    mask: Tensor<B, 2>,
) -> MaskedLoss<B> {
    let squared = (pred - target).powf_scalar(2.0);
    let valid_count = count_true(mask.clone().flatten(0, 1));
    let value = (squared * mask).sum().div_scalar(valid_count.max(1) as f32);

    MaskedLoss { value, valid_count }
}

/// Log diagnostics for a computed loss value.
///
/// Non-finite or negative values are reported as warnings; the caller decides
/// what to do with them.
pub fn check_loss_value(name: &str, value: f32) -> bool {
    if value.is_nan() {
        log::warn!("{} is NaN (no valid positions or numerical instability)", name);
        return false;
    }
    if value.is_infinite() {
        log::warn!("{} is infinite ({}); check input scaling", name, value);
        return false;
    }
    if value < 0.0 {
        log::warn!("{} is negative ({:.6}); squared and cross-entropy terms must be >= 0", name, value);
        return false;
    }
    if value > 100.0 {
        log::warn!("{} is very large ({:.6})", name, value);
    }
    true
}

/// Count NaN and infinite entries of a tensor and log them.
pub fn log_numerical_properties<B: Backend, const D: usize>(tensor: &Tensor<B, D>, name: &str) {
    let data = tensor.to_data();
    let Ok(values) = data.to_vec::<f32>() else {
        return;
    };
    let nan_count = values.iter().filter(|x| x.is_nan()).count();
    let inf_count = values.iter().filter(|x| x.is_infinite()).count();
    if nan_count > 0 || inf_count > 0 {
        log::warn!(
            "{} contains {} NaN and {} infinite values out of {}",
            name,
            nan_count,
            inf_count,
            values.len()
        );
    }
}
