//! Descriptor loss and the distances reported during training and evaluation.

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor};

use crate::{Error, Result};

/// Settings of the hardest-in-batch triplet margin loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletMarginConfig {
    pub margin: f32,
    /// Also take the hardest negative per positive (column-wise) and keep the closer one.
    pub anchor_swap: bool,
    /// Off-diagonal distances below this are treated as duplicates, not negatives.
    pub duplicate_threshold: f32,
}

impl Default for TripletMarginConfig {
    fn default() -> Self {
        Self {
            margin: 1.0,
            anchor_swap: true,
            duplicate_threshold: 0.008,
        }
    }
}

/// Pairwise Euclidean distances `[N,M]` between rows of `anchor` `[N,D]` and `positive` `[M,D]`.
///
/// Uses the expanded form `|a|² + |p|² − 2a·p`; tiny negative values from cancellation are clamped
/// to zero before the `+1e-6` under the root.
pub fn distance_matrix<B: Backend>(anchor: Tensor<B, 2>, positive: Tensor<B, 2>) -> Tensor<B, 2> {
    let a_sq = anchor.clone().powf_scalar(2.0).sum_dim(1);
    let p_sq = positive.clone().powf_scalar(2.0).sum_dim(1).transpose();
    let cross = anchor.matmul(positive.transpose());
    (a_sq + p_sq - cross * 2.0).clamp_min(0.0).add_scalar(1e-6).sqrt()
}

/// HardNet-style loss: mean of `max(0, margin + d(a_i, p_i) − d(hardest negative))`.
pub fn hardest_triplet_margin_loss<B: Backend>(
    anchor: Tensor<B, 2>,
    positive: Tensor<B, 2>,
    cfg: &TripletMarginConfig,
) -> Result<Tensor<B, 1>> {
    let [n, d] = anchor.dims();
    if positive.dims() != [n, d] {
        return Err(Error::Shape("anchor and positive descriptors must have equal shapes"));
    }
    if n == 0 {
        return Err(Error::Domain("batch must be non-empty"));
    }
    let device = anchor.device();
    let dist = distance_matrix(anchor, positive);
    let eye = Tensor::<B, 2>::eye(n, &device);

    let pos = (dist.clone() * eye.clone()).sum_dim(1);

    let off_diag = dist + eye * 10.0;
    let duplicates = off_diag
        .clone()
        .lower_elem(cfg.duplicate_threshold)
        .float()
        * 10.0;
    let off_diag = off_diag + duplicates;

    let mut hardest = off_diag.clone().min_dim(1);
    if cfg.anchor_swap {
        let by_positive = off_diag.min_dim(0).reshape([n, 1]);
        hardest = Tensor::cat(vec![hardest, by_positive], 1).min_dim(1);
    }

    Ok((pos - hardest + cfg.margin).clamp_min(0.0).mean())
}

/// Per-pair descriptor distance `sqrt(Σ(a − p)² + 1e-6)`, shape `[N]`.
pub fn descriptor_distance<B: Backend>(anchor: Tensor<B, 2>, positive: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = anchor.dims();
    ((anchor - positive).powf_scalar(2.0).sum_dim(1) + 1e-6)
        .sqrt()
        .reshape([n])
}

/// Per-pair geometric disagreement `sqrt(max_k (T_a − T_p)_k² + 1e-8)`, shape `[N]`.
///
/// `aligned_positive` must already be expressed in the anchor's frame.
pub fn geometric_distance<B: Backend>(
    anchor: Tensor<B, 3>,
    aligned_positive: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let [n, _, _] = anchor.dims();
    ((anchor - aligned_positive)
        .powf_scalar(2.0)
        .reshape([n as i32, -1])
        .max_dim(1)
        + 1e-8)
        .sqrt()
        .reshape([n])
}
