//! Orientation predictor network.
//!
//! `OrientationNet` maps a `P×P` patch to a direction `(x, y)` and turns it into the 2x2 rotation
//! that undoes the patch's dominant orientation. The conv stack is shared with the HardNet
//! descriptor through [`ConvBlock`].
//!
//! Normalization layers carry no affine parameters. Blocks built with
//! [`ConvBlock::with_running_stats`] normalize with batch statistics while the backend tracks
//! gradients and fold them into running estimates; on a non-autodiff backend (for instance after
//! `AutodiffModule::valid`) they use the running estimates, so a patch's prediction does not depend on the
//! rest of its batch. Plain blocks always use batch statistics.

use burn_core as burn;

use burn::module::{Module, RunningState};
use burn::tensor::activation::{relu, tanh};
use burn::tensor::{backend::Backend, Tensor};
use burn_nn::conv::{Conv2d, Conv2dConfig};
use burn_nn::{Dropout, DropoutConfig, PaddingConfig2d};

use crate::{Error, Result};

const NORM_EPS: f32 = 1e-5;

/// Per-channel mean and biased variance over batch and spatial dims, `[C]` each.
fn batch_moments<B: Backend>(x: &Tensor<B, 4>) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let [_n, c, _h, _w] = x.dims();
    let per_channel = x.clone().swap_dims(0, 1).reshape([c as i32, -1]);
    let mean = per_channel.clone().mean_dim(1);
    let var = (per_channel - mean.clone()).powf_scalar(2.0).mean_dim(1);
    (mean.reshape([c]), var.reshape([c]))
}

fn normalize_with<B: Backend>(x: Tensor<B, 4>, mean: Tensor<B, 1>, var: Tensor<B, 1>) -> Tensor<B, 4> {
    let [_n, c, _h, _w] = x.dims();
    let mean = mean.reshape([1, c, 1, 1]);
    let std = (var + NORM_EPS).sqrt().reshape([1, c, 1, 1]);
    (x - mean) / std
}

/// Per-channel normalization over batch and spatial dims (no affine, no running state).
pub(crate) fn normalize_batch<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let (mean, var) = batch_moments(&x);
    normalize_with(x, mean, var)
}

/// Batch normalization without affine parameters that tracks running mean and variance.
///
/// Running estimates follow `r ← (1 − momentum)·r + momentum·batch`, with the unbiased batch
/// variance, and start at mean 0 and variance 1.
#[derive(Module, Debug)]
pub struct RunningNorm<B: Backend> {
    running_mean: RunningState<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
}

impl<B: Backend> RunningNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            running_mean: RunningState::new(Tensor::zeros([channels], device)),
            running_var: RunningState::new(Tensor::ones([channels], device)),
            momentum: 0.1,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        if !B::ad_enabled() {
            let mean = self.running_mean.value().to_device(&device);
            let var = self.running_var.value().to_device(&device);
            return normalize_with(x, mean, var);
        }

        let [n, _c, h, w] = x.dims();
        let (mean, var) = batch_moments(&x);
        let count = (n * h * w) as f64;
        let unbiased = if count > 1.0 { count / (count - 1.0) } else { 1.0 };

        let running_mean = self.running_mean.value_sync().to_device(&device);
        let running_var = self.running_var.value_sync().to_device(&device);
        self.running_mean.update(
            running_mean.mul_scalar(1.0 - self.momentum)
                + mean.clone().detach().mul_scalar(self.momentum),
        );
        self.running_var.update(
            running_var.mul_scalar(1.0 - self.momentum)
                + var.clone().detach().mul_scalar(self.momentum * unbiased),
        );
        normalize_with(x, mean, var)
    }
}

/// Per-patch standardization with detached statistics (sample std, `+1e-7`).
pub(crate) fn input_norm<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, _c, _h, _w] = x.dims();
    let flat = x.clone().reshape([n as i32, -1]);
    let mean = flat.clone().mean_dim(1).detach().reshape([n, 1, 1, 1]);
    let std = (flat.var(1).sqrt() + 1e-7).detach().reshape([n, 1, 1, 1]);
    (x - mean) / std
}

/// Conv (no bias) → normalization → optional ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<RunningNorm<B>>,
    activate: bool,
}

impl<B: Backend> ConvBlock<B> {
    pub(crate) fn new(
        device: &B::Device,
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        padding: usize,
        activate: bool,
    ) -> Self {
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(false)
            .init(device);
        Self {
            conv,
            norm: None,
            activate,
        }
    }

    /// Normalize with tracked running statistics instead of the current batch's.
    pub(crate) fn with_running_stats(mut self, device: &B::Device) -> Self {
        let [out_channels, _, _, _] = self.conv.weight.val().dims();
        self.norm = Some(RunningNorm::new(out_channels, device));
        self
    }

    pub(crate) fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => normalize_batch(x),
        };
        if self.activate {
            relu(x)
        } else {
            x
        }
    }
}

/// A network that predicts a per-patch 2x2 transform.
pub trait TransformPredictor<B: Backend> {
    /// Input patch size the predictor expects (the center crop it sees).
    fn patch_size(&self) -> usize;

    /// `[N,1,P,P]` patches to `[N,2,2]` transforms.
    fn predict(&self, patches: Tensor<B, 4>) -> Tensor<B, 3>;
}

/// Hyperparameters of [`OrientationNet`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationNetConfig {
    /// Input patch size; must be a multiple of 4 and at least 8.
    pub patch_size: usize,
    /// Dropout probability before the head.
    pub dropout: f64,
}

impl Default for OrientationNetConfig {
    fn default() -> Self {
        Self {
            patch_size: 32,
            dropout: 0.25,
        }
    }
}

impl OrientationNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<OrientationNet<B>> {
        if self.patch_size < 8 || self.patch_size % 4 != 0 {
            return Err(Error::Domain("patch_size must be a multiple of 4 and >= 8"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Domain("dropout must be in [0, 1)"));
        }
        let layers: [([usize; 2], usize); 6] = [
            ([1, 16], 1),
            ([16, 16], 1),
            ([16, 32], 2),
            ([32, 32], 1),
            ([32, 64], 2),
            ([64, 64], 1),
        ];
        let features = layers
            .iter()
            .map(|&(channels, stride)| {
                ConvBlock::new(device, channels, 3, stride, 1, true).with_running_stats(device)
            })
            .collect();
        let head_kernel = self.patch_size / 4;
        let head = Conv2dConfig::new([64, 2], [head_kernel, head_kernel])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(true)
            .init(device);
        Ok(OrientationNet {
            features,
            dropout: DropoutConfig::new(self.dropout).init(),
            head,
            patch_size: self.patch_size,
        })
    }
}

/// Orientation estimator: conv stack → dropout → `P/4` conv to 2 channels → tanh → global mean.
#[derive(Module, Debug)]
pub struct OrientationNet<B: Backend> {
    features: Vec<ConvBlock<B>>,
    dropout: Dropout,
    head: Conv2d<B>,
    patch_size: usize,
}

impl<B: Backend> OrientationNet<B> {
    /// Raw direction `(x, y)` per patch, `[N, 2]`.
    pub fn forward(&self, patches: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, _c, _h, _w] = patches.dims();
        let mut x = input_norm(patches);
        for block in &self.features {
            x = block.forward(x);
        }
        let x = tanh(self.head.forward(self.dropout.forward(x)));
        x.mean_dim(3).mean_dim(2).reshape([n, 2])
    }
}

/// Rotation by `-atan2(x, y)` in the `[[c, s], [-s, c]]` convention: `[[c, -s], [s, c]]` with
/// `c = y/r`, `s = x/r`.
pub fn rotation_from_direction<B: Backend>(xy: Tensor<B, 2>) -> Tensor<B, 3> {
    let [n, _] = xy.dims();
    let x = xy.clone().slice([0..n, 0..1]) + 1e-8;
    let y = xy.slice([0..n, 1..2]) + 1e-8;
    let r = (x.clone().powf_scalar(2.0) + y.clone().powf_scalar(2.0) + 1e-12).sqrt();
    let c = y / r.clone();
    let s = x / r;
    let row0 = Tensor::cat(vec![c.clone(), s.clone().neg()], 1);
    let row1 = Tensor::cat(vec![s, c], 1);
    Tensor::cat(
        vec![row0.unsqueeze_dim::<3>(1), row1.unsqueeze_dim::<3>(1)],
        1,
    )
}

impl<B: Backend> TransformPredictor<B> for OrientationNet<B> {
    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn predict(&self, patches: Tensor<B, 4>) -> Tensor<B, 3> {
        rotation_from_direction(self.forward(patches))
    }
}
