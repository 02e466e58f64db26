//! Patch descriptors.
//!
//! A descriptor maps `[N,1,P,P]` patches to `[N,D]` embeddings; only Euclidean distances between
//! embeddings matter downstream. Three variants are provided and picked once at startup through
//! [`Descriptor`]:
//!
//! - [`PixelDescriptor`]: the flattened pixels.
//! - [`SiftDescriptor`]: a differentiable SIFT-style histogram of gradient orientations.
//! - [`HardNet`]: a pretrained embedding network, loaded from a record file and frozen.
//!
//! All three are differentiable with respect to their input, so the descriptor loss reaches the
//! orientation predictor through the sampler.

use core::fmt;
use core::str::FromStr;
use std::path::Path;

use burn_core as burn;

use burn::module::{AutodiffModule, Module};
use burn::record::{Record, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{activation::relu, Tensor, TensorData};
use burn_nn::{Dropout, DropoutConfig};

use crate::checkpoint::CheckpointRecorder;
use crate::model::{input_norm, ConvBlock};
use crate::{Error, Result};

/// Row-wise L2 normalization with a small epsilon under the root.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = (x.clone().powf_scalar(2.0).sum_dim(1) + 1e-10).sqrt();
    x / norm
}

/// Capability shared by all descriptor variants.
pub trait PatchDescriptor<B: Backend> {
    /// `[N,1,P,P]` → `[N,D]`.
    fn describe(&self, patches: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Flattened pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelDescriptor;

impl<B: Backend> PatchDescriptor<B> for PixelDescriptor {
    fn describe(&self, patches: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, _c, _h, _w] = patches.dims();
        patches.reshape([n as i32, -1])
    }
}

/// SIFT-style descriptor built only from differentiable tensor ops.
///
/// Gradients come from central differences. Orientation binning uses the soft response
/// `|g|·max(0, cos(θ − φ_k))³` per bin angle `φ_k`, which avoids `atan2` and integer binning.
/// Responses are weighted by a centered Gaussian, pooled with triangular kernels into a
/// `spatial_bins × spatial_bins` grid, L2-normalized, clipped and renormalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiftDescriptor {
    pub patch_size: usize,
    pub angle_bins: usize,
    pub spatial_bins: usize,
    pub clip: f32,
}

impl Default for SiftDescriptor {
    fn default() -> Self {
        Self {
            patch_size: 32,
            angle_bins: 8,
            spatial_bins: 4,
            clip: 0.2,
        }
    }
}

impl SiftDescriptor {
    pub fn new(patch_size: usize) -> Result<Self> {
        let d = Self {
            patch_size,
            ..Default::default()
        };
        if patch_size < 2 * (d.spatial_bins + 1) {
            return Err(Error::Domain("patch_size too small for the SIFT spatial grid"));
        }
        Ok(d)
    }

    fn pool_kernel_size(&self) -> usize {
        2 * self.patch_size / (self.spatial_bins + 1)
    }

    fn pool_stride(&self) -> usize {
        self.patch_size / (self.spatial_bins + 1)
    }

    /// Side of the pooled grid (equals `spatial_bins` for the usual patch sizes).
    pub fn grid_size(&self) -> usize {
        (self.patch_size - self.pool_kernel_size()) / self.pool_stride() + 1
    }

    /// Embedding length.
    pub fn dim(&self) -> usize {
        self.angle_bins * self.grid_size() * self.grid_size()
    }

    fn gaussian<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let p = self.patch_size;
        let half = (p as f32 - 1.0) / 2.0;
        let sigma2 = 0.9 * (p as f32 / 2.0).powi(2);
        let mut data = Vec::with_capacity(p * p);
        for y in 0..p {
            for x in 0..p {
                let dy = y as f32 - half;
                let dx = x as f32 - half;
                data.push((-(dx * dx + dy * dy) / sigma2).exp());
            }
        }
        Tensor::from_data(TensorData::new(data, [1, 1, p, p]), device)
    }

    fn pool_kernel<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let ks = self.pool_kernel_size();
        let half = ks / 2;
        let step = 1.0 / half as f32;
        let mut coef: Vec<f32> = (0..half).map(|i| step / 2.0 + step * i as f32).collect();
        let mirrored: Vec<f32> = coef.iter().rev().copied().collect();
        if ks % 2 == 1 {
            coef.push(1.0);
        }
        coef.extend(mirrored);

        let mut data = Vec::with_capacity(self.angle_bins * ks * ks);
        for _ in 0..self.angle_bins {
            for &cy in &coef {
                for &cx in &coef {
                    data.push(cy * cx);
                }
            }
        }
        Tensor::from_data(TensorData::new(data, [self.angle_bins, 1, ks, ks]), device)
    }
}

impl<B: Backend> PatchDescriptor<B> for SiftDescriptor {
    fn describe(&self, patches: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, _c, _h, _w] = patches.dims();
        let device = patches.device();

        let kx = Tensor::<B, 4>::from_floats([[[[-1.0, 0.0, 1.0]]]], &device);
        let ky = Tensor::<B, 4>::from_floats([[[[-1.0], [0.0], [1.0]]]], &device);
        let gx = conv2d(
            patches.clone(),
            kx,
            None,
            ConvOptions::new([1, 1], [0, 1], [1, 1], 1),
        );
        let gy = conv2d(patches, ky, None, ConvOptions::new([1, 1], [1, 0], [1, 1], 1));

        let mag_sq = gx.clone().powf_scalar(2.0) + gy.clone().powf_scalar(2.0) + 1e-10;
        let gauss = self.gaussian::<B>(&device);

        let mut bins = Vec::with_capacity(self.angle_bins);
        for k in 0..self.angle_bins {
            let phi = 2.0 * core::f32::consts::PI * k as f32 / self.angle_bins as f32;
            let (s, c) = phi.sin_cos();
            let proj = relu(gx.clone() * c + gy.clone() * s);
            bins.push(proj.powf_scalar(3.0) / mag_sq.clone() * gauss.clone());
        }
        let hist = Tensor::cat(bins, 1);

        let stride = self.pool_stride();
        let pooled = conv2d(
            hist,
            self.pool_kernel::<B>(&device),
            None,
            ConvOptions::new([stride, stride], [0, 0], [1, 1], self.angle_bins),
        );

        let desc = l2_normalize(pooled.reshape([n as i32, -1]));
        l2_normalize(desc.clamp(0.0, self.clip))
    }
}

/// Pretrained HardNet embedding network (32x32 input, 128-d unit-norm output).
#[derive(Module, Debug)]
pub struct HardNet<B: Backend> {
    features: Vec<ConvBlock<B>>,
    dropout: Dropout,
    head: ConvBlock<B>,
}

/// Input size HardNet is built for.
pub const HARDNET_PATCH_SIZE: usize = 32;

/// On-disk layout of pretrained descriptor weights.
#[derive(Record)]
pub struct PretrainedRecord<B: Backend> {
    pub state_dict: HardNetRecord<B>,
}

impl<B: Backend> HardNet<B> {
    pub fn new(device: &B::Device) -> Self {
        let layers: [([usize; 2], usize); 6] = [
            ([1, 32], 1),
            ([32, 32], 1),
            ([32, 64], 2),
            ([64, 64], 1),
            ([64, 128], 2),
            ([128, 128], 1),
        ];
        let features = layers
            .iter()
            .map(|&(channels, stride)| ConvBlock::new(device, channels, 3, stride, 1, true))
            .collect();
        Self {
            features,
            dropout: DropoutConfig::new(0.3).init(),
            head: ConvBlock::new(device, [128, 128], 8, 1, 0, false),
        }
    }

    /// Load weights from a record file with a `state_dict` entry; the result is frozen.
    pub fn load_pretrained(path: &Path, device: &B::Device) -> Result<Self> {
        let record: PretrainedRecord<B> =
            Recorder::<B>::load(&CheckpointRecorder::new(), path.to_path_buf(), device)?;
        Ok(Self::new(device).load_record(record.state_dict).no_grad())
    }

    /// Write weights in the layout [`Self::load_pretrained`] reads.
    pub fn save_pretrained(&self, path: &Path) -> Result<()> {
        let record = PretrainedRecord::<B> {
            state_dict: self.clone().into_record(),
        };
        Recorder::<B>::record(&CheckpointRecorder::new(), record, path.to_path_buf())?;
        Ok(())
    }
}

impl<B: Backend> PatchDescriptor<B> for HardNet<B> {
    fn describe(&self, patches: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, _c, _h, _w] = patches.dims();
        let mut x = input_norm(patches);
        for block in &self.features {
            x = block.forward(x);
        }
        let x = self.head.forward(self.dropout.forward(x));
        l2_normalize(x.reshape([n as i32, -1]))
    }
}

/// Which descriptor drives the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Pixels,
    Sift,
    HardNet,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorKind::Pixels => "pixels",
            DescriptorKind::Sift => "SIFT",
            DescriptorKind::HardNet => "HardNet",
        };
        f.write_str(name)
    }
}

impl FromStr for DescriptorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pixels" => Ok(DescriptorKind::Pixels),
            "sift" => Ok(DescriptorKind::Sift),
            "hardnet" => Ok(DescriptorKind::HardNet),
            _ => Err(Error::Domain("descriptor must be one of: pixels, SIFT, HardNet")),
        }
    }
}

impl serde::Serialize for DescriptorKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> core::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// The descriptor selected for a run.
#[derive(Debug, Clone)]
pub enum Descriptor<B: Backend> {
    Pixels(PixelDescriptor),
    Sift(SiftDescriptor),
    HardNet(HardNet<B>),
}

impl<B: Backend> Descriptor<B> {
    /// Build the descriptor for `kind`; HardNet weights are read from `weights`.
    pub fn from_kind(
        kind: DescriptorKind,
        patch_size: usize,
        weights: &Path,
        device: &B::Device,
    ) -> Result<Self> {
        match kind {
            DescriptorKind::Pixels => Ok(Descriptor::Pixels(PixelDescriptor)),
            DescriptorKind::Sift => Ok(Descriptor::Sift(SiftDescriptor::new(patch_size)?)),
            DescriptorKind::HardNet => {
                if patch_size != HARDNET_PATCH_SIZE {
                    return Err(Error::Domain("HardNet requires patch_size 32"));
                }
                Ok(Descriptor::HardNet(HardNet::load_pretrained(weights, device)?))
            }
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        match self {
            Descriptor::Pixels(_) => DescriptorKind::Pixels,
            Descriptor::Sift(_) => DescriptorKind::Sift,
            Descriptor::HardNet(_) => DescriptorKind::HardNet,
        }
    }
}

impl<B: AutodiffBackend> Descriptor<B> {
    /// Same descriptor on the inner (non-autodiff) backend, for evaluation.
    pub fn valid(&self) -> Descriptor<B::InnerBackend> {
        match self {
            Descriptor::Pixels(d) => Descriptor::Pixels(*d),
            Descriptor::Sift(d) => Descriptor::Sift(*d),
            Descriptor::HardNet(net) => Descriptor::HardNet(net.valid()),
        }
    }
}

impl<B: Backend> PatchDescriptor<B> for Descriptor<B> {
    fn describe(&self, patches: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Descriptor::Pixels(d) => d.describe(patches),
            Descriptor::Sift(d) => d.describe(patches),
            Descriptor::HardNet(net) => net.describe(patches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn patches(n: usize, size: usize, seed: usize) -> Tensor<B, 4> {
        let device = Default::default();
        let mut data = Vec::with_capacity(n * size * size);
        for i in 0..n {
            for r in 0..size {
                for c in 0..size {
                    let v = ((r * (i + seed + 1) + c * 3 + i * 11) % 13) as f32 / 13.0;
                    data.push(v);
                }
            }
        }
        Tensor::from_data(TensorData::new(data, [n, 1, size, size]), &device)
    }

    fn row_norms(x: Tensor<B, 2>) -> Vec<f32> {
        x.powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn pixels_flatten() {
        let d = PixelDescriptor.describe(patches(3, 32, 0));
        assert_eq!(d.dims(), [3, 1024]);
    }

    #[test]
    fn sift_is_unit_norm_128d() {
        let sift = SiftDescriptor::new(32).unwrap();
        assert_eq!(sift.dim(), 128);
        let d = sift.describe(patches(5, 32, 1));
        assert_eq!(d.dims(), [5, 128]);
        for norm in row_norms(d) {
            assert!((norm - 1.0).abs() < 1e-3, "norm={norm}");
        }
    }

    #[test]
    fn sift_is_clipped_after_first_normalization() {
        let sift = SiftDescriptor::new(32).unwrap();
        let d = sift.describe(patches(2, 32, 2)).into_data().to_vec::<f32>().unwrap();
        assert!(d.iter().all(|&v| v >= 0.0));
        // After renormalization no entry can exceed clip / (norm of the clipped vector),
        // and the clipped vector has norm <= 1, so entries stay bounded by 1.
        assert!(d.iter().all(|&v| v <= 1.0 + 1e-6));
    }

    #[test]
    fn hardnet_outputs_unit_norm_embeddings() {
        let device = Default::default();
        let net = HardNet::<B>::new(&device);
        let d = net.describe(patches(4, 32, 3));
        assert_eq!(d.dims(), [4, 128]);
        for norm in row_norms(d) {
            assert!((norm - 1.0).abs() < 1e-3, "norm={norm}");
        }
    }

    #[test]
    fn hardnet_weights_roundtrip_through_state_dict_file() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hardnet.mpk");
        let net = HardNet::<B>::new(&device);
        net.save_pretrained(&path).unwrap();

        let loaded = HardNet::<B>::load_pretrained(&path, &device).unwrap();
        let x = patches(3, 32, 4);
        let a = net.describe(x.clone()).into_data().to_vec::<f32>().unwrap();
        let b = loaded.describe(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hardnet_requires_32px() {
        let device = Default::default();
        let r = Descriptor::<B>::from_kind(DescriptorKind::HardNet, 64, Path::new("none"), &device);
        assert!(r.is_err());
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("SIFT".parse::<DescriptorKind>().unwrap(), DescriptorKind::Sift);
        assert_eq!("hardnet".parse::<DescriptorKind>().unwrap(), DescriptorKind::HardNet);
        assert_eq!(DescriptorKind::HardNet.to_string(), "HardNet");
        assert!("surf".parse::<DescriptorKind>().is_err());
    }
}
