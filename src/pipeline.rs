//! One batch through predict → resample → describe.
//!
//! Views:
//! - the anchor warped by the augmentation map (`anchor_rot`),
//! - the positive as-is,
//! - the un-augmented anchor.
//!
//! The predictor sees the center crop of each view; its transform then re-samples the
//! full-resolution view, which is cropped again and described.

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::augment::RandomAffineBatch;
use crate::descriptor::PatchDescriptor;
use crate::model::TransformPredictor;
use crate::sampler::{center_crop, extract_and_crop_by_transform, extract_patches};
use crate::{Error, Result};

/// Augmentation maps of a batch as tensors: `(lafs [N,2,3], inv_rot [N,2,2])`.
pub fn affine_tensors<B: Backend>(
    batch: &RandomAffineBatch,
    device: &B::Device,
) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let n = batch.lafs.shape()[0];
    let lafs: Vec<f32> = batch.lafs.iter().copied().collect();
    let inv: Vec<f32> = batch.inv_rot.iter().copied().collect();
    (
        Tensor::from_data(TensorData::new(lafs, [n, 2, 3]), device),
        Tensor::from_data(TensorData::new(inv, [n, 2, 2]), device),
    )
}

/// Everything a batch produces.
#[derive(Debug, Clone)]
pub struct ViewOutputs<B: Backend> {
    /// Descriptors of the re-sampled augmented anchors, `[N,D]`.
    pub desc_a: Tensor<B, 2>,
    /// Descriptors of the re-sampled positives, `[N,D]`.
    pub desc_p: Tensor<B, 2>,
    /// Transform predicted for the augmented anchor.
    pub transform_a_rot: Tensor<B, 3>,
    /// Transform predicted for the positive.
    pub transform_p: Tensor<B, 3>,
    /// `inv_rot · transform_p`, comparable with `transform_a_rot`.
    pub transform_p_aligned: Tensor<B, 3>,
    /// Transform predicted for the un-augmented anchor.
    pub transform_a: Tensor<B, 3>,
}

/// Run the three views of one batch.
///
/// `anchors` and `positives` are `[N,1,H,W]`; `lafs` warps the anchors and `inv_rot` undoes the
/// rotation part of it.
pub fn forward_views<B, P, D>(
    predictor: &P,
    descriptor: &D,
    anchors: Tensor<B, 4>,
    positives: Tensor<B, 4>,
    lafs: Tensor<B, 3>,
    inv_rot: Tensor<B, 3>,
) -> Result<ViewOutputs<B>>
where
    B: Backend,
    P: TransformPredictor<B>,
    D: PatchDescriptor<B>,
{
    let [n, _c, h, w] = anchors.dims();
    if positives.dims() != anchors.dims() {
        return Err(Error::Shape("anchors and positives must have equal shapes"));
    }
    if inv_rot.dims() != [n, 2, 2] {
        return Err(Error::Shape("inv_rot must be [N,2,2]"));
    }
    let crop = predictor.patch_size();
    if crop > h || crop > w {
        return Err(Error::Shape("predictor patch size exceeds the input patches"));
    }

    let anchor_rot = extract_patches(anchors.clone(), lafs, h)?;

    let transform_a_rot = predictor.predict(center_crop(anchor_rot.clone(), crop)?);
    let transform_p = predictor.predict(center_crop(positives.clone(), crop)?);
    let transform_a = predictor.predict(center_crop(anchors, crop)?);
    let transform_p_aligned = inv_rot.matmul(transform_p.clone());

    let patches_a = extract_and_crop_by_transform(anchor_rot, transform_a_rot.clone(), crop)?;
    let patches_p = extract_and_crop_by_transform(positives, transform_p.clone(), crop)?;

    Ok(ViewOutputs {
        desc_a: descriptor.describe(patches_a),
        desc_p: descriptor.describe(patches_p),
        transform_a_rot,
        transform_p,
        transform_p_aligned,
        transform_a,
    })
}
