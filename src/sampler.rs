//! Differentiable affine patch sampler.
//!
//! Contract:
//! - `patches` are `[N, 1, H, W]`, `lafs` are `[N, 2, 3]` in normalized patch coordinates
//!   (see [`crate::augment`]);
//! - output pixel `(row, col)` of a `P×P` patch sits at grid coordinate
//!   `u = (-1 + 2·col/(P-1), -1 + 2·row/(P-1))`, which the map sends to `A·u + t ∈ [0,1]²`,
//!   then to input pixel `(A·u + t) · (W-1, H-1)` (corner-aligned);
//! - bilinear interpolation, zero outside the input.
//!
//! Gradients flow into both the patches and the maps; the integer corner indices are detached.

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::{Error, Result};

fn base_grid<B: Backend>(out_size: usize, device: &B::Device) -> Tensor<B, 3> {
    let step = if out_size > 1 {
        2.0 / (out_size - 1) as f32
    } else {
        0.0
    };
    let origin = if out_size > 1 { -1.0 } else { 0.0 };
    let mut data = Vec::with_capacity(out_size * out_size * 3);
    for row in 0..out_size {
        for col in 0..out_size {
            data.push(origin + step * col as f32);
            data.push(origin + step * row as f32);
            data.push(1.0);
        }
    }
    Tensor::from_data(
        TensorData::new(data, [1, out_size * out_size, 3]),
        device,
    )
}

fn in_range<B: Backend>(x: &Tensor<B, 2>, hi: usize) -> Tensor<B, 2> {
    x.clone().greater_equal_elem(0.0).float() * x.clone().lower_equal_elem(hi as f32).float()
}

/// Resample `patches` under `lafs` into `out_size × out_size` patches.
pub fn extract_patches<B: Backend>(
    patches: Tensor<B, 4>,
    lafs: Tensor<B, 3>,
    out_size: usize,
) -> Result<Tensor<B, 4>> {
    let [n, c, h, w] = patches.dims();
    if c != 1 {
        return Err(Error::Shape("patches must be single-channel [N,1,H,W]"));
    }
    if lafs.dims() != [n, 2, 3] {
        return Err(Error::Shape("lafs must be [N,2,3] with N matching patches"));
    }
    if out_size == 0 || h == 0 || w == 0 {
        return Err(Error::Domain("patch and output sizes must be >= 1"));
    }
    let device = patches.device();
    let pp = out_size * out_size;

    // [N, P*P, 3] x [N, 3, 2] -> [N, P*P, 2]
    let grid = base_grid::<B>(out_size, &device).repeat_dim(0, n);
    let coords = grid.matmul(lafs.swap_dims(1, 2));

    let px = coords.clone().slice([0..n, 0..pp, 0..1]).reshape([n, pp]) * ((w - 1) as f32);
    let py = coords.slice([0..n, 0..pp, 1..2]).reshape([n, pp]) * ((h - 1) as f32);

    let x0 = px.clone().detach().floor();
    let y0 = py.clone().detach().floor();
    let x1 = x0.clone() + 1.0;
    let y1 = y0.clone() + 1.0;

    let wx1 = px - x0.clone();
    let wx0 = wx1.clone().neg() + 1.0;
    let wy1 = py - y0.clone();
    let wy0 = wy1.clone().neg() + 1.0;

    let flat = patches.reshape([n, h * w]);
    let corners = [
        (x0.clone(), y0.clone(), wx0.clone() * wy0.clone()),
        (x1.clone(), y0, wx1.clone() * wy0),
        (x0, y1.clone(), wx0 * wy1.clone()),
        (x1, y1, wx1 * wy1),
    ];

    let mut out: Option<Tensor<B, 2>> = None;
    for (xc, yc, weight) in corners {
        let valid = in_range(&xc, w - 1) * in_range(&yc, h - 1);
        let idx = yc.clamp(0.0, (h - 1) as f32) * (w as f32) + xc.clamp(0.0, (w - 1) as f32);
        let vals = flat.clone().gather(1, idx.int());
        let term = vals * weight * valid;
        out = Some(match out {
            Some(acc) => acc + term,
            None => term,
        });
    }

    let out = out.ok_or(Error::Domain("no interpolation corners"))?;
    Ok(out.reshape([n, 1, out_size, out_size]))
}

/// Central `crop × crop` window of square patches.
pub fn center_crop<B: Backend>(patches: Tensor<B, 4>, crop: usize) -> Result<Tensor<B, 4>> {
    let [n, c, h, w] = patches.dims();
    if crop == 0 || crop > h || crop > w {
        return Err(Error::Shape("crop must be within the patch size"));
    }
    // Same offset on both axes, taken from the height.
    let st = (h - crop) / 2;
    Ok(patches.slice([0..n, 0..c, st..st + crop, st..st + crop]))
}

/// Re-sample the full-resolution `patches` under a predicted `[N,2,2]` transform, then crop.
///
/// The transform is composed with the canonical centered map (`0.5·I`, translation `0.5`), so it
/// acts about the patch center. Resampling happens at the input resolution and only the final
/// crop reduces it, which keeps interpolation error from compounding.
pub fn extract_and_crop_by_transform<B: Backend>(
    patches: Tensor<B, 4>,
    transform: Tensor<B, 3>,
    crop: usize,
) -> Result<Tensor<B, 4>> {
    let [n, _c, h, _w] = patches.dims();
    if transform.dims() != [n, 2, 2] {
        return Err(Error::Shape("transform must be [N,2,2] with N matching patches"));
    }
    let device = patches.device();
    let linear = transform * 0.5;
    let shift = Tensor::<B, 3>::ones([n, 2, 1], &device) * 0.5;
    let lafs = Tensor::cat(vec![linear, shift], 2);
    let warped = extract_patches(patches, lafs, h)?;
    center_crop(warped, crop)
}

/// `[N,2,2]` batch of identity matrices.
pub fn identity_transforms<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 3> {
    Tensor::<B, 2>::eye(2, device)
        .unsqueeze_dim::<3>(0)
        .repeat_dim(0, n)
}
