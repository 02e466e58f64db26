//! Synthetic geometric augmentation of patches.
//!
//! All maps here are 2x3 affine maps in normalized patch coordinates: an output grid
//! coordinate `u ∈ [-1,1]²` is sent to `A·u + t ∈ [0,1]²`. The canonical map
//! `[[0.5, 0, 0.5], [0, 0.5, 0.5]]` reproduces the input patch.
//!
//! Everything is host-side `ndarray` and driven by an explicit RNG, so a seeded
//! `ChaCha8Rng` reproduces the exact same augmentation stream.

use crate::{Error, Result};
use ndarray::{Array1, Array3};

/// The canonical centered map: unit square in, identity resampling out.
pub const CANONICAL_LAF: [[f32; 3]; 2] = [[0.5, 0.0, 0.5], [0.0, 0.5, 0.5]];

/// 2x2 rotation matrix `[[cos φ, sin φ], [-sin φ, cos φ]]`.
#[inline]
pub fn rotation_matrix(phi: f32) -> [[f32; 2]; 2] {
    let (s, c) = phi.sin_cos();
    [[c, s], [-s, c]]
}

/// Parameters of the training-time random affine augmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentConfig {
    /// Rotation angles are drawn from `U[-max_angle, max_angle]` (radians).
    pub max_angle: f32,
    /// Per-sample isotropic scale drawn from `U[scale_min, scale_max]`.
    pub scale_min: f32,
    pub scale_max: f32,
    /// Integer pixel shifts are drawn from `[-max_shift_w, max_shift_w - 1]`.
    pub max_shift_w: u32,
    pub max_shift_h: u32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            max_angle: core::f32::consts::PI,
            scale_min: 0.9,
            scale_max: 1.2,
            max_shift_w: 2,
            max_shift_h: 2,
        }
    }
}

impl AugmentConfig {
    /// Rotation only: unit scale and no shift (the evaluation-time augmentation).
    pub fn rotation_only(max_angle: f32) -> Self {
        Self {
            max_angle,
            scale_min: 1.0,
            scale_max: 1.0,
            max_shift_w: 0,
            max_shift_h: 0,
        }
    }

    /// No augmentation at all: every map is [`CANONICAL_LAF`].
    pub fn identity() -> Self {
        Self::rotation_only(0.0)
    }

    fn validate(&self) -> Result<()> {
        if !self.max_angle.is_finite() || self.max_angle < 0.0 {
            return Err(Error::Domain("max_angle must be finite and nonnegative"));
        }
        if !self.scale_min.is_finite() || !self.scale_max.is_finite() {
            return Err(Error::Domain("scale bounds must be finite"));
        }
        if self.scale_min <= 0.0 || self.scale_min > self.scale_max {
            return Err(Error::Domain("scale bounds must satisfy 0 < scale_min <= scale_max"));
        }
        Ok(())
    }
}

/// Random rotations of the canonical map.
///
/// Returns `(lafs, inv_rot)` with shapes `(n, 2, 3)` and `(n, 2, 2)`, where the linear part of
/// `lafs[i]` is `R(φ_i)·0.5·I` and `inv_rot[i] = R(-φ_i)`.
pub fn random_rotation_lafs(
    n: usize,
    max_angle: f32,
    rng: &mut impl rand::Rng,
) -> Result<(Array3<f32>, Array3<f32>)> {
    if !max_angle.is_finite() || max_angle < 0.0 {
        return Err(Error::Domain("max_angle must be finite and nonnegative"));
    }
    let mut lafs = Array3::<f32>::zeros((n, 2, 3));
    let mut inv_rot = Array3::<f32>::zeros((n, 2, 2));
    for i in 0..n {
        let phi: f32 = rng.random_range(-max_angle..=max_angle);
        let rot = rotation_matrix(phi);
        let inv = rotation_matrix(-phi);
        for r in 0..2 {
            for c in 0..2 {
                // R · (0.5 I)
                lafs[[i, r, c]] = rot[r][c] * CANONICAL_LAF[c][c];
                inv_rot[[i, r, c]] = inv[r][c];
            }
            lafs[[i, r, 2]] = CANONICAL_LAF[r][2];
        }
    }
    Ok((lafs, inv_rot))
}

/// Random integer pixel shifts, returned as `f32`.
///
/// Shifts lie in `[-w_max, w_max - 1]` and `[-h_max, h_max - 1]`; a zero bound yields zeros.
pub fn random_shifts(
    n: usize,
    w_max: u32,
    h_max: u32,
    rng: &mut impl rand::Rng,
) -> (Array1<f32>, Array1<f32>) {
    let mut draw = |bound: u32| -> f32 {
        if bound == 0 {
            return 0.0;
        }
        let b = bound as i64;
        (rng.random_range(0..2 * b) - b) as f32
    };
    let mut shift_w = Array1::<f32>::zeros(n);
    let mut shift_h = Array1::<f32>::zeros(n);
    for i in 0..n {
        shift_w[i] = draw(w_max);
        shift_h[i] = draw(h_max);
    }
    (shift_w, shift_h)
}

/// A batch of random rotation+scale+shift maps with the inverse of each rotation.
#[derive(Debug, Clone)]
pub struct RandomAffineBatch {
    /// `(n, 2, 3)` maps used to warp the anchor patches.
    pub lafs: Array3<f32>,
    /// `(n, 2, 2)` inverse rotations (scale and shift are not undone).
    pub inv_rot: Array3<f32>,
}

/// Random rotation, then scale on the linear part, then shifts normalized by patch size.
pub fn random_affine(
    n: usize,
    patch_w: usize,
    patch_h: usize,
    cfg: &AugmentConfig,
    rng: &mut impl rand::Rng,
) -> Result<RandomAffineBatch> {
    cfg.validate()?;
    if patch_w == 0 || patch_h == 0 {
        return Err(Error::Domain("patch size must be >= 1"));
    }
    let (mut lafs, inv_rot) = random_rotation_lafs(n, cfg.max_angle, rng)?;

    for i in 0..n {
        let scale: f32 = rng.random_range(cfg.scale_min..=cfg.scale_max);
        for r in 0..2 {
            for c in 0..2 {
                lafs[[i, r, c]] *= scale;
            }
        }
    }

    let (shift_w, shift_h) = random_shifts(n, cfg.max_shift_w, cfg.max_shift_h, rng);
    for i in 0..n {
        lafs[[i, 0, 2]] += shift_w[i] / patch_w as f32;
        lafs[[i, 1, 2]] += shift_h[i] / patch_h as f32;
    }

    Ok(RandomAffineBatch { lafs, inv_rot })
}
