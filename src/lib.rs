//! # orinet
//!
//! Training loop for a patch **orientation network**: a small CNN that looks at a local image
//! patch and predicts the 2x2 rotation that brings it to a canonical orientation. It learns without
//! orientation labels, by making descriptors of matching patches agree after each patch is
//! re-sampled under its own predicted rotation.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: augmentation, pair sampling and evaluation take a `seed`
//!   (or a config that carries one).
//! - **No hidden normalization**: patches are `[0,1]` intensities; per-patch standardization inside
//!   the networks is stated where it happens.
//! - **Coordinates are normalized**: affine maps send output grid coordinates in `[-1,1]²` to patch
//!   coordinates in `[0,1]²`; see [`augment`] and [`sampler`].
//! - **Batch order is dataset order**: the loader never shuffles, however many workers it runs.
//!
//! ## How a batch flows
//!
//! 1. [`augment::random_affine`] draws rotation, scale and shift per anchor.
//! 2. [`pipeline::forward_views`] warps the anchors, predicts transforms for three views,
//!    re-samples at full resolution under the predictions, crops, and describes.
//! 3. [`loss::hardest_triplet_margin_loss`] scores the descriptors; the geometric disagreement
//!    between anchor and aligned positive transforms is only monitored.
//! 4. SGD steps the predictor; [`schedule::LinearDecay`] produces the next rate.
//!
//! ## References (conceptual anchors)
//!
//! - Mishchuk et al., *Working hard to know your neighbor's margins* (HardNet, NeurIPS 2017):
//!   hardest-in-batch triplet loss and the frozen descriptor network.
//! - Mishkin et al., *Repeatability Is Not Enough: Learning Affine Regions via Discriminability*
//!   (ECCV 2018): learning orientation and affine shape through a descriptor loss.
//! - Brown, Hua, Winder, *Discriminative Learning of Local Image Descriptors* (PAMI 2011): the
//!   PhotoTour patch datasets.
//!
//! ## Module map
//!
//! - `augment`: random rotation/scale/shift maps and their inverse rotations (host-side)
//! - `sampler`: differentiable bilinear patch sampler, center crop, resample-by-transform
//! - `model`: `OrientationNet` and the `TransformPredictor` trait
//! - `descriptor`: `PatchDescriptor` trait with pixels, SIFT and frozen HardNet
//! - `loss`: hardest-in-batch triplet loss, descriptor and geometric distances
//! - `pipeline`: one batch through predict → resample → describe
//! - `schedule`: per-batch learning-rate schedule
//! - `checkpoint`: per-epoch model records and resume
//! - `data`: PhotoTour reader, pair sampling, threaded batch loader
//! - `train`: run configuration, training and evaluation loops

pub mod augment;
pub mod checkpoint;
pub mod data;
pub mod descriptor;
pub mod loss;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod schedule;
pub mod train;

/// orinet error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image decoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] burn_core::record::RecorderError),
}

pub type Result<T> = std::result::Result<T, Error>;
