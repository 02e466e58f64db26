//! Patch-pair datasets and the batch loader.
//!
//! - [`PatchSet`]: square single-channel patches with an integer label (3D point id), intensities
//!   in `[0,1]`.
//! - [`PairDataset`]: an ordered list of `(anchor, positive)` index pairs sharing a label.
//! - [`load_phototour`]: reader for the PhotoTour (Brown/UBC) layout.
//! - [`BatchLoader`]: worker threads assembling batches into bounded queues, consumed in order.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// Equally sized square patches with labels.
#[derive(Debug, Clone)]
pub struct PatchSet {
    size: usize,
    pixels: Vec<f32>,
    labels: Vec<u64>,
}

impl PatchSet {
    /// `pixels` holds `labels.len()` row-major `size × size` patches.
    pub fn new(size: usize, pixels: Vec<f32>, labels: Vec<u64>) -> Result<Self> {
        if size == 0 {
            return Err(Error::Domain("patch size must be >= 1"));
        }
        if pixels.len() != labels.len() * size * size {
            return Err(Error::Shape("pixels length must be labels.len() * size * size"));
        }
        Ok(Self {
            size,
            pixels,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn patch_size(&self) -> usize {
        self.size
    }

    pub fn patch(&self, i: usize) -> &[f32] {
        let area = self.size * self.size;
        &self.pixels[i * area..(i + 1) * area]
    }

    pub fn label(&self, i: usize) -> u64 {
        self.labels[i]
    }
}

/// Side of a PhotoTour patch.
pub const PHOTOTOUR_PATCH_SIZE: usize = 64;
const PHOTOTOUR_PAGE_SIZE: usize = 1024;

fn parse_info(text: &str) -> Result<Vec<u64>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            l.split_whitespace()
                .next()
                .and_then(|tok| tok.parse::<u64>().ok())
                .ok_or_else(|| Error::Dataset(format!("bad info.txt line: {l:?}")))
        })
        .collect()
}

/// Read a PhotoTour scene directory: `info.txt` (one point id per patch, first column) and
/// `patches*.bmp`/`patches*.png` pages of 16×16 patches of 64×64 pixels, row-major, in file-name
/// order.
pub fn load_phototour(dir: &Path) -> Result<PatchSet> {
    let labels = parse_info(&fs::read_to_string(dir.join("info.txt"))?)?;

    let mut pages: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
            name.starts_with("patches") && (ext == "bmp" || ext == "png")
        })
        .collect();
    pages.sort();

    let per_row = PHOTOTOUR_PAGE_SIZE / PHOTOTOUR_PATCH_SIZE;
    let area = PHOTOTOUR_PATCH_SIZE * PHOTOTOUR_PATCH_SIZE;
    let mut pixels = Vec::with_capacity(labels.len() * area);
    let mut count = 0usize;

    'pages: for page in &pages {
        let img = image::open(page)?.to_luma8();
        if img.width() as usize != PHOTOTOUR_PAGE_SIZE || img.height() as usize != PHOTOTOUR_PAGE_SIZE {
            return Err(Error::Dataset(format!(
                "{} is not a {PHOTOTOUR_PAGE_SIZE}x{PHOTOTOUR_PAGE_SIZE} page",
                page.display()
            )));
        }
        for row in 0..per_row {
            for col in 0..per_row {
                if count == labels.len() {
                    break 'pages;
                }
                for y in 0..PHOTOTOUR_PATCH_SIZE {
                    for x in 0..PHOTOTOUR_PATCH_SIZE {
                        let px = img.get_pixel(
                            (col * PHOTOTOUR_PATCH_SIZE + x) as u32,
                            (row * PHOTOTOUR_PATCH_SIZE + y) as u32,
                        );
                        pixels.push(px.0[0] as f32 / 255.0);
                    }
                }
                count += 1;
            }
        }
    }

    if count != labels.len() {
        return Err(Error::Dataset(format!(
            "{}: info.txt lists {} patches but pages hold {count}",
            dir.display(),
            labels.len()
        )));
    }
    debug!("loaded {count} patches from {}", dir.display());
    PatchSet::new(PHOTOTOUR_PATCH_SIZE, pixels, labels)
}

/// Ordered `(anchor, positive)` pairs over a shared [`PatchSet`].
#[derive(Debug, Clone)]
pub struct PairDataset {
    patches: Arc<PatchSet>,
    pairs: Vec<(usize, usize)>,
}

impl PairDataset {
    pub fn new(patches: Arc<PatchSet>, pairs: Vec<(usize, usize)>) -> Result<Self> {
        let n = patches.len();
        if pairs.iter().any(|&(a, p)| a >= n || p >= n) {
            return Err(Error::Domain("pair index out of range"));
        }
        Ok(Self { patches, pairs })
    }

    /// Draw `n_pairs` pairs of distinct patches with the same label, deterministically from `seed`.
    pub fn sample(patches: Arc<PatchSet>, n_pairs: usize, seed: u64) -> Result<Self> {
        let mut by_label: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for i in 0..patches.len() {
            by_label.entry(patches.label(i)).or_default().push(i);
        }
        let groups: Vec<Vec<usize>> = by_label.into_values().filter(|g| g.len() >= 2).collect();
        if groups.is_empty() {
            return Err(Error::Domain("no label has at least two patches"));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut pairs = Vec::with_capacity(n_pairs);
        for _ in 0..n_pairs {
            let g = &groups[rng.random_range(0..groups.len())];
            let a = rng.random_range(0..g.len());
            let mut p = rng.random_range(0..g.len() - 1);
            if p >= a {
                p += 1;
            }
            pairs.push((g[a], g[p]));
        }
        Self::new(patches, pairs)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn patch_size(&self) -> usize {
        self.patches.patch_size()
    }

    pub fn pair(&self, i: usize) -> (&[f32], &[f32]) {
        let (a, p) = self.pairs[i];
        (self.patches.patch(a), self.patches.patch(p))
    }
}

/// One batch of anchor/positive patches, host-side.
#[derive(Debug, Clone)]
pub struct Batch {
    pub anchors: Vec<f32>,
    pub positives: Vec<f32>,
    pub len: usize,
    pub patch_size: usize,
}

/// `src` transposed and/or mirrored left-right, appended to `dst`.
fn push_flipped(src: &[f32], size: usize, transpose: bool, mirror: bool, dst: &mut Vec<f32>) {
    for y in 0..size {
        for x in 0..size {
            let col = if mirror { size - 1 - x } else { x };
            let (r, c) = if transpose { (col, y) } else { (y, col) };
            dst.push(src[r * size + c]);
        }
    }
}

impl Batch {
    /// `flips` draws one transpose/mirror decision per pair, applied to both of its patches.
    fn assemble(
        dataset: &PairDataset,
        start: usize,
        end: usize,
        mut flips: Option<ChaCha8Rng>,
    ) -> Self {
        let p = dataset.patch_size();
        let len = end - start;
        let mut anchors = Vec::with_capacity(len * p * p);
        let mut positives = Vec::with_capacity(len * p * p);
        for i in start..end {
            let (a, pos) = dataset.pair(i);
            match flips.as_mut() {
                Some(rng) => {
                    let mirror = rng.random::<f32>() > 0.5;
                    let transpose = rng.random::<f32>() > 0.5;
                    push_flipped(a, p, transpose, mirror, &mut anchors);
                    push_flipped(pos, p, transpose, mirror, &mut positives);
                }
                None => {
                    anchors.extend_from_slice(a);
                    positives.extend_from_slice(pos);
                }
            }
        }
        Self {
            anchors,
            positives,
            len,
            patch_size: p,
        }
    }

    /// `[N,1,P,P]` anchor and positive tensors.
    pub fn into_tensors<B: Backend>(self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let shape = [self.len, 1, self.patch_size, self.patch_size];
        let a = Tensor::from_data(TensorData::new(self.anchors, shape), device);
        let p = Tensor::from_data(TensorData::new(self.positives, shape), device);
        (a, p)
    }
}

/// How batches of one pass are cut and flipped.
#[derive(Debug, Clone, Copy)]
struct PassPlan {
    batch_size: usize,
    fliprot_seed: Option<u64>,
    epoch: usize,
}

impl PassPlan {
    fn batch(&self, dataset: &PairDataset, k: usize) -> Batch {
        let start = k * self.batch_size;
        let end = (start + self.batch_size).min(dataset.len());
        // One ChaCha stream per (epoch, batch), so flips do not depend on which worker runs it.
        let flips = self.fliprot_seed.map(|seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(((self.epoch as u64) << 32) | k as u64);
            rng
        });
        Batch::assemble(dataset, start, end, flips)
    }
}

/// Splits a [`PairDataset`] into batches in dataset order; the final batch may be short.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    dataset: Arc<PairDataset>,
    batch_size: usize,
    num_workers: usize,
    prefetch: usize,
    fliprot_seed: Option<u64>,
}

impl BatchLoader {
    /// `num_workers == 0` assembles batches on the consuming thread.
    pub fn new(dataset: Arc<PairDataset>, batch_size: usize, num_workers: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        Ok(Self {
            dataset,
            batch_size,
            num_workers,
            prefetch: 2,
            fliprot_seed: None,
        })
    }

    /// Randomly transpose and mirror each pair (both patches alike), seeded per epoch and batch.
    pub fn with_fliprot(mut self, seed: u64) -> Self {
        self.fliprot_seed = Some(seed);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Start a pass over the dataset as epoch 0.
    pub fn iter(&self) -> BatchIter {
        self.pass(0)
    }

    /// Start the pass for `epoch`; only the flips depend on it.
    pub fn pass(&self, epoch: usize) -> BatchIter {
        let total = self.num_batches();
        let workers = self.num_workers.min(total);
        debug!("loader pass: {total} batches of {} on {workers} workers", self.batch_size);
        let plan = PassPlan {
            batch_size: self.batch_size,
            fliprot_seed: self.fliprot_seed,
            epoch,
        };
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for w in 0..workers {
            let (tx, rx) = mpsc::sync_channel(self.prefetch.max(1));
            let dataset = Arc::clone(&self.dataset);
            handles.push(thread::spawn(move || {
                for k in (w..total).step_by(workers) {
                    if tx.send(plan.batch(&dataset, k)).is_err() {
                        break;
                    }
                }
            }));
            receivers.push(rx);
        }

        BatchIter {
            dataset: Arc::clone(&self.dataset),
            plan,
            next: 0,
            total,
            receivers,
            handles,
        }
    }
}

/// Iterator over one pass; batch `k` always comes from worker `k % workers`, so the order matches
/// the dataset regardless of the worker count.
pub struct BatchIter {
    dataset: Arc<PairDataset>,
    plan: PassPlan,
    next: usize,
    total: usize,
    receivers: Vec<Receiver<Batch>>,
    handles: Vec<JoinHandle<()>>,
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let k = self.next;
        self.next += 1;
        if self.receivers.is_empty() {
            return Some(Ok(self.plan.batch(&self.dataset, k)));
        }
        let rx = &self.receivers[k % self.receivers.len()];
        Some(
            rx.recv()
                .map_err(|_| Error::Dataset(format!("loader worker for batch {k} exited early"))),
        )
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        // Closing the queues unblocks any worker waiting on a full channel.
        self.receivers.clear();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled_set(n: usize, size: usize) -> Arc<PatchSet> {
        let mut pixels = Vec::with_capacity(n * size * size);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            pixels.extend(std::iter::repeat(i as f32 / n as f32).take(size * size));
            labels.push((i / 3) as u64);
        }
        Arc::new(PatchSet::new(size, pixels, labels).unwrap())
    }

    #[test]
    fn sampled_pairs_share_labels_and_differ() {
        let set = labelled_set(30, 4);
        let ds = PairDataset::sample(Arc::clone(&set), 500, 1).unwrap();
        assert_eq!(ds.len(), 500);
        for &(a, p) in &ds.pairs {
            assert_ne!(a, p);
            assert_eq!(set.label(a), set.label(p));
        }
    }

    #[test]
    fn sampling_is_seeded() {
        let set = labelled_set(30, 4);
        let a = PairDataset::sample(Arc::clone(&set), 64, 7).unwrap();
        let b = PairDataset::sample(Arc::clone(&set), 64, 7).unwrap();
        let c = PairDataset::sample(set, 64, 8).unwrap();
        assert_eq!(a.pairs, b.pairs);
        assert_ne!(a.pairs, c.pairs);
    }

    #[test]
    fn sampling_needs_a_repeated_label() {
        let set = Arc::new(PatchSet::new(2, vec![0.0; 8], vec![1, 2]).unwrap());
        assert!(PairDataset::sample(set, 4, 0).is_err());
    }

    fn collect_batches(loader: &BatchLoader) -> Vec<Batch> {
        loader.iter().map(|b| b.unwrap()).collect()
    }

    #[test]
    fn worker_count_does_not_change_batch_order() {
        let set = labelled_set(30, 4);
        let ds = Arc::new(PairDataset::sample(set, 103, 3).unwrap());
        let serial = collect_batches(&BatchLoader::new(Arc::clone(&ds), 10, 0).unwrap());
        let threaded = collect_batches(&BatchLoader::new(ds, 10, 3).unwrap());
        assert_eq!(serial.len(), 11);
        assert_eq!(threaded.len(), 11);
        assert_eq!(serial.last().unwrap().len, 3);
        for (s, t) in serial.iter().zip(&threaded) {
            assert_eq!(s.anchors, t.anchors);
            assert_eq!(s.positives, t.positives);
        }
    }

    #[test]
    fn flips_transpose_then_mirror() {
        // [[0, 1], [2, 3]]
        let src = [0.0, 1.0, 2.0, 3.0];
        let mut out = Vec::new();
        push_flipped(&src, 2, false, false, &mut out);
        push_flipped(&src, 2, true, false, &mut out);
        push_flipped(&src, 2, false, true, &mut out);
        push_flipped(&src, 2, true, true, &mut out);
        assert_eq!(
            out,
            vec![0.0, 1.0, 2.0, 3.0, 0.0, 2.0, 1.0, 3.0, 1.0, 0.0, 3.0, 2.0, 2.0, 0.0, 3.0, 1.0]
        );
    }

    fn asymmetric_identical_pairs(n: usize, size: usize) -> Arc<PairDataset> {
        let pixels: Vec<f32> = (0..n * size * size).map(|i| i as f32).collect();
        let labels = (0..n as u64).collect();
        let set = Arc::new(PatchSet::new(size, pixels, labels).unwrap());
        Arc::new(PairDataset::new(set, (0..n).map(|i| (i, i)).collect()).unwrap())
    }

    #[test]
    fn fliprot_treats_both_patches_of_a_pair_alike() {
        let ds = asymmetric_identical_pairs(40, 4);
        let plain = collect_batches(&BatchLoader::new(Arc::clone(&ds), 8, 0).unwrap());
        let flipped = collect_batches(&BatchLoader::new(ds, 8, 0).unwrap().with_fliprot(5));
        for b in &flipped {
            assert_eq!(b.anchors, b.positives);
        }
        assert!(plain.iter().zip(&flipped).any(|(p, f)| p.anchors != f.anchors));
    }

    #[test]
    fn fliprot_is_seeded_per_epoch_and_worker_independent() {
        let ds = asymmetric_identical_pairs(40, 4);
        let serial = BatchLoader::new(Arc::clone(&ds), 8, 0).unwrap().with_fliprot(5);
        let threaded = BatchLoader::new(ds, 8, 3).unwrap().with_fliprot(5);
        let pass = |l: &BatchLoader, epoch| -> Vec<Vec<f32>> {
            l.pass(epoch).map(|b| b.unwrap().anchors).collect()
        };
        assert_eq!(pass(&serial, 1), pass(&threaded, 1));
        assert_eq!(pass(&serial, 1), pass(&serial, 1));
        assert_ne!(pass(&serial, 1), pass(&serial, 2));
    }

    #[test]
    fn dropping_a_pass_early_stops_workers() {
        let set = labelled_set(30, 4);
        let ds = Arc::new(PairDataset::sample(set, 1_000, 3).unwrap());
        let loader = BatchLoader::new(ds, 4, 4).unwrap();
        let mut it = loader.iter();
        assert!(it.next().is_some());
        drop(it);
    }

    #[test]
    fn phototour_pages_are_cut_row_major() {
        let tmp = tempfile::tempdir().unwrap();
        let mut page = image::GrayImage::new(1024, 1024);
        for (x, y, px) in page.enumerate_pixels_mut() {
            // Each 64x64 cell gets its own gray level.
            let cell = (y as usize / 64) * 16 + x as usize / 64;
            px.0[0] = (cell % 256) as u8;
        }
        page.save(tmp.path().join("patches0000.png")).unwrap();
        fs::write(tmp.path().join("info.txt"), "7 0\n7 0\n9 0\n").unwrap();

        let set = load_phototour(tmp.path()).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.patch_size(), 64);
        assert_eq!(set.label(2), 9);
        assert!(set.patch(1).iter().all(|&v| (v - 1.0 / 255.0).abs() < 1e-7));
        assert!(set.patch(2).iter().all(|&v| (v - 2.0 / 255.0).abs() < 1e-7));
    }

    #[test]
    fn phototour_rejects_short_pages() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("info.txt"), "1 0\n").unwrap();
        assert!(load_phototour(tmp.path()).is_err());
    }
}
