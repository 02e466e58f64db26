use burn_core::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use orinet::augment::{random_affine, AugmentConfig};
use orinet::pipeline::affine_tensors;
use orinet::sampler::{extract_and_crop_by_transform, extract_patches, identity_transforms};

type B = NdArray<f32>;

fn make_patches(n: usize, size: usize, seed: u64) -> Tensor<B, 4> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data: Vec<f32> = (0..n * size * size).map(|_| rng.random::<f32>()).collect();
    Tensor::from_data(TensorData::new(data, [n, 1, size, size]), &Default::default())
}

fn bench_sampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampler");
    group.sample_size(20);
    let device = Default::default();

    for &(n, size) in &[(32usize, 32usize), (128, 32), (128, 64)] {
        let patches = make_patches(n, size, 123);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let aug = random_affine(n, size, size, &AugmentConfig::default(), &mut rng).unwrap();
        let (lafs, _) = affine_tensors::<B>(&aug, &device);
        let eye = identity_transforms::<B>(n, &device);

        group.bench_with_input(
            BenchmarkId::new("extract_patches", format!("n{n}_s{size}")),
            &(n, size),
            |b, _| b.iter(|| extract_patches(patches.clone(), lafs.clone(), size).unwrap()),
        );

        group.bench_with_input(
            BenchmarkId::new("extract_and_crop", format!("n{n}_s{size}")),
            &(n, size),
            |b, _| {
                b.iter(|| extract_and_crop_by_transform(patches.clone(), eye.clone(), size / 2).unwrap())
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_sampler);
criterion_main!(benches);
