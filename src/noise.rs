//! Random sources for the stochastic part of the reverse step.
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tch::{Device, Kind, Tensor};

/// A stateful source of standard-normal tensors.
///
/// Each sampler owns exactly one source, so draws are reproducible from the
/// seed alone and independent of any other sampler running alongside it.
pub trait NoiseSource {
    fn next_normal_tensor(&mut self, shape: &[i64], options: (Kind, Device)) -> Tensor;
}

/// ChaCha8 backed source, seeded once per generation run.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: ChaCha8Rng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed) }
    }
}

impl NoiseSource for SeededNoise {
    fn next_normal_tensor(&mut self, shape: &[i64], (kind, device): (Kind, Device)) -> Tensor {
        let numel: i64 = shape.iter().product();
        let values: Vec<f32> =
            (0..numel.max(0)).map(|_| StandardNormal.sample(&mut self.rng)).collect();
        Tensor::from_slice(&values).reshape(shape).to_kind(kind).to_device(device)
    }
}

impl<N: NoiseSource + ?Sized> NoiseSource for Box<N> {
    fn next_normal_tensor(&mut self, shape: &[i64], options: (Kind, Device)) -> Tensor {
        (**self).next_normal_tensor(shape, options)
    }
}
