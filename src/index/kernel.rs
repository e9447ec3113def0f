//! Distance kernels behind a capability-selected trait object.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Similarity metric of the vector index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cos(a, b)`; vectors are normalised on insert.
    #[default]
    Cosine,
    /// Euclidean distance.
    Euclidean,
}

impl Metric {
    /// Converts a distance into a similarity score where larger is better.
    pub fn score(self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::Euclidean => 1.0 / (1.0 + distance),
        }
    }
}

/// Batch distance evaluation. GPU or SIMD backends plug in here.
pub trait VectorKernel: Send + Sync {
    /// Short name for logs and stats.
    fn name(&self) -> &'static str;

    /// Dot product.
    fn dot(&self, a: &[f32], b: &[f32]) -> f32;

    /// Squared Euclidean distance.
    fn l2_squared(&self, a: &[f32], b: &[f32]) -> f32;

    /// Distance under `metric`. Cosine inputs must already be normalised.
    fn distance(&self, metric: Metric, a: &[f32], b: &[f32]) -> f32 {
        match metric {
            Metric::Cosine => 1.0 - self.dot(a, b),
            Metric::Euclidean => self.l2_squared(a, b).sqrt(),
        }
    }

    /// Distances from `query` to each candidate, written into `out`.
    fn distances(&self, metric: Metric, query: &[f32], candidates: &[&[f32]], out: &mut Vec<f32>) {
        out.clear();
        out.extend(candidates.iter().map(|c| self.distance(metric, query, c)));
    }
}

/// Straightforward element-at-a-time kernel.
pub struct ScalarKernel;

impl VectorKernel for ScalarKernel {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn l2_squared(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum()
    }
}

const LANES: usize = 8;

/// Kernel with independent lane accumulators that the compiler can vectorise.
pub struct ChunkedKernel;

impl VectorKernel for ChunkedKernel {
    fn name(&self) -> &'static str {
        "chunked"
    }

    fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        let len = a.len().min(b.len());
        let (a, b) = (&a[..len], &b[..len]);
        let mut acc = [0f32; LANES];
        let mut chunks_a = a.chunks_exact(LANES);
        let mut chunks_b = b.chunks_exact(LANES);
        for (ca, cb) in (&mut chunks_a).zip(&mut chunks_b) {
            for lane in 0..LANES {
                acc[lane] += ca[lane] * cb[lane];
            }
        }
        let tail: f32 = chunks_a
            .remainder()
            .iter()
            .zip(chunks_b.remainder())
            .map(|(x, y)| x * y)
            .sum();
        acc.iter().sum::<f32>() + tail
    }

    fn l2_squared(&self, a: &[f32], b: &[f32]) -> f32 {
        let len = a.len().min(b.len());
        let (a, b) = (&a[..len], &b[..len]);
        let mut acc = [0f32; LANES];
        let mut chunks_a = a.chunks_exact(LANES);
        let mut chunks_b = b.chunks_exact(LANES);
        for (ca, cb) in (&mut chunks_a).zip(&mut chunks_b) {
            for lane in 0..LANES {
                let d = ca[lane] - cb[lane];
                acc[lane] += d * d;
            }
        }
        let tail: f32 = chunks_a
            .remainder()
            .iter()
            .zip(chunks_b.remainder())
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        acc.iter().sum::<f32>() + tail
    }
}

/// Picks the best kernel the current CPU supports.
pub fn detect_kernel() -> Arc<dyn VectorKernel> {
    if wide_registers_available() {
        Arc::new(ChunkedKernel)
    } else {
        Arc::new(ScalarKernel)
    }
}

#[cfg(target_arch = "x86_64")]
fn wide_registers_available() -> bool {
    std::arch::is_x86_feature_detected!("avx2") || std::arch::is_x86_feature_detected!("sse4.1")
}

#[cfg(target_arch = "aarch64")]
fn wide_registers_available() -> bool {
    true
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn wide_registers_available() -> bool {
    false
}

/// Scales `v` to unit length in place. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernels_agree() {
        let a: Vec<f32> = (0..19).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..19).map(|i| 3.0 - i as f32 * 0.25).collect();
        let scalar = ScalarKernel;
        let chunked = ChunkedKernel;
        assert!((scalar.dot(&a, &b) - chunked.dot(&a, &b)).abs() < 1e-3);
        assert!((scalar.l2_squared(&a, &b) - chunked.l2_squared(&a, &b)).abs() < 1e-3);
    }

    #[test]
    fn cosine_distance_of_normalised_vectors() {
        let mut a = vec![3.0, 4.0];
        let mut b = vec![6.0, 8.0];
        normalize(&mut a);
        normalize(&mut b);
        let d = detect_kernel().distance(Metric::Cosine, &a, &b);
        assert!(d.abs() < 1e-6);
        assert!((Metric::Cosine.score(d) - 1.0).abs() < 1e-6);
    }
}
