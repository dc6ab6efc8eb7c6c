//! Distance metrics for vector comparison.
//!
//! Every metric is a pure function of two equal-length slices and follows one
//! convention: **lower is closer**. Similarity-style measures (cosine, dot
//! product) are therefore expressed as distances.
//!
//! # Performance Strategy
//!
//! The squared-L2 kernel is the hot path of both graph construction and
//! search. On x86_64 with AVX2 it runs four independent FMA accumulators so
//! the pipeline stays limited by throughput instead of FMA latency; other
//! targets use a portable scalar loop.

use anyhow::Result;

/// Distance metric for vector comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    /// Euclidean distance
    L2,
    /// Squared Euclidean distance (same ordering as `L2`, no square root)
    L2Squared,
    /// `1 - cos(a, b)`
    #[default]
    Cosine,
    /// Negated inner product
    DotProduct,
}

impl DistanceMetric {
    /// Parses a metric name as accepted in index options.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown metric name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "l2" => Ok(Self::L2),
            "l2sq" => Ok(Self::L2Squared),
            "cosine" => Ok(Self::Cosine),
            "dotproduct" => Ok(Self::DotProduct),
            other => anyhow::bail!("Unknown distance metric: {other}"),
        }
    }

    /// Canonical option name of this metric
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::L2 => "l2",
            Self::L2Squared => "l2sq",
            Self::Cosine => "cosine",
            Self::DotProduct => "dotproduct",
        }
    }

    /// Computes the distance between `a` and `b`.
    ///
    /// Both slices must have the index dimension.
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            Self::L2 => f64::from(squared_l2(a, b)).sqrt(),
            Self::L2Squared => f64::from(squared_l2(a, b)),
            Self::Cosine => cosine_distance(a, b),
            Self::DotProduct => -f64::from(dot(a, b)),
        }
    }
}

/// Euclidean distance between two vectors
#[inline]
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    squared_l2(a, b).sqrt()
}

/// Cosine distance (`1 - cosine_similarity`).
///
/// A zero vector has no direction; its distance to anything is 1.
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut ab = 0.0_f64;
    let mut aa = 0.0_f64;
    let mut bb = 0.0_f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    let norm = (aa * bb).sqrt();
    if norm == 0.0 {
        return 1.0;
    }
    1.0 - ab / norm
}

/// Inner product of two vectors
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0_f32; 4];
    let chunks_a = a.chunks_exact(4);
    let chunks_b = b.chunks_exact(4);
    let tail: f32 = chunks_a.remainder().iter().zip(chunks_b.remainder()).map(|(x, y)| x * y).sum();
    for (ca, cb) in chunks_a.zip(chunks_b) {
        for ((slot, x), y) in acc.iter_mut().zip(ca).zip(cb) {
            *slot += x * y;
        }
    }
    acc.iter().sum::<f32>() + tail
}

/// Squared Euclidean distance with runtime SIMD dispatch.
#[inline]
#[must_use]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            // SAFETY: the required CPU features were detected at runtime.
            return unsafe { squared_l2_avx2(a, b) };
        }
    }

    squared_l2_scalar(a, b)
}

/// Scalar implementation (portable fallback)
#[inline]
#[must_use]
pub fn squared_l2_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// AVX2 implementation with 4-way accumulator unrolling (x86_64 only)
///
/// Main loop: 32 floats per iteration (4 accumulators × 8 lanes).
/// Tail loop: remaining 8-float chunks. Scalar tail: final <8 elements.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn squared_l2_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::{
        __m256, _mm_add_ps, _mm_add_ss, _mm_cvtss_f32, _mm_movehl_ps, _mm_shuffle_ps,
        _mm256_add_ps, _mm256_castps256_ps128, _mm256_extractf128_ps, _mm256_fmadd_ps,
        _mm256_loadu_ps, _mm256_setzero_ps, _mm256_sub_ps,
    };

    let len = a.len().min(b.len());
    let pa = a.as_ptr();
    let pb = b.as_ptr();

    let mut acc = [_mm256_setzero_ps(); 4];
    let mut i = 0;
    while i + 32 <= len {
        for (lane, slot) in acc.iter_mut().enumerate() {
            let at = i + lane * 8;
            // SAFETY: `at + 8 <= len` for both slices.
            let d: __m256 =
                unsafe { _mm256_sub_ps(_mm256_loadu_ps(pa.add(at)), _mm256_loadu_ps(pb.add(at))) };
            *slot = _mm256_fmadd_ps(d, d, *slot);
        }
        i += 32;
    }
    while i + 8 <= len {
        // SAFETY: `i + 8 <= len` for both slices.
        let d: __m256 =
            unsafe { _mm256_sub_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i))) };
        acc[0] = _mm256_fmadd_ps(d, d, acc[0]);
        i += 8;
    }

    let sum = _mm256_add_ps(_mm256_add_ps(acc[0], acc[1]), _mm256_add_ps(acc[2], acc[3]));
    let sum128 = _mm_add_ps(_mm256_castps256_ps128(sum), _mm256_extractf128_ps(sum, 1));
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 0x55));

    let mut total = _mm_cvtss_f32(sum32);
    for (x, y) in a[i..len].iter().zip(&b[i..len]) {
        let d = x - y;
        total += d * d;
    }
    total
}
