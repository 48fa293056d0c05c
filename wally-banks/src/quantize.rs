//! INT8 quantization of centroids.
//!
//! Each centroid is L2-normalised, scaled by 127, rounded and clipped, so the
//! dot product of two quantized vectors is proportional to their cosine
//! similarity and can be computed with integer arithmetic only.

use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Scale applied to unit-length components before rounding.
pub const QUANT_SCALE: f32 = 127.0;

/// Quantize one centroid.
///
/// A zero-norm centroid maps to the all-zero vector. Rounding is
/// half-to-even and every component lands in `[-127, 127]`.
pub fn quantize_centroid(centroid: &ArrayView1<f32>) -> Array1<i8> {
    let mut norm = centroid.dot(centroid).sqrt();
    if norm == 0.0 {
        norm = 1.0;
    }

    centroid.mapv(|v| {
        let scaled = (v / norm * QUANT_SCALE).round_ties_even();
        scaled.clamp(-QUANT_SCALE, QUANT_SCALE) as i8
    })
}

/// Quantize every row of a `[K, D]` centroid matrix.
pub fn quantize_centroids(centroids: &Array2<f32>) -> Array2<i8> {
    let mut quantized = Array2::<i8>::zeros(centroids.raw_dim());
    for (mut out, row) in quantized
        .axis_iter_mut(Axis(0))
        .zip(centroids.axis_iter(Axis(0)))
    {
        out.assign(&quantize_centroid(&row));
    }
    quantized
}

/// Integer dot product of two quantized vectors.
pub fn dot_i8(a: &ArrayView1<i8>, b: &ArrayView1<i8>) -> i32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as i32 * y as i32)
        .sum()
}
