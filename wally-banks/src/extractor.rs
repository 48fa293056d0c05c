//! Feature extraction seam between the pipeline and a frozen backbone.
//!
//! Backbones live outside this crate (see `wally-banks-onnx`); the pipeline
//! only needs something that maps one RGB image to one fixed-length vector.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array1, Array4, ArrayView4};

use crate::error::{Error, Result};

/// A frozen, inference-only image embedding model.
///
/// Implementations are loaded once per run and must not change after loading:
/// the same input always maps to the same vector.
pub trait FeatureExtractor {
    /// Length `D` of every vector returned by [`FeatureExtractor::forward`].
    fn embedding_dim(&self) -> usize;

    /// Run one forward pass over a `[1, 3, H, W]` tensor scaled to `[0, 1]`.
    fn forward(&self, input: ArrayView4<f32>) -> Result<Array1<f32>>;

    /// Preprocess `image` at `size x size` and embed it, checking the output
    /// length against [`FeatureExtractor::embedding_dim`].
    fn extract(&self, image: &RgbImage, size: u32) -> Result<Array1<f32>> {
        let input = preprocess(image, size);
        let embedding = self.forward(input.view())?;
        if embedding.len() != self.embedding_dim() {
            return Err(Error::Extraction(format!(
                "backbone produced {} features, expected {}",
                embedding.len(),
                self.embedding_dim()
            )));
        }
        Ok(embedding)
    }
}

impl<T: FeatureExtractor + ?Sized> FeatureExtractor for &T {
    fn embedding_dim(&self) -> usize {
        (**self).embedding_dim()
    }

    fn forward(&self, input: ArrayView4<f32>) -> Result<Array1<f32>> {
        (**self).forward(input)
    }
}

impl<T: FeatureExtractor + ?Sized> FeatureExtractor for Box<T> {
    fn embedding_dim(&self) -> usize {
        (**self).embedding_dim()
    }

    fn forward(&self, input: ArrayView4<f32>) -> Result<Array1<f32>> {
        (**self).forward(input)
    }
}

/// Resize to `size x size` and lay the pixels out as a `[1, 3, size, size]`
/// tensor scaled to `[0, 1]`.
pub fn preprocess(image: &RgbImage, size: u32) -> Array4<f32> {
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    let side = size as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}
