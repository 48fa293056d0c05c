//! Deterministic augmentation of source crops.
//!
//! Every source image expands into the same fixed bundle of twelve variants so
//! that a label's centroids tolerate lighting, small rotations and blur.
//! No randomness is involved.

use image::{imageops, Rgb, RgbImage};

/// Number of variants produced per source image.
pub const AUGMENTATIONS_PER_IMAGE: usize = 12;

/// One entry of the augmentation plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Augmentation {
    /// The decoded image, untouched
    Original,
    /// Counter-clockwise rotation in degrees, same canvas size, bilinear
    Rotate(f32),
    /// Blend towards black by the given factor
    Brightness(f32),
    /// Blend towards the mean grey level by the given factor
    Contrast(f32),
    /// Gaussian blur with the given standard deviation
    GaussianBlur(f32),
}

/// The fixed plan, in output order.
///
/// The 1.0 brightness and contrast entries reproduce the original appearance
/// but stay in the grid so every image yields the same variant count.
pub const AUGMENTATION_PLAN: [Augmentation; AUGMENTATIONS_PER_IMAGE] = [
    Augmentation::Original,
    Augmentation::Rotate(-15.0),
    Augmentation::Rotate(-8.0),
    Augmentation::Rotate(8.0),
    Augmentation::Rotate(15.0),
    Augmentation::Brightness(0.85),
    Augmentation::Brightness(1.0),
    Augmentation::Brightness(1.15),
    Augmentation::Contrast(0.85),
    Augmentation::Contrast(1.0),
    Augmentation::Contrast(1.15),
    Augmentation::GaussianBlur(1.2),
];

impl Augmentation {
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        match *self {
            Augmentation::Original => image.clone(),
            Augmentation::Rotate(degrees) => rotate_bilinear(image, degrees),
            Augmentation::Brightness(factor) => blend_towards(image, Rgb([0, 0, 0]), factor),
            Augmentation::Contrast(factor) => {
                let grey = mean_luma(image);
                blend_towards(image, Rgb([grey, grey, grey]), factor)
            }
            Augmentation::GaussianBlur(sigma) => imageops::blur(image, sigma),
        }
    }
}

/// Expand one image into its [`AUGMENTATIONS_PER_IMAGE`] variants, in plan order.
pub fn augment(image: &RgbImage) -> Vec<RgbImage> {
    AUGMENTATION_PLAN.iter().map(|a| a.apply(image)).collect()
}

/// Rotate about the image centre without expanding the canvas.
///
/// Output pixels whose source falls outside the image are black; neighbours on
/// the border are clamped to the edge.
fn rotate_bilinear(image: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut out = RgbImage::new(width, height);
    if width == 0 || height == 0 {
        return out;
    }

    let (sin, cos) = (degrees as f64).to_radians().sin_cos();
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let dx = x as f64 + 0.5 - cx;
        let dy = y as f64 + 0.5 - cy;
        let xin = cos * dx - sin * dy + cx;
        let yin = sin * dx + cos * dy + cy;

        if xin < 0.0 || yin < 0.0 || xin >= width as f64 || yin >= height as f64 {
            continue;
        }
        *pixel = sample_bilinear(image, xin - 0.5, yin - 0.5);
    }

    out
}

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let clamp_x = |v: f64| v.clamp(0.0, (width - 1) as f64) as u32;
    let clamp_y = |v: f64| v.clamp(0.0, (height - 1) as f64) as u32;
    let (xa, xb) = (clamp_x(x0), clamp_x(x0 + 1.0));
    let (ya, yb) = (clamp_y(y0), clamp_y(y0 + 1.0));

    let p00 = image.get_pixel(xa, ya);
    let p10 = image.get_pixel(xb, ya);
    let p01 = image.get_pixel(xa, yb);
    let p11 = image.get_pixel(xb, yb);

    let mut rgb = [0u8; 3];
    for (c, slot) in rgb.iter_mut().enumerate() {
        let top = p00[c] as f64 + fx * (p10[c] as f64 - p00[c] as f64);
        let bottom = p01[c] as f64 + fx * (p11[c] as f64 - p01[c] as f64);
        *slot = (top + fy * (bottom - top)).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(rgb)
}

/// `degenerate + factor * (pixel - degenerate)`, clamped and truncated to u8.
fn blend_towards(image: &RgbImage, degenerate: Rgb<u8>, factor: f32) -> RgbImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for c in 0..3 {
            let d = degenerate[c] as f32;
            let v = d + factor * (pixel[c] as f32 - d);
            pixel[c] = v.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Rounded mean of the ITU-R 601-2 luma of every pixel.
fn mean_luma(image: &RgbImage) -> u8 {
    let count = image.pixels().len();
    if count == 0 {
        return 0;
    }
    let total: u64 = image
        .pixels()
        .map(|p| (p[0] as u64 * 19595 + p[1] as u64 * 38470 + p[2] as u64 * 7471 + 0x8000) >> 16)
        .sum();
    (total as f64 / count as f64 + 0.5).min(255.0) as u8
}
