use image::{imageops::FilterType, DynamicImage};
use ndarray::Array3;
use std::path::Path;

use crate::error::{Error, Result};

/// Decode an image file.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Resize to `size x size` RGB and scale `[0, 255]` to `[-1, 1]`, layout `[H, W, 3]`.
pub fn preprocess_image(img: &DynamicImage, size: u32) -> Array3<f32> {
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let side = size as usize;

    Array3::from_shape_fn((side, side, 3), |(y, x, c)| {
        let value = rgb.get_pixel(x as u32, y as u32)[c];
        (value as f32 / 255.0) * 2.0 - 1.0
    })
}
