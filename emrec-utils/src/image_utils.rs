use image::{GrayImage, Luma, Rgb, RgbImage, imageops::FilterType};
use ndarray::Array2;

// Fixed-point luma weights (Q14) used by OpenCV's BGR2GRAY conversion.
const LUMA_B: u32 = 1_868;
const LUMA_G: u32 = 9_617;
const LUMA_R: u32 = 4_899;
const LUMA_SHIFT: u32 = 14;
const LUMA_ROUND: u32 = 1 << (LUMA_SHIFT - 1);

#[inline]
fn mix_luma(red: u8, green: u8, blue: u8) -> u8 {
    let acc = blue as u32 * LUMA_B + green as u32 * LUMA_G + red as u32 * LUMA_R + LUMA_ROUND;
    (acc >> LUMA_SHIFT).min(255) as u8
}

/// Convert a three-channel buffer stored in blue-green-red order to grayscale.
///
/// The weights reproduce OpenCV's integer conversion exactly, so replicated gray
/// pixels come back unchanged.
pub fn bgr_to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let Rgb([b, g, r]) = *image.get_pixel(x, y);
        Luma([mix_luma(r, g, b)])
    })
}

/// Convert an RGB image to grayscale with the same weights as [`bgr_to_gray`].
pub fn rgb_to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        Luma([mix_luma(r, g, b)])
    })
}

/// Replicate a grayscale image into three identical channels.
pub fn gray_to_rgb(image: &GrayImage) -> RgbImage {
    let (width, height) = image.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let Luma([v]) = *image.get_pixel(x, y);
        Rgb([v, v, v])
    })
}

/// Swap the first and last channel of every pixel (RGB <-> BGR).
pub fn reverse_channels(image: &RgbImage) -> RgbImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        pixel.0.reverse();
    }
    out
}

/// Resize a grayscale image to exactly `width` x `height` using `filter`.
///
/// Returns `None` when either the source or the target is empty.
pub fn resize_gray(
    image: &GrayImage,
    width: u32,
    height: u32,
    filter: FilterType,
) -> Option<GrayImage> {
    if image.width() == 0 || image.height() == 0 || width == 0 || height == 0 {
        return None;
    }
    if image.dimensions() == (width, height) {
        return Some(image.clone());
    }
    Some(image::imageops::resize(image, width, height, filter))
}

/// Convert a grayscale image into a `(height, width)` array scaled into `[0, 1]`.
pub fn gray_to_unit_array(image: &GrayImage) -> Array2<f32> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(row, col)| {
        image.get_pixel(col as u32, row as u32)[0] as f32 / 255.0
    })
}
