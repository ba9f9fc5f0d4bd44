//! Conversions between rasters and model tensors.

use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4};

use super::{ImageTensor, RGB_CHANNELS};

/// Convert an RGB image to an NCHW tensor with values in [-1, 1].
#[must_use]
pub fn to_signed_tensor(img: &RgbImage) -> ImageTensor {
    to_tensor_with(img, |v| (f32::from(v) / 127.5) - 1.0)
}

/// Convert an RGB image to an NCHW tensor with values in [0, 1].
#[must_use]
pub fn to_unit_tensor(img: &RgbImage) -> ImageTensor {
    to_tensor_with(img, |v| f32::from(v) / 255.0)
}

fn to_tensor_with(img: &RgbImage, f: impl Fn(u8) -> f32) -> ImageTensor {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height, width));

    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            tensor[[0, c, y, x]] = f(pixel[c]);
        }
    }

    tensor
}

/// Convert an NCHW tensor with values in [-1, 1] back to an RGB image.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn tensor_to_rgb(tensor: &ImageTensor) -> RgbImage {
    let (_, _, height, width) = tensor.dim();
    // Safe: image dimensions come from u32 rasters
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    })
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = (value + 1.0) * 127.5;
    scaled.round().clamp(0.0, 255.0) as u8
}

/// ITU-R 601-2 luma, matching the usual "L" mode conversion.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn luma601(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    let weighted = u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114;
    // Safe: weights sum to 1000, so the quotient is at most 255
    ((weighted + 500) / 1000) as u8
}

/// Reverse the channel order into an HWC `u8` array (BGR), the layout the
/// DensePose renderer consumes.
#[must_use]
pub fn to_bgr_array(img: &RgbImage) -> Array3<u8> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    Array3::from_shape_fn((height, width, RGB_CHANNELS), |(y, x, c)| {
        // Safe: indices are bounded by the image dimensions
        #[allow(clippy::cast_possible_truncation)]
        let pixel = img.get_pixel(x as u32, y as u32);
        pixel[RGB_CHANNELS - 1 - c]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape() {
        let img = RgbImage::new(100, 60);
        let tensor = to_signed_tensor(&img);
        assert_eq!(tensor.shape(), &[1, 3, 60, 100]);
    }

    #[test]
    fn test_normalization_range() {
        let img = RgbImage::from_pixel(4, 4, Rgb([0, 255, 0]));
        let signed = to_signed_tensor(&img);
        assert!((signed[[0, 0, 1, 1]] + 1.0).abs() < 1e-6);
        assert!((signed[[0, 1, 1, 1]] - 1.0).abs() < 1e-6);

        let unit = to_unit_tensor(&img);
        assert!(unit[[0, 0, 2, 2]].abs() < 1e-6);
        assert!((unit[[0, 1, 2, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_denormalize_clamp() {
        assert_eq!(denormalize(-1.0), 0);
        assert_eq!(denormalize(1.0), 255);
        assert_eq!(denormalize(-2.0), 0);
        assert_eq!(denormalize(2.0), 255);
    }

    #[test]
    fn test_tensor_to_rgb_inverts_signed() {
        let img = RgbImage::from_fn(5, 3, |x, y| Rgb([(x * 40) as u8, (y * 90) as u8, 17]));
        let back = tensor_to_rgb(&to_signed_tensor(&img));
        assert_eq!(back, img);
    }

    #[test]
    fn test_luma601() {
        assert_eq!(luma601(&Rgb([0, 0, 0])), 0);
        assert_eq!(luma601(&Rgb([255, 255, 255])), 255);
        assert_eq!(luma601(&Rgb([255, 0, 0])), 76);
        assert_eq!(luma601(&Rgb([0, 0, 1])), 0);
    }

    #[test]
    fn test_bgr_order() {
        let img = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30]));
        let bgr = to_bgr_array(&img);
        assert_eq!(bgr.dim(), (2, 2, 3));
        assert_eq!(bgr[[1, 0, 0]], 30);
        assert_eq!(bgr[[1, 0, 2]], 10);
    }
}
