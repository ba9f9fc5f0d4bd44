//! Luma-threshold fallback mask.

use image::{GrayImage, Luma, RgbImage};

use crate::image::luma601;

/// Cutoff used when automatic masking is disabled.
///
/// At zero every pixel that is not black in luma is repainted, which for a
/// real photo is nearly the whole frame.
pub const MANUAL_THRESHOLD: u8 = 0;

/// Mark every pixel whose luma is strictly above `threshold` as 255.
#[must_use]
pub fn threshold_mask(img: &RgbImage, threshold: u8) -> GrayImage {
    let mask = GrayImage::from_fn(img.width(), img.height(), |x, y| {
        if luma601(img.get_pixel(x, y)) > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    if threshold == MANUAL_THRESHOLD {
        let kept = mask.pixels().filter(|p| p[0] == 0).count();
        tracing::warn!(
            "Manual mask at threshold {threshold} keeps only {kept} black pixels; \
             the rest of the photo will be repainted"
        );
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_zero_threshold_marks_all_but_black() {
        let img = RgbImage::from_fn(16, 16, |x, y| {
            if (x + y) % 5 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([(x * 10) as u8 + 5, 80, (y * 3) as u8])
            }
        });

        let mask = threshold_mask(&img, MANUAL_THRESHOLD);
        for (x, y, pixel) in mask.enumerate_pixels() {
            let expected = if (x + y) % 5 == 0 { 0 } else { 255 };
            assert_eq!(pixel[0], expected, "({x},{y})");
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let img = RgbImage::from_pixel(2, 2, Rgb([100, 100, 100]));
        assert!(threshold_mask(&img, 100).pixels().all(|p| p[0] == 0));
        assert!(threshold_mask(&img, 99).pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_near_black_rounds_to_kept() {
        // Luma rounds to the nearest integer, so faint blue reads as black.
        let img = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([0, 0, 4]),
            1 => Rgb([0, 0, 5]),
            _ => Rgb([1, 0, 0]),
        });
        let mask = threshold_mask(&img, MANUAL_THRESHOLD);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(1, 0)[0], 255);
        assert_eq!(mask.get_pixel(2, 0)[0], 0);
    }

    #[test]
    fn test_same_size_as_input() {
        let img = RgbImage::new(768, 1024);
        assert_eq!(threshold_mask(&img, 0).dimensions(), (768, 1024));
    }
}
