//! Pasting the generated region back into the uncropped photo.

use image::{imageops, imageops::FilterType, RgbImage};

use super::normalize::CropRegion;

/// Resize `generated` to the crop rectangle and paste it into a copy of
/// `original` at the crop offset.
///
/// Pixels outside `region` are left exactly as they were. Colour or
/// lighting differences at the rectangle border show up as a seam; that is
/// accepted.
#[must_use]
pub fn restore_crop(original: &RgbImage, generated: &RgbImage, region: CropRegion) -> RgbImage {
    let patch = if generated.dimensions() == (region.width, region.height) {
        generated.clone()
    } else {
        imageops::resize(generated, region.width, region.height, FilterType::Lanczos3)
    };

    let mut composite = original.clone();
    imageops::replace(
        &mut composite,
        &patch,
        i64::from(region.left),
        i64::from(region.top),
    );
    composite
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::center_crop_region;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_outside_pixels_untouched() {
        let original = gradient(1000, 1500);
        let generated = RgbImage::from_pixel(768, 1024, Rgb([255, 0, 255]));
        let region = center_crop_region(1000, 1500);

        let out = restore_crop(&original, &generated, region);
        assert_eq!(out.dimensions(), (1000, 1500));

        for (x, y, pixel) in out.enumerate_pixels() {
            if region.contains(x, y) {
                assert_eq!(*pixel, Rgb([255, 0, 255]), "inside ({x},{y})");
            } else {
                assert_eq!(pixel, original.get_pixel(x, y), "outside ({x},{y})");
            }
        }
    }

    #[test]
    fn test_wide_image_side_bands_preserved() {
        let original = gradient(1600, 900);
        let generated = RgbImage::from_pixel(768, 1024, Rgb([1, 2, 3]));
        let region = center_crop_region(1600, 900);

        let out = restore_crop(&original, &generated, region);
        assert_eq!(out.get_pixel(0, 450), original.get_pixel(0, 450));
        assert_eq!(out.get_pixel(1599, 10), original.get_pixel(1599, 10));
        assert_eq!(*out.get_pixel(800, 450), Rgb([1, 2, 3]));
    }
}
