//! Human-readable view of the inpainting mask.

use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::image::luma601;

/// Blend the mask with the human photo for inspection.
///
/// Kept pixels show the photo, repainted pixels show mid gray. This is the
/// `((1 - mask) * signed(photo) + 1) / 2` display mapping, reduced to luma.
/// Generation never reads it.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn mask_preview(mask: &GrayImage, human: &RgbImage) -> GrayImage {
    debug_assert_eq!(mask.dimensions(), human.dimensions());

    GrayImage::from_fn(human.width(), human.height(), |x, y| {
        let m = f32::from(mask.get_pixel(x, y)[0]) / 255.0;
        let pixel = human.get_pixel(x, y);
        let mut blended = [0u8; 3];
        for (out, &v) in blended.iter_mut().zip(pixel.0.iter()) {
            // Safe: convex combination of values in [0, 255]
            *out = (1.0 - m).mul_add(f32::from(v), m * 127.5) as u8;
        }
        Luma([luma601(&Rgb(blended))])
    })
}
