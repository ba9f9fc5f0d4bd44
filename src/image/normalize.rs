//! Canonical-size normalization of human and garment photos.

use image::{imageops, imageops::FilterType, DynamicImage, GenericImageView, RgbImage};

use crate::error::Result;

use super::load::ensure_non_empty;
use super::{CANONICAL_HEIGHT, CANONICAL_WIDTH};

/// Resampling filter used for every canonical-size resize.
const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// A rectangle inside the original human photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// Whether the pixel `(x, y)` lies inside the region.
    #[must_use]
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.left + self.width && y >= self.top && y < self.top + self.height
    }
}

/// Human photo after normalization.
///
/// Keeps what the compositor needs to put the generated region back.
#[derive(Debug, Clone)]
pub struct NormalizedHuman {
    /// RGB photo at the canonical 768x1024 size.
    pub canonical: RgbImage,
    /// The full RGB photo as supplied by the caller.
    pub original: RgbImage,
    /// Where the canonical image was cut from, when cropping was requested.
    pub crop: Option<CropRegion>,
}

/// Compute the largest centered 3:4 (width:height) rectangle inside
/// a `width`x`height` image.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn center_crop_region(width: u32, height: u32) -> CropRegion {
    let (w, h) = (f64::from(width), f64::from(height));
    // Whichever dimension is limiting keeps its full extent.
    let target_width = w.min(h * 3.0 / 4.0) as u32;
    let target_height = h.min(w * 4.0 / 3.0) as u32;

    CropRegion {
        left: (width - target_width) / 2,
        top: (height - target_height) / 2,
        width: target_width.max(1),
        height: target_height.max(1),
    }
}

/// Normalize a human photo to the canonical size.
///
/// With `auto_crop` the photo is first cut to a centered 3:4 rectangle so
/// the resize does not distort the person; the crop is recorded for
/// [`restore_crop`](super::restore_crop). Without it the photo is stretched.
///
/// # Errors
///
/// Returns an error if the image has no pixels.
pub fn normalize_human(img: &DynamicImage, auto_crop: bool) -> Result<NormalizedHuman> {
    ensure_non_empty("human", img)?;
    let original = img.to_rgb8();

    let (canonical, crop) = if auto_crop {
        let (width, height) = original.dimensions();
        let region = center_crop_region(width, height);
        tracing::debug!("Cropping human image {width}x{height} to {region:?}");
        let cropped =
            imageops::crop_imm(&original, region.left, region.top, region.width, region.height)
                .to_image();
        (resize_canonical(&cropped), Some(region))
    } else {
        (resize_canonical(&original), None)
    };

    Ok(NormalizedHuman {
        canonical,
        original,
        crop,
    })
}

/// Normalize a garment photo to the canonical size, ignoring its aspect ratio.
///
/// # Errors
///
/// Returns an error if the image has no pixels.
pub fn normalize_garment(img: &DynamicImage) -> Result<RgbImage> {
    ensure_non_empty("garment", img)?;
    let (width, height) = img.dimensions();
    tracing::debug!("Resizing garment image {width}x{height}");
    Ok(resize_canonical(&img.to_rgb8()))
}

fn resize_canonical(img: &RgbImage) -> RgbImage {
    if img.dimensions() == (CANONICAL_WIDTH, CANONICAL_HEIGHT) {
        return img.clone();
    }
    imageops::resize(img, CANONICAL_WIDTH, CANONICAL_HEIGHT, RESIZE_FILTER)
}
