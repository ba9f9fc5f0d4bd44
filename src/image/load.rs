//! Image loading utilities.

use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};

use crate::error::{Error, Result};

/// Load an image from disk with its EXIF orientation applied.
///
/// Phone photos are commonly stored sideways with an orientation tag; every
/// later stage assumes the pixels are already upright.
///
/// # Errors
///
/// Returns an error if the image cannot be decoded or has a zero dimension.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();
    let load_err = |source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    };

    let reader = ImageReader::open(path)?
        .with_guessed_format()
        .map_err(Error::Io)?;
    let mut decoder = reader.into_decoder().map_err(load_err)?;
    let orientation = decoder.orientation().map_err(load_err)?;
    let mut img = DynamicImage::from_decoder(decoder).map_err(load_err)?;
    img.apply_orientation(orientation);

    let (width, height) = img.dimensions();
    tracing::debug!("Loaded {} ({width}x{height}, {orientation:?})", path.display());

    ensure_non_empty("input", &img)?;
    Ok(img)
}

/// Reject rasters that no stage can resize.
pub(crate) fn ensure_non_empty(role: &'static str, img: &DynamicImage) -> Result<()> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::InvalidImage {
            role,
            width,
            height,
            reason: "image has no pixels".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_image_rejected() {
        let img = DynamicImage::new_rgb8(0, 12);
        let err = ensure_non_empty("human", &img).unwrap_err();
        assert!(matches!(err, Error::InvalidImage { role: "human", .. }));
    }

    #[test]
    fn test_missing_file_is_io() {
        let err = load_image("/definitely/not/here.png").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
