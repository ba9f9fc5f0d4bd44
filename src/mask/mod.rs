//! Inpainting mask synthesis.
//!
//! White (255) marks the region the generator repaints, black (0) is kept.
//! Masks always align pixel-for-pixel with the canonical human image.

mod garment;
mod manual;
mod preview;

pub use garment::garment_mask;
pub use manual::{threshold_mask, MANUAL_THRESHOLD};
pub use preview::mask_preview;

use std::fmt;
use std::str::FromStr;

use image::{imageops, imageops::FilterType, GrayImage};

use crate::image::{CANONICAL_HEIGHT, CANONICAL_WIDTH};

/// How the inpainting mask is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMode {
    /// Human parsing plus pose keypoints locate the garment region.
    Automatic,
    /// Threshold the photo's luma; a placeholder, not a segmentation.
    Manual,
}

impl MaskMode {
    #[must_use]
    pub const fn from_auto_flag(auto_mask: bool) -> Self {
        if auto_mask {
            Self::Automatic
        } else {
            Self::Manual
        }
    }
}

/// Which garment slot is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskCategory {
    #[default]
    UpperBody,
    LowerBody,
    Dresses,
}

impl MaskCategory {
    /// Categories that repaint the torso and arms.
    #[must_use]
    pub const fn covers_arms(self) -> bool {
        matches!(self, Self::UpperBody | Self::Dresses)
    }
}

impl fmt::Display for MaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UpperBody => "upper_body",
            Self::LowerBody => "lower_body",
            Self::Dresses => "dresses",
        })
    }
}

impl FromStr for MaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upper_body" | "upper" => Ok(Self::UpperBody),
            "lower_body" | "lower" => Ok(Self::LowerBody),
            "dresses" | "dress" => Ok(Self::Dresses),
            other => Err(format!(
                "unknown garment category `{other}` (expected upper_body, lower_body or dresses)"
            )),
        }
    }
}

/// Dataset variant the arm-stroke width was tuned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskVariant {
    /// High-detail (VITON-HD style) photos.
    #[default]
    Hd,
    /// DressCode style photos.
    Dc,
}

impl MaskVariant {
    /// Arm stroke width in pixels at a 512 pixel tall working image.
    #[must_use]
    pub const fn arm_width(self) -> u32 {
        match self {
            Self::Hd => 60,
            Self::Dc => 45,
        }
    }
}

impl FromStr for MaskVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hd" => Ok(Self::Hd),
            "dc" => Ok(Self::Dc),
            other => Err(format!("unknown mask variant `{other}` (expected hd or dc)")),
        }
    }
}

/// Upscale a working-resolution mask to the canonical size.
///
/// Nearest-neighbour keeps every value in {0, 255}.
#[must_use]
pub fn to_canonical(mask: &GrayImage) -> GrayImage {
    if mask.dimensions() == (CANONICAL_WIDTH, CANONICAL_HEIGHT) {
        return mask.clone();
    }
    imageops::resize(mask, CANONICAL_WIDTH, CANONICAL_HEIGHT, FilterType::Nearest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_upscale_stays_binary() {
        let mask = GrayImage::from_fn(384, 512, |x, y| {
            if (x / 7 + y / 5) % 2 == 0 {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let big = to_canonical(&mask);
        assert_eq!(big.dimensions(), (768, 1024));
        assert!(big.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("upper_body".parse::<MaskCategory>(), Ok(MaskCategory::UpperBody));
        assert_eq!("dress".parse::<MaskCategory>(), Ok(MaskCategory::Dresses));
        assert!("hat".parse::<MaskCategory>().is_err());
        assert_eq!(MaskCategory::LowerBody.to_string(), "lower_body");
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(MaskMode::from_auto_flag(true), MaskMode::Automatic);
        assert_eq!(MaskMode::from_auto_flag(false), MaskMode::Manual);
    }
}
