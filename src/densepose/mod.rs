//! DensePose body-part rendering used as structural conditioning.
//!
//! The renderer receives the working-size photo in BGR order (EXIF
//! orientation already applied) and returns an RGB visualization in which
//! every body part has its own colour and the background is black.

use std::fs;
use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayView3};
use ort::session::Session;
use ort::value::Tensor;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::session::{build_session, extract_array4, missing_output};
use crate::model::Device;

/// Detectron2 pixel mean, BGR order.
const PIXEL_MEAN_BGR: [f32; 3] = [103.53, 116.28, 123.675];

/// Opacity of the part colours over the black canvas.
const PART_ALPHA: f32 = 0.7;

/// Parula colormap anchors (RGB), evenly spaced over [0, 255].
const PARULA: [[u8; 3]; 9] = [
    [53, 42, 135],
    [15, 92, 221],
    [18, 125, 216],
    [7, 156, 207],
    [21, 177, 180],
    [89, 189, 140],
    [170, 190, 100],
    [240, 185, 70],
    [249, 251, 14],
];

/// Renders a DensePose part visualization.
pub trait DensePoseRenderer: Send {
    /// Render `bgr`, an `(height, width, 3)` BGR raster.
    ///
    /// The returned image has the same width and height as the input.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn render(&mut self, bgr: &Array3<u8>) -> Result<RgbImage>;
}

/// Model settings stored next to the DensePose checkpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DensePoseConfig {
    /// Network input width.
    pub input_width: u32,
    /// Network input height.
    pub input_height: u32,
    /// Body parts excluding background.
    #[serde(default = "default_num_parts")]
    pub num_parts: usize,
    /// Pixels whose best part probability is below this are background.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

const fn default_num_parts() -> usize {
    24
}

const fn default_score_threshold() -> f32 {
    0.5
}

/// Filesystem locations of the DensePose config and checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DensePoseAssets {
    pub config: PathBuf,
    pub checkpoint: PathBuf,
}

impl Default for DensePoseAssets {
    fn default() -> Self {
        Self {
            config: PathBuf::from("./configs/densepose_rcnn_R_50_FPN_s1x.json"),
            checkpoint: PathBuf::from("./ckpt/densepose/model_final_162be9.onnx"),
        }
    }
}

impl DensePoseAssets {
    /// Check that both files exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingAsset`] for the first file that is absent.
    pub fn verify(&self) -> Result<()> {
        for (name, path) in [("densepose config", &self.config), ("densepose checkpoint", &self.checkpoint)] {
            if !path.is_file() {
                return Err(Error::MissingAsset {
                    name: name.to_string(),
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Parse the config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn read_config(&self) -> Result<DensePoseConfig> {
        let text = fs::read_to_string(&self.config).map_err(|_| Error::MissingAsset {
            name: "densepose config".to_string(),
            path: self.config.clone(),
        })?;
        serde_json::from_str(&text).map_err(|source| Error::AssetConfig {
            path: self.config.clone(),
            source,
        })
    }

    /// Load the renderer on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file is missing or cannot be loaded.
    pub fn load(&self, device: Device) -> Result<OnnxDensePoseRenderer> {
        self.verify()?;
        let config = self.read_config()?;
        let session = build_session(&self.checkpoint, checkpoint_name(&self.checkpoint), device)?;
        tracing::info!(
            "Loaded DensePose ({} parts, {}x{} input)",
            config.num_parts,
            config.input_width,
            config.input_height
        );
        Ok(OnnxDensePoseRenderer { session, config })
    }
}

fn checkpoint_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("densepose")
}

/// DensePose part segmentation run through ONNX Runtime.
pub struct OnnxDensePoseRenderer {
    session: Session,
    config: DensePoseConfig,
}

impl DensePoseRenderer for OnnxDensePoseRenderer {
    #[allow(clippy::cast_possible_truncation)]
    fn render(&mut self, bgr: &Array3<u8>) -> Result<RgbImage> {
        let (height, width, _) = bgr.dim();
        let input = preprocess(bgr, self.config.input_width, self.config.input_height);
        let input_value =
            Tensor::from_array(input).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("densepose part logits"))?;
        let logits = extract_array4(&output)?;

        let (_, classes, _, _) = logits.dim();
        if classes != self.config.num_parts + 1 {
            return Err(Error::ShapeMismatch {
                expected: format!("{} part channels", self.config.num_parts + 1),
                actual: format!("{classes}"),
            });
        }

        let parts = part_indices(
            logits.index_axis(ndarray::Axis(0), 0),
            self.config.score_threshold,
        );
        let visual = bgr_to_rgb(&colorize_parts(&parts, self.config.num_parts));

        // Safe: sizes come from u32 rasters
        Ok(imageops::resize(
            &visual,
            width as u32,
            height as u32,
            FilterType::Nearest,
        ))
    }
}

/// Resize the BGR raster to the network input and subtract the pixel mean.
#[allow(clippy::cast_possible_truncation)]
fn preprocess(bgr: &Array3<u8>, width: u32, height: u32) -> Array4<f32> {
    let (h, w, _) = bgr.dim();
    // Safe: sizes come from u32 rasters
    let raster = RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([bgr[[y, x, 0]], bgr[[y, x, 1]], bgr[[y, x, 2]]])
    });
    let resized = imageops::resize(&raster, width, height, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = f32::from(pixel[c]) - PIXEL_MEAN_BGR[c];
        }
    }
    tensor
}

/// Per-pixel winning part (0 = background) from `(classes, h, w)` logits.
#[allow(clippy::cast_possible_truncation)]
fn part_indices(logits: ArrayView3<'_, f32>, score_threshold: f32) -> ndarray::Array2<u8> {
    let (classes, height, width) = logits.dim();
    ndarray::Array2::from_shape_fn((height, width), |(y, x)| {
        let max = (0..classes)
            .map(|c| logits[[c, y, x]])
            .fold(f32::NEG_INFINITY, f32::max);
        let total: f32 = (0..classes).map(|c| (logits[[c, y, x]] - max).exp()).sum();
        let (best, best_logit) = (0..classes)
            .map(|c| (c, logits[[c, y, x]]))
            .fold((0, f32::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        let probability = (best_logit - max).exp() / total;
        if best == 0 || probability < score_threshold {
            0
        } else {
            // Safe: part counts are far below 256
            best as u8
        }
    })
}

/// Colour part indices with the Parula map, BGR order, black background.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn colorize_parts(parts: &ndarray::Array2<u8>, num_parts: usize) -> Array3<u8> {
    let (height, width) = parts.dim();
    let mut out = Array3::<u8>::zeros((height, width, 3));

    for ((y, x), &part) in parts.indexed_iter() {
        if part == 0 {
            continue;
        }
        let value = f32::from(part) * 255.0 / num_parts as f32;
        let [r, g, b] = parula(value);
        out[[y, x, 0]] = (f32::from(b) * PART_ALPHA) as u8;
        out[[y, x, 1]] = (f32::from(g) * PART_ALPHA) as u8;
        out[[y, x, 2]] = (f32::from(r) * PART_ALPHA) as u8;
    }
    out
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn parula(value: f32) -> [u8; 3] {
    let position = (value.clamp(0.0, 255.0) / 255.0) * (PARULA.len() - 1) as f32;
    let lower = position.floor() as usize;
    let upper = (lower + 1).min(PARULA.len() - 1);
    let t = position - lower as f32;

    let mut rgb = [0u8; 3];
    for c in 0..3 {
        let a = f32::from(PARULA[lower][c]);
        let b = f32::from(PARULA[upper][c]);
        rgb[c] = t.mul_add(b - a, a).round() as u8;
    }
    rgb
}

#[allow(clippy::cast_possible_truncation)]
fn bgr_to_rgb(bgr: &Array3<u8>) -> RgbImage {
    let (height, width, _) = bgr.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([bgr[[y, x, 2]], bgr[[y, x, 1]], bgr[[y, x, 0]]])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_assets_are_fatal() {
        let assets = DensePoseAssets {
            config: PathBuf::from("/nonexistent/densepose.json"),
            checkpoint: PathBuf::from("/nonexistent/model.onnx"),
        };
        let err = assets.load(Device::Cpu).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Asset);
        assert!(matches!(err, Error::MissingAsset { .. }));
    }

    #[test]
    fn test_config_defaults() {
        let config: DensePoseConfig =
            serde_json::from_str(r#"{"input_width": 384, "input_height": 512}"#).unwrap();
        assert_eq!(config.num_parts, 24);
        assert!((config.score_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_background_stays_black() {
        let mut logits = Array3::<f32>::zeros((25, 2, 2));
        logits[[0, 0, 0]] = 10.0;
        logits[[12, 1, 1]] = 10.0;
        logits[[24, 0, 1]] = 10.0;

        let parts = part_indices(logits.view(), 0.5);
        assert_eq!(parts[[0, 0]], 0);
        assert_eq!(parts[[1, 1]], 12);
        assert_eq!(parts[[0, 1]], 24);
        // Flat logits: no confident part.
        assert_eq!(parts[[1, 0]], 0);

        let visual = bgr_to_rgb(&colorize_parts(&parts, 24));
        assert_eq!(*visual.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_ne!(*visual.get_pixel(1, 1), Rgb([0, 0, 0]));
        assert_ne!(visual.get_pixel(1, 1), visual.get_pixel(1, 0));
    }

    #[test]
    fn test_parula_endpoints() {
        assert_eq!(parula(0.0), PARULA[0]);
        assert_eq!(parula(255.0), PARULA[8]);
    }

    #[test]
    fn test_preprocess_shape_and_mean() {
        let bgr = Array3::<u8>::zeros((512, 384, 3));
        let tensor = preprocess(&bgr, 192, 256);
        assert_eq!(tensor.shape(), &[1, 3, 256, 192]);
        assert!((tensor[[0, 0, 0, 0]] + 103.53).abs() < 1e-3);
    }
}
