//! Human parsing: per-pixel body-part and clothing labels.

use image::{imageops, imageops::FilterType, GrayImage, Luma, RgbImage};
use ndarray::{Array4, ArrayView3};
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::model::session::{extract_array4, missing_output};

/// Label values produced by [`HumanParser`] (ATR label set plus neck).
pub mod labels {
    pub const BACKGROUND: u8 = 0;
    pub const HAT: u8 = 1;
    pub const HAIR: u8 = 2;
    pub const SUNGLASSES: u8 = 3;
    pub const UPPER_CLOTHES: u8 = 4;
    pub const SKIRT: u8 = 5;
    pub const PANTS: u8 = 6;
    pub const DRESS: u8 = 7;
    pub const BELT: u8 = 8;
    pub const LEFT_SHOE: u8 = 9;
    pub const RIGHT_SHOE: u8 = 10;
    pub const HEAD: u8 = 11;
    pub const LEFT_LEG: u8 = 12;
    pub const RIGHT_LEG: u8 = 13;
    pub const LEFT_ARM: u8 = 14;
    pub const RIGHT_ARM: u8 = 15;
    pub const BAG: u8 = 16;
    pub const SCARF: u8 = 17;
    /// Not an ATR class: head pixels the LIP model does not call face.
    pub const NECK: u8 = 18;
}

/// LIP label for the face, used to split the neck out of ATR's head class.
const LIP_FACE: u8 = 13;

/// Side length of the square parsing network input.
const PARSE_INPUT_SIZE: u32 = 512;

/// ImageNet statistics in BGR order, as the parsing networks were trained.
const BGR_MEAN: [f32; 3] = [0.406, 0.456, 0.485];
const BGR_STD: [f32; 3] = [0.225, 0.224, 0.229];

/// Per-pixel semantic labels over a human photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    labels: GrayImage,
}

impl LabelMap {
    #[must_use]
    pub const fn new(labels: GrayImage) -> Self {
        Self { labels }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.labels.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.labels.height()
    }

    #[must_use]
    pub fn label(&self, x: u32, y: u32) -> u8 {
        self.labels.get_pixel(x, y)[0]
    }

    /// Binary plane (0/255) of pixels carrying any of `wanted`.
    #[must_use]
    pub fn select(&self, wanted: &[u8]) -> GrayImage {
        GrayImage::from_fn(self.width(), self.height(), |x, y| {
            if wanted.contains(&self.label(x, y)) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    /// Resample to another size without inventing labels.
    #[must_use]
    pub fn resized(&self, width: u32, height: u32) -> Self {
        if self.labels.dimensions() == (width, height) {
            return self.clone();
        }
        Self::new(imageops::resize(&self.labels, width, height, FilterType::Nearest))
    }
}

/// Produces a [`LabelMap`] the size of its input photo.
pub trait HumanParser: Send {
    /// Parse `img` into body-part labels.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn parse(&mut self, img: &RgbImage) -> Result<LabelMap>;
}

/// ATR/LIP parsing networks run through ONNX Runtime.
pub struct OnnxHumanParser {
    atr: Session,
    lip: Option<Session>,
}

impl OnnxHumanParser {
    /// Wrap loaded sessions. Without a LIP session no neck label is produced.
    #[must_use]
    pub fn new(atr: Session, lip: Option<Session>) -> Self {
        if lip.is_none() {
            tracing::warn!("No LIP parsing model; neck will not be separated from head");
        }
        Self { atr, lip }
    }
}

impl HumanParser for OnnxHumanParser {
    fn parse(&mut self, img: &RgbImage) -> Result<LabelMap> {
        let (width, height) = img.dimensions();
        let input = preprocess(img);

        let atr = run_argmax(&mut self.atr, &input)?;
        let mut labels = atr.resized(width, height);

        if let Some(lip_session) = self.lip.as_mut() {
            let lip = run_argmax(lip_session, &input)?.resized(width, height);
            add_neck(&mut labels, &lip);
        }

        Ok(labels)
    }
}

/// Resize to the square network input and normalize in BGR order.
fn preprocess(img: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(img, PARSE_INPUT_SIZE, PARSE_INPUT_SIZE, FilterType::Triangle);
    let size = PARSE_INPUT_SIZE as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let v = f32::from(pixel[2 - c]) / 255.0;
            tensor[[0, c, y, x]] = (v - BGR_MEAN[c]) / BGR_STD[c];
        }
    }
    tensor
}

fn run_argmax(session: &mut Session, input: &Array4<f32>) -> Result<LabelMap> {
    let input_value =
        Tensor::from_array(input.clone()).map_err(|source| Error::Inference { source })?;

    let outputs = session
        .run(ort::inputs![input_value])
        .map_err(|source| Error::Inference { source })?;

    // Segmentation logits are the last output; earlier ones are edge heads.
    let output = outputs
        .values()
        .last()
        .ok_or_else(|| missing_output("parsing logits"))?;
    let logits = extract_array4(&output)?;

    Ok(argmax_labels(logits.index_axis(ndarray::Axis(0), 0)))
}

/// Collapse `(classes, height, width)` logits into a label map.
#[allow(clippy::cast_possible_truncation)]
fn argmax_labels(logits: ArrayView3<'_, f32>) -> LabelMap {
    let (classes, height, width) = logits.dim();
    // Safe: label maps are built from u32 image sizes and at most 256 classes
    let labels = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let best = (0..classes)
            .max_by(|&a, &b| logits[[a, y, x]].total_cmp(&logits[[b, y, x]]))
            .unwrap_or(0);
        Luma([best as u8])
    });
    LabelMap::new(labels)
}

/// Relabel ATR head pixels that LIP does not see as face.
fn add_neck(atr: &mut LabelMap, lip: &LabelMap) {
    for (x, y, pixel) in atr.labels.enumerate_pixels_mut() {
        if pixel[0] == labels::HEAD && lip.label(x, y) != LIP_FACE {
            pixel[0] = labels::NECK;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_argmax_picks_highest_class() {
        let mut logits = Array3::<f32>::zeros((4, 2, 3));
        logits[[2, 0, 0]] = 5.0;
        logits[[3, 1, 2]] = 1.0;
        logits[[1, 1, 2]] = 0.5;

        let map = argmax_labels(logits.view());
        assert_eq!((map.width(), map.height()), (3, 2));
        assert_eq!(map.label(0, 0), 2);
        assert_eq!(map.label(2, 1), 3);
    }

    #[test]
    fn test_neck_split_from_head() {
        let mut atr = LabelMap::new(GrayImage::from_pixel(2, 1, Luma([labels::HEAD])));
        let mut lip_pixels = GrayImage::new(2, 1);
        lip_pixels.put_pixel(0, 0, Luma([LIP_FACE]));
        let lip = LabelMap::new(lip_pixels);

        add_neck(&mut atr, &lip);
        assert_eq!(atr.label(0, 0), labels::HEAD);
        assert_eq!(atr.label(1, 0), labels::NECK);
    }

    #[test]
    fn test_select_and_resize() {
        let map = LabelMap::new(GrayImage::from_fn(4, 4, |x, _| Luma([x as u8])));
        let plane = map.select(&[1, 3]);
        assert_eq!(plane.get_pixel(1, 0)[0], 255);
        assert_eq!(plane.get_pixel(2, 0)[0], 0);

        let big = map.resized(8, 8);
        assert_eq!((big.width(), big.height()), (8, 8));
        assert_eq!(big.label(0, 0), 0);
        assert_eq!(big.label(7, 7), 3);
    }

    #[test]
    fn test_preprocess_shape() {
        let img = RgbImage::new(384, 512);
        assert_eq!(preprocess(&img).shape(), &[1, 3, 512, 512]);
    }
}
