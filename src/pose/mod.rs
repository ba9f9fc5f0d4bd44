//! Body keypoint estimation (OpenPose 18-joint layout).

use image::{imageops, RgbImage};
use ndarray::{Array4, ArrayView3};
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::model::session::{extract_array4, missing_output};

/// Number of body joints in the OpenPose COCO layout.
pub const NUM_JOINTS: usize = 18;

/// Heatmap peaks below this are treated as undetected joints.
const PEAK_THRESHOLD: f32 = 0.1;

/// Spatial downsampling between network input and heatmaps.
const HEATMAP_STRIDE: f32 = 8.0;

/// OpenPose body joints, indexed as in `pose_keypoints_2d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joint {
    Nose = 0,
    Neck = 1,
    RightShoulder = 2,
    RightElbow = 3,
    RightWrist = 4,
    LeftShoulder = 5,
    LeftElbow = 6,
    LeftWrist = 7,
    RightHip = 8,
    RightKnee = 9,
    RightAnkle = 10,
    LeftHip = 11,
    LeftKnee = 12,
    LeftAnkle = 13,
    RightEye = 14,
    LeftEye = 15,
    RightEar = 16,
    LeftEar = 17,
}

/// Detected joint positions in pixel coordinates of the estimated image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Keypoints {
    points: [Option<(f32, f32)>; NUM_JOINTS],
}

impl Keypoints {
    #[must_use]
    pub const fn new(points: [Option<(f32, f32)>; NUM_JOINTS]) -> Self {
        Self { points }
    }

    #[must_use]
    pub const fn get(&self, joint: Joint) -> Option<(f32, f32)> {
        self.points[joint as usize]
    }

    pub fn set(&mut self, joint: Joint, position: Option<(f32, f32)>) {
        self.points[joint as usize] = position;
    }

    /// Flat `[x0, y0, x1, y1, ...]` list with undetected joints at the origin.
    #[must_use]
    pub fn flat(&self) -> Vec<f32> {
        self.points
            .iter()
            .flat_map(|p| {
                let (x, y) = p.unwrap_or((0.0, 0.0));
                [x, y]
            })
            .collect()
    }

    /// Number of detected joints.
    #[must_use]
    pub fn detected(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }
}

/// Estimates body keypoints from a photo.
pub trait PoseEstimator: Send {
    /// Locate the joints of the (single) person in `img`.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn estimate(&mut self, img: &RgbImage) -> Result<Keypoints>;
}

/// OpenPose body heatmap network run through ONNX Runtime.
pub struct OnnxPoseEstimator {
    session: Session,
}

impl OnnxPoseEstimator {
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }
}

impl PoseEstimator for OnnxPoseEstimator {
    fn estimate(&mut self, img: &RgbImage) -> Result<Keypoints> {
        let input = preprocess(img);
        let input_value =
            Tensor::from_array(input).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        // Outputs are (part affinity fields, heatmaps); only heatmaps matter
        // for a single person.
        let output = outputs
            .values()
            .last()
            .ok_or_else(|| missing_output("pose heatmaps"))?;
        let heatmaps = extract_array4(&output)?;

        let keypoints = decode_heatmaps(heatmaps.index_axis(ndarray::Axis(0), 0), HEATMAP_STRIDE);
        tracing::debug!("Detected {}/{NUM_JOINTS} joints", keypoints.detected());
        Ok(keypoints)
    }
}

/// BGR input scaled to [-0.5, 0.5], padded to a multiple of the stride.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn preprocess(img: &RgbImage) -> Array4<f32> {
    let stride = HEATMAP_STRIDE as u32;
    let width = img.width().div_ceil(stride) * stride;
    let height = img.height().div_ceil(stride) * stride;

    let mut padded = RgbImage::from_pixel(width, height, image::Rgb([128, 128, 128]));
    imageops::replace(&mut padded, img, 0, 0);

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in padded.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = f32::from(pixel[2 - c]) / 256.0 - 0.5;
        }
    }
    tensor
}

/// Take each joint's strongest heatmap response as its position.
///
/// Extra channels (e.g. the background map) are ignored.
#[allow(clippy::cast_precision_loss)]
fn decode_heatmaps(heatmaps: ArrayView3<'_, f32>, stride: f32) -> Keypoints {
    let (channels, height, width) = heatmaps.dim();
    let mut keypoints = Keypoints::default();

    for joint in 0..channels.min(NUM_JOINTS) {
        let mut best = (0usize, 0usize, f32::NEG_INFINITY);
        for y in 0..height {
            for x in 0..width {
                let v = heatmaps[[joint, y, x]];
                if v > best.2 {
                    best = (x, y, v);
                }
            }
        }

        if best.2 >= PEAK_THRESHOLD {
            keypoints.points[joint] = Some((
                (best.0 as f32 + 0.5) * stride,
                (best.1 as f32 + 0.5) * stride,
            ));
        }
    }

    keypoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_decode_peaks_and_threshold() {
        let mut maps = Array3::<f32>::zeros((19, 64, 48));
        maps[[Joint::RightWrist as usize, 10, 20]] = 0.9;
        maps[[Joint::LeftWrist as usize, 5, 5]] = 0.05;

        let keypoints = decode_heatmaps(maps.view(), 8.0);
        assert_eq!(keypoints.get(Joint::RightWrist), Some((164.0, 84.0)));
        assert_eq!(keypoints.get(Joint::LeftWrist), None);
        assert_eq!(keypoints.detected(), 1);
    }

    #[test]
    fn test_flat_layout() {
        let mut keypoints = Keypoints::default();
        keypoints.set(Joint::Neck, Some((3.0, 4.0)));
        let flat = keypoints.flat();
        assert_eq!(flat.len(), 36);
        assert_eq!(&flat[..4], &[0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_preprocess_pads_to_stride() {
        let img = RgbImage::new(383, 510);
        let tensor = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, 512, 384]);
    }
}
