//! Image loading, normalization, tensor conversion, and compositing.

mod composite;
mod load;
mod normalize;
mod save;
mod tensor;

pub use composite::restore_crop;
pub use load::load_image;
pub use normalize::{center_crop_region, normalize_garment, normalize_human, CropRegion, NormalizedHuman};
pub use save::save_image;
pub use tensor::{luma601, tensor_to_rgb, to_bgr_array, to_signed_tensor, to_unit_tensor};

use ndarray::Array4;

/// Image tensor in NCHW format (batch, channels, height, width).
pub type ImageTensor = Array4<f32>;

/// Width every human and garment image is normalized to before generation.
pub const CANONICAL_WIDTH: u32 = 768;

/// Height every human and garment image is normalized to before generation.
pub const CANONICAL_HEIGHT: u32 = 1024;

/// Reduced resolution used for parsing, pose and densepose estimation.
pub const WORKING_WIDTH: u32 = 384;

/// See [`WORKING_WIDTH`].
pub const WORKING_HEIGHT: u32 = 512;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;
