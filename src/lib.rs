//! # `tryon`
//!
//! Virtual try-on: dress the person in one photo in the garment from another.
//!
//! The pipeline normalizes both photos, masks the region the garment will
//! cover (from human parsing and body keypoints, or a manual threshold),
//! renders a DensePose body map, encodes text prompts and runs a
//! mask-conditioned diffusion model. The result is optionally pasted back
//! into the uncropped original.
//!
//! ## Example
//!
//! ```no_run
//! use tryon::{load_image, RegistryConfig, TryOn, TryOnConfig};
//!
//! # fn main() -> tryon::Result<()> {
//! let mut tryon = TryOn::load(&RegistryConfig::new("yisol/IDM-VTON"))?;
//!
//! let human = load_image("person.jpg")?;
//! let garment = load_image("shirt.jpg")?;
//! let output = tryon.run(&human, &garment, "short sleeve round neck t-shirt", &TryOnConfig::default())?;
//!
//! output.image.save("result.png").ok();
//! # Ok(())
//! # }
//! ```

pub mod densepose;
pub mod error;
pub mod image;
pub mod mask;
pub mod model;
pub mod parsing;
pub mod pipeline;
pub mod pose;
pub mod prompt;

pub use error::{Error, ErrorKind, Result};
pub use crate::image::{load_image, save_image};
pub use model::{Device, ModelRegistry, RegistryConfig};
pub use pipeline::{run_tryon, TryOn, TryOnConfig, TryOnOutput};
