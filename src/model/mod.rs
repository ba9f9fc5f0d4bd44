//! Model assets, ONNX sessions and the capability registry.

mod loader;
mod registry;
pub mod session;

pub use loader::{AssetStore, ModelFile};
pub use registry::{ModelRegistry, RegistryConfig};
pub use session::{build_session, Device};
