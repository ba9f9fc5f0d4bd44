//! ONNX Runtime session construction and output extraction.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ndarray::{Array2, Array3, Array4, ArrayD, Dimension, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::Session;
use ort::value::DynValue;

use crate::error::{Error, Result};

/// Compute device every model is placed on.
///
/// Chosen once when the registry loads; there is no silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda { device_id: i32 },
}

impl Device {
    fn execution_providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Self::Cpu => vec![CPUExecutionProvider::default().build()],
            Self::Cuda { device_id } => vec![CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure()],
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda { device_id: 0 }),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(|device_id| Self::Cuda { device_id })
                .ok_or_else(|| format!("unknown device `{other}` (expected cpu, cuda or cuda:N)")),
        }
    }
}

/// Build an ONNX session for the model at `path` on `device`.
///
/// # Errors
///
/// Returns an error if the session cannot be created or the device's
/// execution provider cannot be registered.
pub fn build_session(path: &Path, name: &str, device: Device) -> Result<Session> {
    let load_err = |source: ort::Error| Error::ModelLoad {
        name: name.to_string(),
        source,
    };

    tracing::debug!("Building session for {name} on {device}");

    Session::builder()
        .map_err(|e| load_err(e.into()))?
        .with_execution_providers(device.execution_providers())
        .map_err(|e| load_err(e.into()))?
        .commit_from_file(path)
        .map_err(|e| load_err(e.into()))
}

/// Fail at load time if `session` lacks any of the named outputs.
///
/// # Errors
///
/// Returns [`Error::ModelInterface`] naming the first missing output.
pub fn require_outputs(session: &Session, model: &str, names: &[&str]) -> Result<()> {
    for name in names {
        if !session.outputs.iter().any(|output| output.name == *name) {
            return Err(Error::ModelInterface {
                name: model.to_string(),
                detail: format!("missing output `{name}`"),
            });
        }
    }
    Ok(())
}

/// Names of every output of `session`, in declaration order.
#[must_use]
pub fn output_names(session: &Session) -> Vec<String> {
    session.outputs.iter().map(|output| output.name.clone()).collect()
}

/// Error for a session that returned fewer outputs than expected.
pub(crate) fn missing_output(what: &str) -> Error {
    Error::ShapeMismatch {
        expected: format!("{what} output"),
        actual: "no output".to_string(),
    }
}

/// Extract an f32 tensor of any rank from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub(crate) fn extract_array(value: &DynValue) -> Result<ArrayD<f32>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|_| Error::ShapeMismatch {
        expected: format!("{dims:?}"),
        actual: "reshape failed".to_string(),
    })
}

fn fixed_rank<D: Dimension>(array: ArrayD<f32>) -> Result<ndarray::Array<f32, D>> {
    let ndim = array.ndim();
    array.into_dimensionality::<D>().map_err(|_| Error::ShapeMismatch {
        expected: format!("{}D tensor", D::NDIM.unwrap_or(0)),
        actual: format!("{ndim}D tensor"),
    })
}

/// Extract a 4D array from an ONNX value.
pub(crate) fn extract_array4(value: &DynValue) -> Result<Array4<f32>> {
    fixed_rank(extract_array(value)?)
}

/// Extract a 3D array from an ONNX value.
pub(crate) fn extract_array3(value: &DynValue) -> Result<Array3<f32>> {
    fixed_rank(extract_array(value)?)
}

/// Extract a 2D array from an ONNX value.
pub(crate) fn extract_array2(value: &DynValue) -> Result<Array2<f32>> {
    fixed_rank(extract_array(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>(), Ok(Device::Cpu));
        assert_eq!("cuda".parse::<Device>(), Ok(Device::Cuda { device_id: 0 }));
        assert_eq!("cuda:2".parse::<Device>(), Ok(Device::Cuda { device_id: 2 }));
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_display_roundtrip() {
        for device in [Device::Cpu, Device::Cuda { device_id: 3 }] {
            assert_eq!(device.to_string().parse::<Device>(), Ok(device));
        }
    }

    #[test]
    fn test_fixed_rank_rejects_wrong_rank() {
        let array = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 3]));
        assert!(fixed_rank::<ndarray::Ix4>(array.clone()).is_err());
        assert_eq!(fixed_rank::<ndarray::Ix3>(array).unwrap().dim(), (1, 2, 3));
    }
}
