//! Model asset resolution, downloading and loading.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use ort::session::Session;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

use super::session::{build_session, Device};

/// Hub that repository ids are resolved against.
const HUB_URL: &str = "https://huggingface.co";

/// Files making up a try-on model bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    /// CLIP ViT-L text encoder.
    TextEncoder,
    /// OpenCLIP bigG text encoder.
    TextEncoder2,
    Tokenizer,
    Tokenizer2,
    /// CLIP vision encoder for the IP-adapter.
    ImageEncoder,
    VaeEncoder,
    VaeDecoder,
    /// Try-on UNet.
    Unet,
    /// Garment reference UNet.
    UnetEncoder,
    /// ATR human parsing network.
    ParsingAtr,
    /// LIP human parsing network (neck separation).
    ParsingLip,
    /// OpenPose body network.
    OpenPose,
}

impl ModelFile {
    /// Path relative to the bundle root.
    #[must_use]
    pub const fn relative_path(&self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder/model.onnx",
            Self::TextEncoder2 => "text_encoder_2/model.onnx",
            Self::Tokenizer => "tokenizer/tokenizer.json",
            Self::Tokenizer2 => "tokenizer_2/tokenizer.json",
            Self::ImageEncoder => "image_encoder/model.onnx",
            Self::VaeEncoder => "vae_encoder/model.onnx",
            Self::VaeDecoder => "vae_decoder/model.onnx",
            Self::Unet => "unet/model.onnx",
            Self::UnetEncoder => "unet_encoder/model.onnx",
            Self::ParsingAtr => "humanparsing/parsing_atr.onnx",
            Self::ParsingLip => "humanparsing/parsing_lip.onnx",
            Self::OpenPose => "openpose/ckpts/body_pose_model.onnx",
        }
    }

    /// External weights file stored next to the graph, if any.
    ///
    /// Must match the name referenced inside the ONNX file.
    #[must_use]
    pub const fn data_path(&self) -> Option<&'static str> {
        match self {
            Self::TextEncoder2 => Some("text_encoder_2/model.onnx_data"),
            Self::Unet => Some("unet/model.onnx_data"),
            Self::UnetEncoder => Some("unet_encoder/model.onnx_data"),
            _ => None,
        }
    }

    /// Approximate size in bytes for progress indication.
    #[must_use]
    pub const fn approx_size(&self) -> u64 {
        match self {
            Self::TextEncoder => 492_000_000,
            Self::TextEncoder2 | Self::Unet | Self::UnetEncoder => 2_000_000, // graph only
            Self::Tokenizer | Self::Tokenizer2 => 3_600_000,
            Self::ImageEncoder => 2_500_000_000,
            Self::VaeEncoder => 137_000_000,
            Self::VaeDecoder => 198_000_000,
            Self::ParsingAtr | Self::ParsingLip => 267_000_000,
            Self::OpenPose => 209_000_000,
        }
    }

    /// Approximate size of the external weights file.
    #[must_use]
    pub const fn data_approx_size(&self) -> u64 {
        match self {
            Self::TextEncoder2 => 2_780_000_000,
            Self::Unet => 10_300_000_000,
            Self::UnetEncoder => 10_300_000_000,
            _ => 0,
        }
    }

    /// Whether the pipeline can run without this file.
    #[must_use]
    pub const fn is_optional(&self) -> bool {
        matches!(self, Self::ParsingLip)
    }

    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder",
            Self::TextEncoder2 => "text_encoder_2",
            Self::Tokenizer => "tokenizer",
            Self::Tokenizer2 => "tokenizer_2",
            Self::ImageEncoder => "image_encoder",
            Self::VaeEncoder => "vae_encoder",
            Self::VaeDecoder => "vae_decoder",
            Self::Unet => "unet",
            Self::UnetEncoder => "unet_encoder",
            Self::ParsingAtr => "parsing_atr",
            Self::ParsingLip => "parsing_lip",
            Self::OpenPose => "openpose",
        }
    }
}

/// Where model files come from.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
    /// Hub repository id when files are fetched on demand.
    repo: Option<String>,
}

impl AssetStore {
    /// Resolve `location`: an existing directory is used in place, anything
    /// shaped like `owner/name` is a hub repository cached under the user
    /// cache directory.
    ///
    /// Cache locations:
    /// - Windows: `%LOCALAPPDATA%\tryon\models\<owner>\<name>`
    /// - Linux: `~/.cache/tryon/models/<owner>/<name>`
    /// - macOS: `~/Library/Caches/tryon/models/<owner>/<name>`
    ///
    /// # Errors
    ///
    /// Returns an error if `location` is neither, or the cache directory
    /// cannot be created.
    pub fn open(location: &str) -> Result<Self> {
        let local = Path::new(location);
        if local.is_dir() {
            tracing::info!("Using local model assets at {}", local.display());
            return Ok(Self {
                root: local.to_path_buf(),
                repo: None,
            });
        }

        if !is_repo_id(location) {
            return Err(Error::MissingAsset {
                name: "model assets".to_string(),
                path: local.to_path_buf(),
            });
        }

        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        let root = base.join("tryon").join("models").join(location);
        fs::create_dir_all(&root).map_err(|source| Error::CacheDir {
            path: root.clone(),
            source,
        })?;

        tracing::info!("Using hub repository {location} cached at {}", root.display());
        Ok(Self {
            root,
            repo: Some(location.to_string()),
        })
    }

    /// Bundle root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of `file`, downloading it first for hub stores.
    ///
    /// Returns `None` for an optional file that is not available.
    ///
    /// # Errors
    ///
    /// Returns an error if a required file is missing or cannot be fetched.
    pub fn resolve(&self, file: ModelFile) -> Result<Option<PathBuf>> {
        match self.fetch(file) {
            Ok(path) => Ok(Some(path)),
            Err(err) if file.is_optional() => {
                tracing::warn!("Optional asset {} unavailable: {err}", file.name());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Local path of a required `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be fetched.
    pub fn require(&self, file: ModelFile) -> Result<PathBuf> {
        self.fetch(file)
    }

    fn fetch(&self, file: ModelFile) -> Result<PathBuf> {
        let path = self.root.join(file.relative_path());
        self.ensure(file.relative_path(), file.name(), file.approx_size())?;

        if let Some(data) = file.data_path() {
            self.ensure(data, file.name(), file.data_approx_size())?;
        }

        Ok(path)
    }

    fn ensure(&self, relative: &str, name: &str, approx_size: u64) -> Result<()> {
        let path = self.root.join(relative);
        if path.is_file() {
            return Ok(());
        }

        match &self.repo {
            Some(repo) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|source| Error::CacheDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                let url = format!("{HUB_URL}/{repo}/resolve/main/{relative}");
                download_file(&url, &path, name, approx_size)
            }
            None => Err(Error::MissingAsset {
                name: name.to_string(),
                path,
            }),
        }
    }

    /// Load an ONNX session for `file` on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model is missing or cannot be loaded.
    pub fn load_session(&self, file: ModelFile, device: Device) -> Result<Session> {
        let path = self.require(file)?;
        build_session(&path, file.name(), device)
    }

    /// Load an optional ONNX session; `None` when the file is unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_optional_session(&self, file: ModelFile, device: Device) -> Result<Option<Session>> {
        self.resolve(file)?
            .map(|path| build_session(&path, file.name(), device))
            .transpose()
    }

    /// Load a `tokenizer.json` definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load_tokenizer(&self, file: ModelFile) -> Result<Tokenizer> {
        let path = self.require(file)?;
        Tokenizer::from_file(&path).map_err(|source| Error::TokenizerLoad {
            name: file.name().to_string(),
            source,
        })
    }
}

/// `owner/name` with no path-like components.
fn is_repo_id(location: &str) -> bool {
    let mut parts = location.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None)
            if !owner.is_empty()
                && !name.is_empty()
                && !owner.starts_with('.')
                && !name.starts_with('.')
    )
}

/// Stream `url` into `path` behind a byte progress bar.
///
/// The body lands in a sibling `.part` file, renamed into place once complete.
fn download_file(url: &str, path: &Path, name: &str, approx_size: u64) -> Result<()> {
    tracing::info!("Fetching {name} from {url}");

    let mut response = reqwest::blocking::Client::new()
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|source| Error::ModelDownload {
            name: name.to_string(),
            source,
        })?;

    let pb = ProgressBar::new(response.content_length().unwrap_or(approx_size));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid template")
            .progress_chars("=> "),
    );
    pb.set_message(name.to_string());

    let mut part_name = path.file_name().unwrap_or_default().to_os_string();
    part_name.push(".part");
    let part_path = path.with_file_name(part_name);

    let mut sink = pb.wrap_write(BufWriter::new(fs::File::create(&part_path)?));
    std::io::copy(&mut response, &mut sink)?;
    sink.flush()?;
    drop(sink);
    pb.finish_and_clear();

    fs::rename(&part_path, path)?;
    tracing::debug!("Stored {name} at {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> AssetStore {
        AssetStore::open(dir.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_repo_id_detection() {
        assert!(is_repo_id("yisol/IDM-VTON"));
        assert!(!is_repo_id("IDM-VTON"));
        assert!(!is_repo_id("./models/vton"));
        assert!(!is_repo_id("/abs/path"));
        assert!(!is_repo_id("a/b/c"));
    }

    #[test]
    fn test_unknown_location_is_missing_asset() {
        let err = AssetStore::open("definitely-not-a-directory").unwrap_err();
        assert!(matches!(err, Error::MissingAsset { .. }));
    }

    #[test]
    fn test_local_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let err = store.require(ModelFile::Unet).unwrap_err();
        assert!(matches!(err, Error::MissingAsset { ref name, .. } if name == "unet"));

        // Optional files degrade to None.
        assert!(store.resolve(ModelFile::ParsingLip).unwrap().is_none());
    }

    #[test]
    fn test_local_present_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ModelFile::OpenPose.relative_path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"onnx").unwrap();

        let store = open_store(&dir);
        assert_eq!(store.root(), dir.path());
        assert_eq!(store.require(ModelFile::OpenPose).unwrap(), path);
    }

    #[test]
    fn test_external_data_required_locally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ModelFile::UnetEncoder.relative_path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"onnx").unwrap();

        let store = open_store(&dir);
        let err = store.require(ModelFile::UnetEncoder).unwrap_err();
        assert!(matches!(err, Error::MissingAsset { ref path, .. } if path.ends_with("model.onnx_data")));
    }
}
