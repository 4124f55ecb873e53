//! The live system that gets installed onto target devices.
use crate::error::{Error, Result};
use crate::write::open_decoder;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Sizing facts about a source, as needed by the layout calculator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    /// Uncompressed size of the system image in bytes.
    pub system_size: u64,
    /// Kernel name of the block device the source lives on, if any.
    /// Plans for that device are rejected.
    pub device_name: Option<String>,
    pub has_exchange: bool,
    /// Used bytes of the data payload, when the source has one.
    pub data_used: Option<u64>,
}

/// A source system image.
pub trait SourceImage: Send + Sync {
    fn info(&self) -> &SourceInfo;

    /// Checks that the source is still usable. Called before every device
    /// of a batch; an error aborts the whole batch.
    fn validate(&self) -> Result<()>;

    /// The (possibly compressed) system partition image.
    fn system_image(&self) -> &Path;

    /// Tree copied onto the exchange partition.
    fn exchange_dir(&self) -> Option<&Path>;

    /// Tree copied onto the data partition.
    fn data_dir(&self) -> Option<&Path>;
}

const IMAGE_STEM: &str = "system.img";
const IMAGE_EXTENSIONS: &[&str] = &["", ".gz", ".xz", ".zst"];
const SIZE_SIDECAR: &str = "system.size";
const EXCHANGE_DIR: &str = "exchange";
const DATA_DIR: &str = "data";

/// A source laid out as a directory:
///
/// ```text
/// <root>/system.img[.gz|.xz|.zst]   system partition image
/// <root>/system.size                 optional uncompressed size in bytes
/// <root>/exchange/                   optional exchange payload
/// <root>/data/                       optional data payload
/// ```
#[derive(Debug)]
pub struct LiveSource {
    root: PathBuf,
    system_image: PathBuf,
    exchange: Option<PathBuf>,
    data: Option<PathBuf>,
    info: SourceInfo,
}

impl LiveSource {
    /// Opens the source directory at `root`.
    ///
    /// `device_name` names the block device the source resides on, so that
    /// it is never selected as a target.
    pub fn open(root: &Path, device_name: Option<String>) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::SourceInvalid(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let system_image = IMAGE_EXTENSIONS
            .iter()
            .map(|ext| root.join(format!("{IMAGE_STEM}{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                Error::SourceInvalid(format!("no {IMAGE_STEM} found in {}", root.display()))
            })?;

        let system_size = system_size(&system_image, &root.join(SIZE_SIDECAR))?;
        if system_size == 0 {
            return Err(Error::SourceInvalid("system image is empty".into()));
        }

        let exchange = Some(root.join(EXCHANGE_DIR)).filter(|p| p.is_dir());
        let data = Some(root.join(DATA_DIR)).filter(|p| p.is_dir());
        let data_used = data.as_deref().map(tree_size).transpose()?;

        debug!(root = %root.display(), system_size, "opened source");
        Ok(Self {
            root: root.to_path_buf(),
            info: SourceInfo {
                system_size,
                device_name,
                has_exchange: exchange.is_some(),
                data_used,
            },
            system_image,
            exchange,
            data,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceImage for LiveSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn validate(&self) -> Result<()> {
        let metadata = fs::metadata(&self.system_image).map_err(|e| {
            Error::SourceInvalid(format!("{}: {e}", self.system_image.display()))
        })?;
        if metadata.len() == 0 {
            return Err(Error::SourceInvalid(format!(
                "{} became empty",
                self.system_image.display()
            )));
        }
        Ok(())
    }

    fn system_image(&self) -> &Path {
        &self.system_image
    }

    fn exchange_dir(&self) -> Option<&Path> {
        self.exchange.as_deref()
    }

    fn data_dir(&self) -> Option<&Path> {
        self.data.as_deref()
    }
}

/// Uncompressed size of `image`: the sidecar value when present, otherwise
/// the file size for raw images or a full decoder pass for compressed ones.
fn system_size(image: &Path, sidecar: &Path) -> Result<u64> {
    if sidecar.is_file() {
        let text = fs::read_to_string(sidecar)?;
        return text.trim().parse().map_err(|_| {
            Error::SourceInvalid(format!("{} does not hold a byte count", sidecar.display()))
        });
    }

    match open_decoder(image)? {
        Some(mut reader) => Ok(io::copy(&mut reader, &mut io::sink())?),
        None => Ok(fs::metadata(image)?.len()),
    }
}

/// Sum of the sizes of all regular files below `root`.
pub fn tree_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn opens_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("system.img"), vec![1u8; 4096]).unwrap();
        fs::create_dir(dir.path().join("exchange")).unwrap();
        fs::create_dir_all(dir.path().join("data/home")).unwrap();
        fs::write(dir.path().join("data/home/notes.txt"), b"hello").unwrap();

        let source = LiveSource::open(dir.path(), Some("sda".into())).unwrap();
        let info = source.info();
        assert_eq!(info.system_size, 4096);
        assert!(info.has_exchange);
        assert_eq!(info.data_used, Some(5));
        assert_eq!(info.device_name.as_deref(), Some("sda"));
        assert!(source.validate().is_ok());
    }

    #[test]
    fn sidecar_overrides_compressed_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = flate2::write::GzEncoder::new(
            fs::File::create(dir.path().join("system.img.gz")).unwrap(),
            flate2::Compression::fast(),
        );
        encoder.write_all(&[0u8; 8192]).unwrap();
        encoder.finish().unwrap();

        let source = LiveSource::open(dir.path(), None).unwrap();
        assert_eq!(source.info().system_size, 8192);

        fs::write(dir.path().join("system.size"), "123456\n").unwrap();
        let source = LiveSource::open(dir.path(), None).unwrap();
        assert_eq!(source.info().system_size, 123456);
        assert!(source.system_image().ends_with("system.img.gz"));
    }

    #[test]
    fn missing_image_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let err = LiveSource::open(dir.path(), None).unwrap_err();
        assert!(matches!(err, Error::SourceInvalid(_)));
    }

    #[test]
    fn validation_notices_removed_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("system.img"), b"image").unwrap();
        let source = LiveSource::open(dir.path(), None).unwrap();
        fs::remove_file(dir.path().join("system.img")).unwrap();
        assert!(matches!(source.validate(), Err(Error::SourceInvalid(_))));
    }
}
