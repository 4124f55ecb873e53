//! Writes the system image onto a system partition.
//!
//! The process has up to three stages:
//! 1.  Decompressing the image to a temporary file if it is compressed
//!     (`.gz`, `.xz`, `.zst`).
//! 2.  Writing the (decompressed) image to the target partition.
//! 3.  Optionally verifying the written data against the image.
use crate::error::{Error, Result};
use crate::progress::CopyProgress;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Alignment required for `O_DIRECT` buffers.
const BLOCK_SIZE: usize = 512;

#[cfg(unix)]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Which stage of [`write_image`] a progress update belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStage {
    Decompress,
    Write,
    Verify,
}

impl std::fmt::Display for WriteStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriteStage::Decompress => "decompressing",
            WriteStage::Write => "writing",
            WriteStage::Verify => "verifying",
        };
        f.write_str(name)
    }
}

/// Options for [`write_image`].
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions {
    /// Compare SHA-256 digests of the image and the target after writing.
    pub verify: bool,
    /// Bypass the page cache. Block devices only.
    pub direct_io: bool,
}

/// Opens a decoder for compressed images, or `None` for raw images.
pub fn open_decoder(path: &Path) -> io::Result<Option<Box<dyn Read>>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let reader: Box<dyn Read> = match ext.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(File::open(path)?))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(File::open(path)?))),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(BufReader::new(File::open(path)?))?),
        _ => return Ok(None),
    };
    Ok(Some(reader))
}

/// Keeps a decompressed image alive. A temporary file is deleted on drop.
struct DecompressedImage {
    path: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl AsRef<Path> for DecompressedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

fn decompress_image<F>(input_path: &Path, mut on_progress: F) -> io::Result<DecompressedImage>
where
    F: FnMut(u64),
{
    let Some(mut reader) = open_decoder(input_path)? else {
        return Ok(DecompressedImage {
            path: input_path.to_path_buf(),
            _temp_handle: None,
        });
    };

    let mut temp_file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; 64 * 1024];
        let mut total: u64 = 0;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    let temp_path = temp_file.into_temp_path();
    Ok(DecompressedImage {
        path: temp_path.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}

/// Size of a block device or regular file in bytes.
pub fn target_size(target: &Path) -> io::Result<u64> {
    let file = File::open(target)?;
    let metadata = file.metadata()?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        let mut size_bytes: u64 = 0;
        // SAFETY: the descriptor is open for the duration of the call and
        // `size_bytes` is a valid out pointer.
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) }.map_err(io::Error::from)?;
        Ok(size_bytes)
    }
    #[cfg(not(unix))]
    {
        Ok(metadata.len())
    }
}

fn open_target(target: &Path, direct_io: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(unix)]
    if direct_io {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }
    #[cfg(not(unix))]
    let _ = direct_io;
    options.open(target)
}

/// Writes `image_path` to `target`, reporting progress per stage.
///
/// The target must be at least as large as the decompressed image. With
/// `direct_io` the last chunk is padded with zeros up to the block size.
pub fn write_image<F>(
    image_path: &Path,
    target: &Path,
    options: WriteOptions,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(WriteStage, CopyProgress),
{
    let decompress = CopyProgress::start(0);
    let image = decompress_image(image_path, |bytes| {
        on_progress(WriteStage::Decompress, decompress.advance(bytes))
    })?;

    let mut image_file = File::open(&image)?;
    let image_len = image_file.metadata()?.len();
    let capacity = target_size(target)?;
    if capacity < image_len {
        return Err(Error::PreconditionFailed(format!(
            "{} holds {capacity} bytes but the system image needs {image_len}",
            target.display()
        )));
    }

    debug!(image = %image_path.display(), target = %target.display(), image_len, "writing image");
    let mut target_file = open_target(target, options.direct_io)?;

    let mut buf = vec![0u8; BUFFER_SIZE + BLOCK_SIZE];
    let offset = buf.as_ptr().align_offset(BLOCK_SIZE);
    let buffer = &mut buf[offset..offset + BUFFER_SIZE];

    let progress = CopyProgress::start(image_len);
    let mut written: u64 = 0;
    while written < image_len {
        let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
        image_file.read_exact(&mut buffer[..to_read])?;

        // O_DIRECT writes must cover whole blocks.
        let padded_size = if options.direct_io && to_read % BLOCK_SIZE != 0 {
            let pad = to_read.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            buffer[to_read..pad].fill(0);
            pad
        } else {
            to_read
        };

        target_file.write_all(&buffer[..padded_size])?;
        written += to_read as u64;
        on_progress(WriteStage::Write, progress.advance(written));
    }
    target_file.flush()?;
    target_file.sync_all()?;

    if options.verify {
        verify(&image, target, image_len, |p| on_progress(WriteStage::Verify, p))?;
    }

    Ok(())
}

fn verify<F>(image: &impl AsRef<Path>, target: &Path, image_len: u64, mut on_progress: F) -> Result<()>
where
    F: FnMut(CopyProgress),
{
    let mut image_file = File::open(image)?;
    let mut target_file = File::open(target)?;

    let mut image_hasher = Sha256::new();
    let mut target_hasher = Sha256::new();
    let mut image_buf = vec![0u8; BUFFER_SIZE];
    let mut target_buf = vec![0u8; BUFFER_SIZE];

    let progress = CopyProgress::start(image_len);
    let mut remaining = image_len;
    while remaining > 0 {
        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        image_file.read_exact(&mut image_buf[..chunk])?;
        target_file.read_exact(&mut target_buf[..chunk])?;

        image_hasher.update(&image_buf[..chunk]);
        target_hasher.update(&target_buf[..chunk]);

        remaining -= chunk as u64;
        on_progress(progress.advance(image_len - remaining));
    }

    if image_hasher.finalize() != target_hasher.finalize() {
        return Err(Error::PreconditionFailed(format!(
            "verification of {} failed: hash mismatch",
            target.display()
        )));
    }
    Ok(())
}
