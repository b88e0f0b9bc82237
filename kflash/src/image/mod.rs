//! Firmware inputs and the image format written to flash.
//!
//! Three inputs are accepted:
//!
//! | Format   | Detected by                  | Flash                   | SRAM                  |
//! |----------|------------------------------|-------------------------|-----------------------|
//! | Binary   | anything else                | one job at 0, headered  | raw at `0x80000000`   |
//! | ELF      | `\x7fELF` magic              | rejected                | loadable segments     |
//! | KFPKG    | `PK` magic + `.kfpkg` suffix | one job per listed file | rejected              |

pub mod elf;
pub mod firmware;
pub mod kfpkg;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

pub use firmware::{AesKey, FirmwareImage, ImageBuilder, IoMode, chunks};
pub use kfpkg::{Kfpkg, KfpkgEntry};

/// Load address of raw SRAM programs and the flash-mode stub.
pub const SRAM_LOAD_ADDRESS: u32 = 0x8000_0000;

/// One contiguous write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteJob {
    /// Name shown in progress output.
    pub name: String,
    /// Target address (flash offset or SRAM address).
    pub address: u32,
    /// Raw contents, before any image header.
    pub data: Vec<u8>,
    /// Wrap in the SHA-256 image header before writing.
    pub sha256_prefix: bool,
    /// Encrypt with the session AES key, if one is set. Only meaningful
    /// together with `sha256_prefix`.
    pub encrypt: bool,
}

/// Input file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFormat {
    /// Flat binary.
    Binary,
    /// ELF executable.
    Elf,
    /// Zip package with a flash list.
    Kfpkg,
}

impl FirmwareFormat {
    /// Classify by magic bytes and file extension.
    pub fn detect(path: &Path, data: &[u8]) -> Self {
        let is_kfpkg_name = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("kfpkg"));

        if data.starts_with(b"\x7fELF") {
            Self::Elf
        } else if data.starts_with(b"PK") && is_kfpkg_name {
            Self::Kfpkg
        } else {
            Self::Binary
        }
    }
}

impl fmt::Display for FirmwareFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Elf => write!(f, "ELF"),
            Self::Kfpkg => write!(f, "KFPKG"),
        }
    }
}

/// A firmware file read from disk.
#[derive(Debug, Clone)]
pub struct Firmware {
    path: PathBuf,
    format: FirmwareFormat,
    data: Vec<u8>,
}

impl Firmware {
    /// Read and classify a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        Ok(Self::from_bytes(path, data))
    }

    /// Classify in-memory contents. `path` only supplies the extension and name.
    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let path = path.into();
        let format = FirmwareFormat::detect(&path, &data);
        debug!("{}: {format}, {} bytes", path.display(), data.len());
        Self { path, format, data }
    }

    /// Detected format.
    pub fn format(&self) -> FirmwareFormat {
        self.format
    }

    /// Raw file contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn display_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    /// Jobs for writing to flash.
    pub fn flash_jobs(&self) -> Result<Vec<WriteJob>> {
        match self.format {
            FirmwareFormat::Binary => Ok(vec![WriteJob {
                name: self.display_name(),
                address: 0,
                data: self.data.clone(),
                sha256_prefix: true,
                encrypt: true,
            }]),
            FirmwareFormat::Kfpkg => Ok(Kfpkg::from_bytes(self.data.clone())?.into_write_jobs()),
            FirmwareFormat::Elf => Err(Error::UnsupportedImageFormat(
                "ELF images can only be loaded to SRAM; use SRAM mode or convert to a binary"
                    .to_string(),
            )),
        }
    }

    /// Jobs for loading into SRAM and booting.
    pub fn sram_jobs(&self) -> Result<Vec<WriteJob>> {
        match self.format {
            FirmwareFormat::Binary => Ok(vec![WriteJob {
                name: self.display_name(),
                address: SRAM_LOAD_ADDRESS,
                data: self.data.clone(),
                sha256_prefix: false,
                encrypt: false,
            }]),
            FirmwareFormat::Elf => elf::load_segments(&self.data),
            FirmwareFormat::Kfpkg => Err(Error::UnsupportedImageFormat(
                "KFPKG packages cannot be loaded to SRAM".to_string(),
            )),
        }
    }
}
