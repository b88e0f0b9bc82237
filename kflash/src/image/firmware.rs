//! On-flash firmware image format.
//!
//! ```text
//! +-------+----------+---------------------+----------+
//! | Flags |  Length  |       Payload       |  SHA-256 |
//! +-------+----------+---------------------+----------+
//! |  1 B  | u32 LE   |  Length bytes       |   32 B   |
//! +-------+----------+---------------------+----------+
//! ```
//!
//! Flag bit 0 marks an AES-CBC encrypted payload, bit 1 selects DIO flash
//! reads. The digest covers flags, length and payload.

use std::fmt;
use std::str::FromStr;

use log::debug;
use sha2::{Digest, Sha256};

use crate::crypto::{BLOCK_SIZE, Cbc};
use crate::error::{Error, Result};

/// Flag bit: payload is AES encrypted.
pub const FLAG_AES: u8 = 0x01;
/// Flag bit: flash runs in DIO mode.
pub const FLAG_DIO: u8 = 0x02;

/// Size of the trailing digest.
pub const DIGEST_LEN: usize = 32;

/// SPI flash read mode recorded in the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Dual I/O.
    #[default]
    Dio,
    /// Quad I/O.
    Qio,
}

impl FromStr for IoMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dio" => Ok(Self::Dio),
            "qio" => Ok(Self::Qio),
            other => Err(Error::Config(format!("unknown I/O mode '{other}'"))),
        }
    }
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dio => write!(f, "dio"),
            Self::Qio => write!(f, "qio"),
        }
    }
}

/// 128-bit firmware encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; 16]);

impl AesKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse 32 hex characters.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::Config(format!("AES key is not valid hex: {e}")))?;
        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKeySize(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// A prepared image, ready to be written with a SHA-256 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    flags: u8,
    payload: Vec<u8>,
    digest: [u8; DIGEST_LEN],
}

impl FirmwareImage {
    /// Flag byte.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Whether the payload is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_AES != 0
    }

    /// Payload as written (ciphertext when encrypted).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Trailing digest.
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Serialised image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = header(self.flags, &self.payload);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Check the trailing digest of a serialised image.
    pub fn verify(bytes: &[u8]) -> bool {
        if bytes.len() < 5 + DIGEST_LEN {
            return false;
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        Sha256::digest(body).as_slice() == digest
    }
}

fn header(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len() + DIGEST_LEN);
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Builds [`FirmwareImage`]s.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    key: Option<AesKey>,
    io_mode: IoMode,
}

impl ImageBuilder {
    /// Builder with no encryption and DIO mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypt payloads with `key`.
    #[must_use]
    pub fn aes_key(mut self, key: Option<AesKey>) -> Self {
        self.key = key;
        self
    }

    /// Set the flash read mode flag.
    #[must_use]
    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.io_mode = mode;
        self
    }

    /// Compose an image from raw firmware bytes.
    pub fn build(&self, raw: &[u8]) -> Result<FirmwareImage> {
        let mut flags = 0;
        let payload = match &self.key {
            Some(key) => {
                flags |= FLAG_AES;
                let padded_len = raw.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                let mut padded = raw.to_vec();
                padded.resize(padded_len, 0);
                Cbc::new(key.as_bytes())?.encrypt(&padded)?
            },
            None => raw.to_vec(),
        };
        if self.io_mode == IoMode::Dio {
            flags |= FLAG_DIO;
        }

        let body = header(flags, &payload);
        let digest: [u8; DIGEST_LEN] = Sha256::digest(&body).into();
        debug!(
            "Image: flags {flags:#04x}, {} payload bytes, sha256 {}",
            payload.len(),
            hex::encode(digest)
        );

        Ok(FirmwareImage {
            flags,
            payload,
            digest,
        })
    }
}

/// Address-tagged slices of a buffer.
///
/// With alignment on, the first chunk stops at the next multiple of the
/// chunk size so every later chunk starts on a boundary.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    data: &'a [u8],
    address: u32,
    size: usize,
    next_len: usize,
}

/// Split `data`, destined for `address`, into chunks of at most `size`.
pub fn chunks(data: &[u8], address: u32, size: usize, aligned: bool) -> Chunks<'_> {
    let size = size.max(1);
    let offset = address as usize % size;
    let next_len = if aligned && offset != 0 { size - offset } else { size };
    Chunks {
        data,
        address,
        size,
        next_len,
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let len = self.next_len.min(self.data.len());
        let (head, rest) = self.data.split_at(len);
        let item = (self.address, head);
        self.data = rest;
        self.address = self.address.wrapping_add(len as u32);
        self.next_len = self.size;
        Some(item)
    }
}
