//! `.kfpkg` firmware packages.
//!
//! A KFPKG is a zip archive with a `flash-list.json` manifest:
//!
//! ```json
//! {
//!     "version": "0.1.0",
//!     "files": [
//!         { "address": 0x00000, "bin": "maixpy.bin", "sha256Prefix": true },
//!         { "address": 0x300000, "bin": "m5stickv.kmodel", "sha256Prefix": false }
//!     ]
//! }
//! ```
//!
//! Packaging tools emit the address as a bare hex literal, which is not
//! valid JSON, so it is quoted before parsing.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::image::WriteJob;

/// Name of the manifest inside the archive.
pub const MANIFEST_NAME: &str = "flash-list.json";

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    version: Option<String>,
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    bin: String,
    address: serde_json::Value,
    #[serde(rename = "sha256Prefix", default)]
    sha256_prefix: bool,
}

/// One file listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KfpkgEntry {
    /// File name inside the archive.
    pub name: String,
    /// Flash address.
    pub address: u32,
    /// Write with the SHA-256 image header.
    pub sha256_prefix: bool,
    /// File contents.
    pub data: Vec<u8>,
}

/// Parsed package.
#[derive(Debug, Clone)]
pub struct Kfpkg {
    version: Option<String>,
    entries: Vec<KfpkgEntry>,
}

impl Kfpkg {
    /// Load a package from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading KFPKG from: {}", path.display());
        Self::from_bytes(fs::read(path)?)
    }

    /// Parse a package from memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(zip_error)?;

        let manifest_text = {
            let mut file = archive.by_name(MANIFEST_NAME).map_err(zip_error)?;
            let mut text = String::new();
            file.read_to_string(&mut text)?;
            text
        };
        let manifest: Manifest = serde_json::from_str(&quote_bare_addresses(&manifest_text))
            .map_err(|e| Error::InvalidKfpkg(format!("{MANIFEST_NAME}: {e}")))?;

        let mut entries = Vec::with_capacity(manifest.files.len());
        for file in manifest.files {
            let address = parse_address(&file.address)?;
            let mut data = Vec::new();
            archive
                .by_name(&file.bin)
                .map_err(zip_error)?
                .read_to_end(&mut data)?;
            debug!(
                "  {} -> {address:#010x}, {} bytes, sha256 prefix: {}",
                file.bin,
                data.len(),
                file.sha256_prefix
            );
            entries.push(KfpkgEntry {
                name: file.bin,
                address,
                sha256_prefix: file.sha256_prefix,
                data,
            });
        }

        Ok(Self {
            version: manifest.version,
            entries,
        })
    }

    /// Manifest version string, if present.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Files in manifest order.
    pub fn entries(&self) -> &[KfpkgEntry] {
        &self.entries
    }

    /// One write job per file, in manifest order. Package contents are
    /// never encrypted.
    pub fn into_write_jobs(self) -> Vec<WriteJob> {
        self.entries
            .into_iter()
            .map(|entry| WriteJob {
                name: entry.name,
                address: entry.address,
                data: entry.data,
                sha256_prefix: entry.sha256_prefix,
                encrypt: false,
            })
            .collect()
    }
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::InvalidKfpkg(e.to_string())
}

/// Quote every unquoted `"address"` value.
fn quote_bare_addresses(text: &str) -> String {
    const KEY: &str = "\"address\"";
    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;

    while let Some(pos) = rest.find(KEY) {
        let (head, tail) = rest.split_at(pos + KEY.len());
        out.push_str(head);
        rest = tail;

        let Some(colon) = rest.find(':') else { break };
        let (sep, tail) = rest.split_at(colon + 1);
        out.push_str(sep);
        rest = tail;

        let trimmed = rest.trim_start();
        out.push_str(&rest[..rest.len() - trimmed.len()]);
        rest = trimmed;

        if rest.starts_with('"') {
            continue;
        }
        let end = rest
            .find(|c: char| c == ',' || c == '}' || c == '\n' || c == '\r')
            .unwrap_or(rest.len());
        let value = rest[..end].trim_end();
        out.push('"');
        out.push_str(value);
        out.push('"');
        out.push_str(&rest[value.len()..end]);
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

fn parse_address(value: &serde_json::Value) -> Result<u32> {
    match value {
        serde_json::Value::String(s) => parse_int(s)
            .ok_or_else(|| Error::InvalidKfpkg(format!("invalid address '{s}'"))),
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::InvalidKfpkg(format!("invalid address {n}"))),
        other => Err(Error::InvalidKfpkg(format!("invalid address {other}"))),
    }
}

/// Parse an integer literal with an optional `0x`, `0o` or `0b` prefix.
pub fn parse_int(text: &str) -> Option<u32> {
    let text = text.trim();
    let lower = text.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = lower.strip_prefix("0o") {
        u32::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u32::from_str_radix(bin, 2).ok()
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn package(manifest: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file(MANIFEST_NAME, options).unwrap();
        writer.write_all(manifest.as_bytes()).unwrap();
        for (name, data) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_bare_hex_addresses() {
        let manifest = r#"{
    "version": "0.1.0",
    "files": [
        {
            "address": 0x00000,
            "bin": "firmware.bin",
            "sha256Prefix": true
        },
        {
            "address": 0x300000,
            "bin": "model.kmodel",
            "sha256Prefix": false
        }
    ]
}"#;
        let data = package(manifest, &[("firmware.bin", b"fw"), ("model.kmodel", b"model")]);
        let kfpkg = Kfpkg::from_bytes(data).unwrap();

        assert_eq!(kfpkg.version(), Some("0.1.0"));
        let jobs = kfpkg.into_write_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].address, 0);
        assert!(jobs[0].sha256_prefix);
        assert_eq!(jobs[0].data, b"fw");
        assert_eq!(jobs[1].address, 0x300000);
        assert!(!jobs[1].sha256_prefix);
        assert_eq!(jobs[1].name, "model.kmodel");
    }

    #[test]
    fn test_quoted_and_decimal_addresses() {
        let manifest = r#"{"files": [{"address": "0x1000", "bin": "a.bin", "sha256Prefix": true}, {"address": 8192, "bin": "b.bin", "sha256Prefix": false}]}"#;
        let data = package(manifest, &[("a.bin", b"a"), ("b.bin", b"b")]);
        let kfpkg = Kfpkg::from_bytes(data).unwrap();

        assert_eq!(kfpkg.entries()[0].address, 0x1000);
        assert_eq!(kfpkg.entries()[1].address, 8192);
    }

    #[test]
    fn test_missing_manifest() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("other.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        let data = writer.finish().unwrap().into_inner();

        assert!(matches!(Kfpkg::from_bytes(data), Err(Error::InvalidKfpkg(_))));
    }

    #[test]
    fn test_missing_listed_file() {
        let manifest = r#"{"files": [{"address": 0x0, "bin": "gone.bin", "sha256Prefix": true}]}"#;
        let data = package(manifest, &[]);
        assert!(matches!(Kfpkg::from_bytes(data), Err(Error::InvalidKfpkg(_))));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            Kfpkg::from_bytes(b"PK but not really".to_vec()),
            Err(Error::InvalidKfpkg(_))
        ));
    }

    #[test]
    fn test_quote_bare_addresses() {
        assert_eq!(
            quote_bare_addresses(r#"{"address": 0x10, "bin": "x"}"#),
            r#"{"address": "0x10", "bin": "x"}"#
        );
        assert_eq!(
            quote_bare_addresses(r#"{"address":"0x10"}"#),
            r#"{"address":"0x10"}"#
        );
        assert_eq!(
            quote_bare_addresses("{\"address\": 0x10 }"),
            "{\"address\": \"0x10\" }"
        );
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("0x300000"), Some(0x300000));
        assert_eq!(parse_int("0X10"), Some(16));
        assert_eq!(parse_int("4096"), Some(4096));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("zz"), None);
    }
}
