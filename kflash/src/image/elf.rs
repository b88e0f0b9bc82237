//! ELF images for SRAM boot.
//!
//! Only loadable segments linked into the K210 SRAM window are kept; the
//! rest (debug sections, zero-sized BSS, segments at address 0) never
//! reach the device.

use log::{debug, warn};
use object::{Object, ObjectSegment};

use crate::error::{Error, Result};
use crate::image::WriteJob;

/// SRAM base address.
pub const SRAM_BASE: u64 = 0x8000_0000;

/// Same address as seen by 64-bit toolchains that sign extend it.
pub const SRAM_BASE_SIGN_EXTENDED: u64 = 0xffff_ffff_8000_0000;

/// Extract the loadable SRAM segments of an ELF file.
pub fn load_segments(data: &[u8]) -> Result<Vec<WriteJob>> {
    let file = object::File::parse(data).map_err(|e| Error::InvalidElf(e.to_string()))?;

    let entry = file.entry();
    if entry != SRAM_BASE && entry != SRAM_BASE_SIGN_EXTENDED {
        warn!("ELF entry point {entry:#x} is not {SRAM_BASE:#x}; the program may not start");
    }

    let mut jobs = Vec::new();
    for segment in file.segments() {
        let vaddr = segment.address();
        let bytes = segment
            .data()
            .map_err(|e| Error::InvalidElf(e.to_string()))?;

        if vaddr == 0 || vaddr & SRAM_BASE == 0 || bytes.is_empty() {
            debug!("Skipping segment at {vaddr:#x} ({} bytes)", bytes.len());
            continue;
        }

        debug!("Segment at {vaddr:#x}: {} bytes", bytes.len());
        jobs.push(WriteJob {
            name: format!("segment@{vaddr:#x}"),
            address: vaddr as u32,
            data: bytes.to_vec(),
            sha256_prefix: false,
            encrypt: false,
        });
    }

    if jobs.is_empty() {
        return Err(Error::InvalidElf("no loadable SRAM segments".to_string()));
    }
    Ok(jobs)
}
