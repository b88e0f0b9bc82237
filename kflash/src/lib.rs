//! # kflash
//!
//! A library for programming Kendryte K210 boards over the boot ROM's
//! serial ISP protocol.
//!
//! This crate provides:
//!
//! - SLIP framing and the two request/response dialects (boot ROM and
//!   flash-mode stub) with a bounded retry engine
//! - Board reset sequences driven through DTR/RTS, with auto-detection
//! - Flash, erase and SRAM-boot sessions
//! - Firmware inputs: raw binaries, ELF files and `.kfpkg` packages
//! - The SHA-256 image header and AES-128-CBC image encryption
//!
//! ## Features
//!
//! - `native` (default): serial ports through the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use kflash::image::Firmware;
//! use kflash::target::{Board, Plan, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stub = std::fs::read("isp_flash.bin")?;
//!     let jobs = Firmware::from_file("firmware.bin")?.flash_jobs()?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let config = SessionConfig::default()
//!             .with_board(Some(Board::Dan))
//!             .with_baud(1_500_000);
//!         let mut flasher = kflash::target::create_flasher("/dev/ttyUSB0", config)?;
//!         flasher.run(
//!             &Plan::Flash { stub: &stub, jobs: &jobs, erase_first: false },
//!             &mut |name, done, total| println!("{name}: {done}/{total}"),
//!         )?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod crypto;
pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a process-wide check consulted before every request.
///
/// The checker returns `true` when the current operation should stop, for
/// example after Ctrl-C. Only the first registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Whether the embedding application asked to stop.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::NativePort;
#[cfg(feature = "native")]
pub use target::create_flasher;
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_k210_ports, detect_ports},
    error::{Error, Result},
    image::{AesKey, Firmware, FirmwareFormat, FirmwareImage, ImageBuilder, IoMode, Kfpkg, WriteJob},
    port::{Port, SerialConfig},
    protocol::{RetryPolicy, Transport},
    target::{
        Board, EraseRange, FlashChip, FlashOutcome, Flasher, K210Flasher, Plan, RebootMethod,
        SessionConfig, SessionState,
    },
};
