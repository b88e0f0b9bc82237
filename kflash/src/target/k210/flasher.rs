//! End-to-end K210 programming.
//!
//! [`K210Flasher`] owns the transport and walks a session through its
//! states:
//!
//! ```text
//! Disconnected -> IspGreeted -> StubBooted -> FlashGreeted -> FlashInitialized
//!                                    |                            |
//!                                    | (SRAM plan)                v
//!                                    v                     Erasing / Writing
//!                                  Closed <---------------- Rebooting
//! ```
//!
//! Every run ends in `Closed`, whether it succeeded or not.
//!
//! ## Example
//!
//! ```rust,no_run
//! use kflash::image::Firmware;
//! use kflash::target::k210::{K210Flasher, Plan, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stub = std::fs::read("isp_flash.bin")?;
//!     let jobs = Firmware::from_file("app.bin")?.flash_jobs()?;
//!
//!     let config = SessionConfig::default().with_baud(2_000_000);
//!     let mut flasher = K210Flasher::open("/dev/ttyUSB0", config)?;
//!     let plan = Plan::Flash { stub: &stub, jobs: &jobs, erase_first: false };
//!     flasher.run(&plan, &mut |name, done, total| {
//!         println!("{name}: {done}/{total}");
//!     })?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::kfpkg::parse_int;
use crate::image::{AesKey, ImageBuilder, IoMode, SRAM_LOAD_ADDRESS, WriteJob};
use crate::port::Port;
use crate::protocol::transaction::{RetryPolicy, Transport};
use crate::target::board::Board;
use crate::target::k210::isp::STAGE0_FAST_BAUD;
use crate::target::k210::{
    DEFAULT_BAUD, FlashChip, FlashSession, IspSession, Timeouts, Timing,
};

/// Reset/greet passes before auto-detect gives up.
pub const DEFAULT_DETECT_ROUNDS: usize = 15;

/// Everything a session needs to know up front.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Board profile; `None` auto-detects.
    pub board: Option<Board>,
    /// Baud rate for the flash-mode stub.
    pub baud: u32,
    /// Flash chip to program.
    pub flash_chip: FlashChip,
    /// Never raise the stage-0 baud rate.
    pub slow_mode: bool,
    /// I/O mode recorded in image headers.
    pub io_mode: IoMode,
    /// Key for encrypted images.
    pub aes_key: Option<AesKey>,
    /// Reply deadlines.
    pub timeouts: Timeouts,
    /// Retry budget.
    pub retry: RetryPolicy,
    /// Protocol delays.
    pub timing: Timing,
    /// Auto-detect passes.
    pub detect_rounds: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            board: None,
            baud: DEFAULT_BAUD,
            flash_chip: FlashChip::default(),
            slow_mode: false,
            io_mode: IoMode::default(),
            aes_key: None,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            timing: Timing::default(),
            detect_rounds: DEFAULT_DETECT_ROUNDS,
        }
    }
}

impl SessionConfig {
    /// Set the board, or `None` to auto-detect.
    #[must_use]
    pub fn with_board(mut self, board: Option<Board>) -> Self {
        self.board = board;
        self
    }

    /// Set the flash-mode baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Set the flash chip.
    #[must_use]
    pub fn with_flash_chip(mut self, chip: FlashChip) -> Self {
        self.flash_chip = chip;
        self
    }

    /// Enable or disable slow mode.
    #[must_use]
    pub fn with_slow_mode(mut self, slow: bool) -> Self {
        self.slow_mode = slow;
        self
    }

    /// Set the image I/O mode.
    #[must_use]
    pub fn with_io_mode(mut self, mode: IoMode) -> Self {
        self.io_mode = mode;
        self
    }

    /// Set the encryption key.
    #[must_use]
    pub fn with_aes_key(mut self, key: Option<AesKey>) -> Self {
        self.aes_key = key;
        self
    }

    /// Override reply deadlines.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override protocol delays.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Whether stage 0 should switch to 1.5 Mbaud before loading.
    ///
    /// Needs an explicit board: an auto-detected one may be wrong about its
    /// bridge.
    fn wants_fast_mode(&self, sram: bool) -> bool {
        self.board.is_some() && !self.slow_mode && (self.baud >= STAGE0_FAST_BAUD || sram)
    }
}

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet.
    Disconnected,
    /// Boot ROM answered the greeting.
    IspGreeted,
    /// Stub (or SRAM program) loaded and started.
    StubBooted,
    /// Stub answered its greeting.
    FlashGreeted,
    /// Flash chip selected.
    FlashInitialized,
    /// Erase in progress.
    Erasing,
    /// Writing jobs.
    Writing,
    /// Reboot requested.
    Rebooting,
    /// Port closed.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::IspGreeted => "ISP greeted",
            Self::StubBooted => "stub booted",
            Self::FlashGreeted => "flash greeted",
            Self::FlashInitialized => "flash initialized",
            Self::Erasing => "erasing",
            Self::Writing => "writing",
            Self::Rebooting => "rebooting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How the chip was restarted after flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootMethod {
    /// The stub's REBOOT command.
    Stub,
    /// The board's DTR/RTS boot sequence, after REBOOT failed.
    ResetLines,
}

/// Successful end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    /// Flash programmed (or erased) and the chip restarted.
    Flashed {
        /// Board the session ran against.
        board: Board,
        /// How the chip was restarted.
        reboot: RebootMethod,
    },
    /// Program loaded into SRAM and started. Nothing more will be said to
    /// the device.
    SramBooted {
        /// Board the session ran against.
        board: Board,
    },
}

/// Flash region for the stub's nonblocking erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRange {
    /// Start offset.
    pub address: u32,
    /// Bytes to erase; 0 erases the whole chip.
    pub length: u32,
}

impl EraseRange {
    /// Whole chip.
    pub const ALL: Self = Self {
        address: 0,
        length: 0,
    };

    /// Erase granularity.
    pub const SECTOR_SIZE: u32 = 4096;

    /// Largest addressable flash.
    pub const MAX_END: u32 = 0x0400_0000;

    /// Validate a range: both values 4 KiB aligned, ending within 64 MiB.
    pub fn new(address: u32, length: u32) -> Result<Self> {
        if address % Self::SECTOR_SIZE != 0 || length % Self::SECTOR_SIZE != 0 {
            return Err(Error::InvalidEraseRange(format!(
                "address {address:#x} and length {length:#x} must be aligned to 4 KiB"
            )));
        }
        let end = address.checked_add(length).filter(|&end| end <= Self::MAX_END);
        if end.is_none() {
            return Err(Error::InvalidEraseRange(format!(
                "{address:#x} + {length:#x} exceeds the 64 MiB flash window"
            )));
        }
        Ok(Self { address, length })
    }

    /// Parse user input. `length` may be `all`, which also forces the
    /// address to 0.
    pub fn parse(address: &str, length: &str) -> Result<Self> {
        if length.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::ALL);
        }
        let address = parse_int(address)
            .ok_or_else(|| Error::InvalidEraseRange(format!("invalid address '{address}'")))?;
        let length = parse_int(length)
            .ok_or_else(|| Error::InvalidEraseRange(format!("invalid length '{length}'")))?;
        Self::new(address, length)
    }

    /// Whether this erases the whole chip.
    pub fn is_all(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Display for EraseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            write!(f, "entire flash")
        } else {
            write!(
                f,
                "{:#010x}..{:#010x} ({} KiB)",
                self.address,
                self.address + self.length,
                self.length / 1024
            )
        }
    }
}

/// What a run should do.
#[derive(Debug, Clone, Copy)]
pub enum Plan<'a> {
    /// Load `stub`, optionally erase the chip, then write `jobs`.
    Flash {
        /// Flash-mode stub image.
        stub: &'a [u8],
        /// Writes, in order.
        jobs: &'a [WriteJob],
        /// Erase the whole chip first.
        erase_first: bool,
    },
    /// Load `stub` and erase `range`.
    Erase {
        /// Flash-mode stub image.
        stub: &'a [u8],
        /// Region to erase.
        range: EraseRange,
    },
    /// Write `jobs` into SRAM and boot them.
    Sram {
        /// SRAM writes, in order.
        jobs: &'a [WriteJob],
    },
}

impl Plan<'_> {
    fn is_sram(&self) -> bool {
        matches!(self, Self::Sram { .. })
    }
}

/// K210 programmer.
///
/// Generic over the port so tests can drive it with a simulated device.
pub struct K210Flasher<P: Port> {
    transport: Transport<P>,
    config: SessionConfig,
    state: SessionState,
    board: Option<Board>,
}

impl<P: Port> K210Flasher<P> {
    /// Wrap an open port.
    pub fn new(port: P, config: SessionConfig) -> Self {
        Self {
            transport: Transport::new(port, config.retry),
            config,
            state: SessionState::Disconnected,
            board: None,
        }
    }

    /// Stop at the next request once `flag` is set.
    #[must_use]
    pub fn with_cancel_flag(self, flag: Arc<AtomicBool>) -> Self {
        Self {
            transport: self.transport.with_cancel_flag(flag),
            ..self
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Board in use, once connected.
    pub fn board(&self) -> Option<Board> {
        self.board
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Consume the flasher and return the port.
    pub fn into_port(self) -> P {
        self.transport.into_port()
    }

    /// Reset into ISP mode and wait for the boot ROM's greeting.
    pub fn connect(&mut self) -> Result<Board> {
        let SessionConfig {
            board,
            detect_rounds,
            timeouts,
            timing,
            ..
        } = self.config;
        let found =
            IspSession::new(&mut self.transport, timeouts, timing).connect(board, detect_rounds)?;
        self.board = Some(found);
        self.state = SessionState::IspGreeted;
        Ok(found)
    }

    /// Execute `plan` and close the port, whatever the result.
    ///
    /// `progress` gets `(name, done, total)` once per chunk.
    pub fn run(
        &mut self,
        plan: &Plan<'_>,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<FlashOutcome> {
        let result = self.execute(plan, progress);
        if let Err(e) = &result {
            debug!("Session failed in state '{}': {e}", self.state);
        }
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {e}", self.transport.port().name());
        }
        result
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.transport.close()
    }

    fn execute(
        &mut self,
        plan: &Plan<'_>,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<FlashOutcome> {
        let board = match (self.state, self.board) {
            (SessionState::IspGreeted, Some(board)) => board,
            _ => self.connect()?,
        };
        let config = self.config.clone();

        let mut isp = IspSession::new(&mut self.transport, config.timeouts, config.timing);
        if config.wants_fast_mode(plan.is_sram()) {
            isp.enter_fast_mode(board)?;
        }

        let stub = match *plan {
            Plan::Sram { jobs } => {
                for job in jobs {
                    let total = job.data.len();
                    info!("Loading {} ({total} bytes) at {:#010x}", job.name, job.address);
                    isp.write_memory(&job.data, job.address, &mut |done| {
                        progress(&job.name, done, total);
                    })?;
                }
                isp.boot(SRAM_LOAD_ADDRESS)?;
                self.state = SessionState::StubBooted;
                self.transport.port_mut().set_baud_rate(config.baud)?;
                info!("Program started from SRAM");
                return Ok(FlashOutcome::SramBooted { board });
            },
            Plan::Flash { stub, .. } | Plan::Erase { stub, .. } => stub,
        };

        let total = stub.len();
        isp.install_stub(stub, &mut |done| progress("bootloader", done, total))?;
        isp.boot(SRAM_LOAD_ADDRESS)?;
        self.state = SessionState::StubBooted;

        self.transport.port_mut().set_baud_rate(DEFAULT_BAUD)?;
        thread::sleep(config.timing.boot_settle);
        self.transport.clear()?;

        let mut flash = FlashSession::new(&mut self.transport, config.timeouts, config.timing);
        flash.greet()?;
        self.state = SessionState::FlashGreeted;

        if config.baud != DEFAULT_BAUD {
            flash.change_baud(config.baud, board)?;
            flash.greet()?;
        }

        flash.init_flash(config.flash_chip)?;
        self.state = SessionState::FlashInitialized;

        if let Plan::Flash {
            jobs, erase_first, ..
        } = *plan
        {
            if erase_first {
                self.state = SessionState::Erasing;
                flash.erase(EraseRange::ALL.address, EraseRange::ALL.length)?;
            }
            self.state = SessionState::Writing;
            for job in jobs {
                write_job(&mut flash, job, &config, progress)?;
            }
        } else if let Plan::Erase { range, .. } = *plan {
            self.state = SessionState::Erasing;
            flash.erase(range.address, range.length)?;
        }

        self.state = SessionState::Rebooting;
        let reboot = match flash.reboot() {
            Ok(()) => RebootMethod::Stub,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("Reboot command failed ({e}), resetting through DTR/RTS");
                IspSession::new(&mut self.transport, config.timeouts, config.timing)
                    .reset_to_boot(board)?;
                RebootMethod::ResetLines
            },
        };

        info!("Finished");
        Ok(FlashOutcome::Flashed { board, reboot })
    }
}

/// Write one job, wrapping it in an image header when asked to.
fn write_job<P: Port>(
    flash: &mut FlashSession<'_, P>,
    job: &WriteJob,
    config: &SessionConfig,
    progress: &mut dyn FnMut(&str, usize, usize),
) -> Result<()> {
    if !job.sha256_prefix {
        let total = job.data.len();
        info!("Writing {} ({total} bytes) at {:#010x}", job.name, job.address);
        return flash.write(&job.data, job.address, true, &mut |done| {
            progress(&job.name, done, total);
        });
    }

    let key = if job.encrypt {
        config.aes_key.clone()
    } else {
        None
    };
    let image = ImageBuilder::new()
        .aes_key(key)
        .io_mode(config.io_mode)
        .build(&job.data)?;
    if image.is_encrypted() {
        info!("{} is AES encrypted", job.name);
    }
    let bytes = image.to_bytes();
    let total = bytes.len();
    info!("Writing {} ({total} bytes) at {:#010x}", job.name, job.address);
    flash.write(&bytes, job.address, false, &mut |done| {
        progress(&job.name, done, total);
    })
}

#[cfg(feature = "native")]
mod native_impl {
    use super::{K210Flasher, Result, SessionConfig};
    use crate::port::{NativePort, SerialConfig};
    use crate::target::k210::DEFAULT_BAUD;

    impl K210Flasher<NativePort> {
        /// Open `port_name` at the boot ROM's rate.
        pub fn open(port_name: &str, config: SessionConfig) -> Result<Self> {
            let port = NativePort::open(&SerialConfig::new(port_name, DEFAULT_BAUD))?;
            Ok(Self::new(port, config))
        }
    }
}

impl<P: Port> crate::target::Flasher for K210Flasher<P> {
    fn connect(&mut self) -> Result<Board> {
        self.connect()
    }

    fn run(
        &mut self,
        plan: &Plan<'_>,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<FlashOutcome> {
        self.run(plan, progress)
    }

    fn board(&self) -> Option<Board> {
        self.board
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn close(&mut self) {
        if let Err(e) = K210Flasher::close(self) {
            warn!("Failed to close port: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use sha2::{Digest, Sha256};

    use super::*;
    use crate::image::firmware::FLAG_AES;
    use crate::port::mock::{MockPort, reply};
    use crate::target::k210::sim;

    fn test_config() -> SessionConfig {
        SessionConfig::default()
            .with_timing(Timing::none())
            .with_timeouts(Timeouts {
                greeting: Duration::from_millis(10),
                command: Duration::from_millis(20),
                bulk: Duration::from_millis(20),
            })
            .with_retry(RetryPolicy {
                max_retries: 2,
                backoff: Duration::ZERO,
            })
            .with_io_mode(IoMode::Qio)
    }

    fn image_job(data: Vec<u8>) -> WriteJob {
        WriteJob {
            name: "app.bin".to_string(),
            address: 0,
            data,
            sha256_prefix: true,
            encrypt: true,
        }
    }

    #[test]
    fn test_erase_range_validation() {
        assert_eq!(
            EraseRange::new(0x1000, 0x2000).unwrap(),
            EraseRange {
                address: 0x1000,
                length: 0x2000
            }
        );
        assert!(EraseRange::new(0x1001, 0x1000).is_err());
        assert!(EraseRange::new(0x1000, 0x0800).is_err());
        assert!(EraseRange::new(0x0400_0000, 0x1000).is_err());
        assert!(EraseRange::new(0x0300_0000, 0x0100_0000).is_ok());
        assert!(EraseRange::new(0xFFFF_F000, 0x2000).is_err());
        // length 0 asks the stub for a chip erase
        assert!(EraseRange::new(0x1000, 0).unwrap().is_all());
    }

    #[test]
    fn test_erase_range_parse() {
        assert_eq!(EraseRange::parse("0x10000", "ALL").unwrap(), EraseRange::ALL);
        assert_eq!(
            EraseRange::parse("0x10000", "4096").unwrap(),
            EraseRange {
                address: 0x10000,
                length: 4096
            }
        );
        assert!(matches!(
            EraseRange::parse("-1", "0x1000"),
            Err(Error::InvalidEraseRange(_))
        ));
    }

    #[test]
    fn test_flash_plain_image_end_to_end() {
        let (port, journal) = sim::device(|lines| !lines.dtr && lines.rts);
        let mut flasher = K210Flasher::new(port, test_config());
        let stub = vec![0x13; 100];
        let jobs = vec![image_job(vec![0xAA; 32])];

        let mut updates = Vec::new();
        let outcome = flasher
            .run(
                &Plan::Flash {
                    stub: &stub,
                    jobs: &jobs,
                    erase_first: false,
                },
                &mut |name, done, total| updates.push((name.to_string(), done, total)),
            )
            .unwrap();

        assert_eq!(
            outcome,
            FlashOutcome::Flashed {
                board: Board::Kd233,
                reboot: RebootMethod::Stub
            }
        );
        assert_eq!(flasher.state(), SessionState::Closed);

        let journal = journal.lock().unwrap();
        assert_eq!(journal.sram, vec![(0x8000_0000, stub.clone())]);
        assert!(journal.erases.is_empty());
        assert_eq!(journal.flash.len(), 1);

        let (address, image) = &journal.flash[0];
        assert_eq!(*address, 0);
        assert_eq!(image.len(), 69);
        assert_eq!(&image[..5], &[0x00, 0x20, 0x00, 0x00, 0x00]);
        assert_eq!(
            hex::encode(&image[37..]),
            "c5a48efa44bb7993ee39a59e10f28edb61f14eb715a4114897dd595c3331d2db"
        );

        // flash init came before the write and the reboot came last
        let init = journal.ops.iter().position(|&op| op == 0xD7).unwrap();
        let write = journal.ops.iter().position(|&op| op == 0xD4).unwrap();
        assert!(init < write);
        assert_eq!(journal.ops.last(), Some(&0xD5));

        assert_eq!(updates.last(), Some(&("app.bin".to_string(), 69, 69)));
        assert_eq!(updates[0], ("bootloader".to_string(), 100, 100));
        drop(journal);
        assert!(flasher.into_port().is_closed());
    }

    #[test]
    fn test_flash_encrypted_image() {
        let (port, journal) = sim::device(|_| true);
        let config = test_config()
            .with_board(Some(Board::Dan))
            .with_aes_key(Some(AesKey::new([0; 16])));
        let mut flasher = K210Flasher::new(port, config);
        let jobs = vec![image_job(vec![0xAA; 32])];

        flasher
            .run(
                &Plan::Flash {
                    stub: &[0x13; 8],
                    jobs: &jobs,
                    erase_first: true,
                },
                &mut |_, _, _| {},
            )
            .unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.erases, vec![(0, 0)]);
        let image = &journal.flash[0].1;
        assert_eq!(image[0], FLAG_AES);
        assert_ne!(&image[5..37], &[0xAA; 32][..]);
        // digest covers the ciphertext
        assert_eq!(&image[37..], Sha256::digest(&image[..37]).as_slice());
    }

    #[test]
    fn test_kfpkg_style_job_is_not_encrypted() {
        let (port, journal) = sim::device(|_| true);
        let config = test_config()
            .with_board(Some(Board::Dan))
            .with_aes_key(Some(AesKey::new([0; 16])));
        let mut flasher = K210Flasher::new(port, config);
        let mut job = image_job(vec![1; 20]);
        job.encrypt = false;
        job.address = 0x30_0000;

        flasher
            .run(
                &Plan::Flash {
                    stub: &[0x13; 8],
                    jobs: &[job],
                    erase_first: false,
                },
                &mut |_, _, _| {},
            )
            .unwrap();

        let journal = journal.lock().unwrap();
        let (address, image) = &journal.flash[0];
        assert_eq!(*address, 0x30_0000);
        assert_eq!(image[0], 0x00);
        assert_eq!(image.len(), 1 + 4 + 20 + 32);
    }

    #[test]
    fn test_erase_plan() {
        let (port, journal) = sim::device(|_| true);
        let mut flasher = K210Flasher::new(port, test_config().with_board(Some(Board::Bit)));

        flasher
            .run(
                &Plan::Erase {
                    stub: &[0x13; 8],
                    range: EraseRange::new(0x10_0000, 0x1_0000).unwrap(),
                },
                &mut |_, _, _| {},
            )
            .unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.erases, vec![(0x10_0000, 0x1_0000)]);
        assert!(journal.flash.is_empty());
    }

    #[test]
    fn test_sram_plan_boots_without_stub() {
        let (port, journal) = sim::device(|_| true);
        let config = test_config()
            .with_board(Some(Board::Dan))
            .with_baud(2_000_000);
        let mut flasher = K210Flasher::new(port, config);
        let jobs = vec![
            WriteJob {
                name: "text".to_string(),
                address: 0x8000_0000,
                data: vec![1; 10],
                sha256_prefix: false,
                encrypt: false,
            },
            WriteJob {
                name: "data".to_string(),
                address: 0x8000_1000,
                data: vec![2; 4],
                sha256_prefix: false,
                encrypt: false,
            },
        ];

        let outcome = flasher
            .run(&Plan::Sram { jobs: &jobs }, &mut |_, _, _| {})
            .unwrap();
        assert_eq!(outcome, FlashOutcome::SramBooted { board: Board::Dan });

        let journal = journal.lock().unwrap();
        assert_eq!(journal.sram.len(), 2);
        assert_eq!(journal.sram[1].0, 0x8000_1000);
        assert!(!journal.ops.iter().any(|&op| op >= 0xD0));
        assert_eq!(journal.ops.last(), Some(&0xC5));
        drop(journal);

        let port = flasher.into_port();
        assert_eq!(port.baud_log().last(), Some(&2_000_000));
        assert!(port.is_closed());
    }

    #[test]
    fn test_fast_mode_needs_explicit_board() {
        let config = test_config().with_baud(2_000_000);
        assert!(!config.wants_fast_mode(false));
        assert!(config.clone().with_board(Some(Board::GoE)).wants_fast_mode(false));
        assert!(!config
            .clone()
            .with_board(Some(Board::GoE))
            .with_slow_mode(true)
            .wants_fast_mode(true));
        assert!(test_config()
            .with_board(Some(Board::GoE))
            .wants_fast_mode(true));
        assert!(!test_config()
            .with_board(Some(Board::GoE))
            .wants_fast_mode(false));
    }

    #[test]
    fn test_baud_change_greets_again() {
        let (port, journal) = sim::device(|_| true);
        let config = test_config()
            .with_board(Some(Board::GoE))
            .with_baud(6_000_000);
        let mut flasher = K210Flasher::new(port, config);

        flasher
            .run(
                &Plan::Erase {
                    stub: &[0x13; 8],
                    range: EraseRange::ALL,
                },
                &mut |_, _, _| {},
            )
            .unwrap();

        let journal = journal.lock().unwrap();
        let greetings = journal.ops.iter().filter(|&&op| op == 0xD2).count();
        assert_eq!(greetings, 2);
        drop(journal);
        // fast stage 0, back to 115200 for the stub, then the goE alias
        assert_eq!(
            flasher.into_port().baud_log(),
            &[STAGE0_FAST_BAUD, DEFAULT_BAUD, 250]
        );
    }

    #[test]
    fn test_reboot_failure_falls_back_to_reset_lines() {
        // a stub that rejects REBOOT
        let port = MockPort::new(|request| match request.op() {
            0xC3 => vec![reply(0xC3, 0x00)],
            op @ (0xC2 | 0xD2 | 0xD7 | 0xD8 | 0xD9) => vec![reply(op, 0xE0)],
            0xD5 => vec![reply(0xD5, 0xE3)],
            _ => Vec::new(),
        });
        let mut flasher = K210Flasher::new(port, test_config().with_board(Some(Board::Dan)));

        let outcome = flasher
            .run(
                &Plan::Erase {
                    stub: &[0x13; 8],
                    range: EraseRange::ALL,
                },
                &mut |_, _, _| {},
            )
            .unwrap();
        assert_eq!(
            outcome,
            FlashOutcome::Flashed {
                board: Board::Dan,
                reboot: RebootMethod::ResetLines
            }
        );

        let port = flasher.into_port();
        let reboots = port.requests().iter().filter(|r| r.op() == 0xD5).count();
        assert_eq!(reboots, 3);
        // dan boot sequence leaves both lines released
        let last = port.line_log().last().copied().unwrap();
        assert!(!last.dtr && !last.rts);
    }

    #[test]
    fn test_failure_still_closes_port() {
        let port = MockPort::new(|_| Vec::new());
        let config = SessionConfig {
            detect_rounds: 1,
            ..test_config()
        };
        let mut flasher = K210Flasher::new(port, config);

        let err = flasher
            .run(&Plan::Sram { jobs: &[] }, &mut |_, _, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
        assert_eq!(flasher.state(), SessionState::Closed);
        assert!(flasher.into_port().is_closed());
    }

    #[test]
    fn test_cancel_flag_aborts_run() {
        let (port, _) = sim::device(|_| true);
        let flag = Arc::new(AtomicBool::new(false));
        let mut flasher = K210Flasher::new(port, test_config().with_board(Some(Board::Dan)))
            .with_cancel_flag(Arc::clone(&flag));
        let stub = vec![0x13; 4096];

        let err = flasher
            .run(
                &Plan::Flash {
                    stub: &stub,
                    jobs: &[],
                    erase_first: false,
                },
                &mut |_, done, _| {
                    if done >= 1024 {
                        flag.store(true, Ordering::Relaxed);
                    }
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(flasher.into_port().is_closed());
    }
}
