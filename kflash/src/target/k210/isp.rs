//! Stage-0 session with the K210 boot ROM.

use std::thread;

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::image::{SRAM_LOAD_ADDRESS, chunks};
use crate::port::Port;
use crate::protocol::isp::{ErrorCode, IspOp, Request, Response};
use crate::protocol::transaction::{CallOptions, Transport};
use crate::target::board::{AUTO_DETECT_ORDER, Board, ResetSequence, Signal};
use crate::target::k210::{Timeouts, Timing};

/// Bytes per MEMORY_WRITE frame.
pub const MEMORY_CHUNK_SIZE: usize = 1024;

/// Host rate used while the boot ROM runs in fast mode.
pub const STAGE0_FAST_BAUD: u32 = 1_500_000;

/// Rate requested from the boot ROM for fast mode.
///
/// The ROM derives its divisor from a 38 MHz reference while the FT2232
/// bridge runs from 38.6 MHz, so the request is scaled to compensate.
pub const STAGE0_FAST_REQUEST: u32 = (STAGE0_FAST_BAUD as u64 * 386 / 380) as u32;

/// Greeting attempts after switching to fast mode.
const FAST_MODE_GREETINGS: usize = 3;

/// Whether a greeting failure means "try the next reset profile".
fn is_silence(error: &Error) -> bool {
    matches!(
        error,
        Error::Timeout(_) | Error::Framing(_) | Error::ShortResponse(_)
    )
}

fn memory_write_ok(_: IspOp, reason: ErrorCode) -> bool {
    matches!(reason, ErrorCode::Default | ErrorCode::Ok)
}

fn never(_: IspOp, _: ErrorCode) -> bool {
    false
}

/// Boot ROM session over a borrowed transport.
pub struct IspSession<'a, P: Port> {
    transport: &'a mut Transport<P>,
    timeouts: Timeouts,
    timing: Timing,
}

impl<'a, P: Port> IspSession<'a, P> {
    /// Borrow `transport` for stage-0 requests.
    pub fn new(transport: &'a mut Transport<P>, timeouts: Timeouts, timing: Timing) -> Self {
        Self {
            transport,
            timeouts,
            timing,
        }
    }

    /// Drive the board into ISP mode.
    pub fn reset_to_isp(&mut self, board: Board) -> Result<()> {
        self.apply(board.isp_sequence())
    }

    /// Drive the board into a normal boot from flash.
    pub fn reset_to_boot(&mut self, board: Board) -> Result<()> {
        info!("Resetting {board} into its firmware");
        self.apply(board.boot_sequence())
    }

    fn apply(&mut self, sequence: &ResetSequence) -> Result<()> {
        trace!("Applying {} reset sequence", sequence.name);
        let delay = self.timing.reset_step;
        let port = self.transport.port_mut();
        for step in sequence.steps {
            for signal in *step {
                match *signal {
                    Signal::Dtr(level) => port.set_dtr(level)?,
                    Signal::Rts(level) => port.set_rts(level)?,
                }
            }
            trace!("  {step:?}");
            thread::sleep(delay);
        }
        Ok(())
    }

    /// Send one NOP and wait for any well-formed reply.
    ///
    /// No retries: a silent device usually means the reset sequence did not
    /// match the board.
    pub fn greet(&mut self) -> Result<Response<IspOp>> {
        self.transport.clear()?;
        self.transport.send(&Request::bare(IspOp::Nop))?;
        let frame = self.transport.receive(self.timeouts.greeting)?;
        let response = Response::<IspOp>::parse(&frame)?;
        debug!("Greeting reply: {:?} {}", response.op, response.reason);
        Ok(response)
    }

    /// Reset and greet until the boot ROM answers.
    ///
    /// With `board` set only that profile is tried; otherwise the profiles of
    /// [`AUTO_DETECT_ORDER`] are tried in turn. Gives up with
    /// `DeviceNotFound` after `rounds` passes.
    pub fn connect(&mut self, board: Option<Board>, rounds: usize) -> Result<Board> {
        info!("Trying to enter ISP mode on {}...", self.transport.port().name());

        let candidates: Vec<Board> = board.map_or_else(|| AUTO_DETECT_ORDER.to_vec(), |b| vec![b]);

        for round in 1..=rounds {
            for &candidate in &candidates {
                self.transport.check_cancelled()?;
                self.reset_to_isp(candidate)?;
                match self.greet() {
                    Ok(_) => {
                        if board.is_none() {
                            info!("Automatically detected board: {candidate}");
                        }
                        info!("Greeting message detected");
                        return Ok(candidate);
                    },
                    Err(e) if is_silence(&e) => {
                        debug!("No greeting with {candidate} reset (round {round}/{rounds}): {e}");
                    },
                    Err(e) => return Err(e),
                }
            }
        }

        Err(Error::DeviceNotFound)
    }

    /// Ask the boot ROM for `device_baud`, then switch the host to `host_baud`.
    ///
    /// The ROM switches without replying.
    pub fn change_baud(&mut self, device_baud: u32, host_baud: u32) -> Result<()> {
        self.transport
            .send(&Request::new(IspOp::ChangeBaudRate, 0, device_baud.to_le_bytes()))?;
        thread::sleep(self.timing.baud_settle);
        self.transport.port_mut().set_baud_rate(host_baud)?;
        debug!("Stage-0 baud: device {device_baud}, host {host_baud}");
        Ok(())
    }

    /// Raise the boot ROM to 1.5 Mbaud if the board's bridge can follow.
    ///
    /// Returns whether the rate changed. Only FT2232 boards are switched;
    /// the CH340 boards cannot hit the trimmed rate.
    pub fn enter_fast_mode(&mut self, board: Board) -> Result<bool> {
        if !board.is_ft2232() {
            info!("{board}: staying at the default stage-0 baud rate");
            return Ok(false);
        }

        info!("FT2232 mode, stage-0 baud rate {STAGE0_FAST_BAUD}");
        self.change_baud(STAGE0_FAST_REQUEST, STAGE0_FAST_BAUD)?;

        for attempt in 1..=FAST_MODE_GREETINGS {
            self.transport.check_cancelled()?;
            match self.greet() {
                Ok(_) => return Ok(true),
                Err(e) if is_silence(&e) => {
                    warn!("Fast mode greeting {attempt}/{FAST_MODE_GREETINGS} failed: {e}");
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::DeviceUnresponsive {
            operation: "fast mode greeting (try slow mode)",
            attempts: FAST_MODE_GREETINGS,
        })
    }

    /// Write `data` to SRAM at `address` in 1 KiB frames.
    pub fn write_memory(
        &mut self,
        data: &[u8],
        address: u32,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        debug!("Writing {} bytes to SRAM at {address:#010x}", data.len());
        let options = CallOptions::new("memory write", self.timeouts.command);
        self.transport.write_frames(
            IspOp::MemoryWrite,
            chunks(data, address, MEMORY_CHUNK_SIZE, false),
            &options,
            memory_write_ok,
            never,
            progress,
        )
    }

    /// Load the flash-mode stub at the SRAM base.
    pub fn install_stub(&mut self, stub: &[u8], progress: &mut dyn FnMut(usize)) -> Result<()> {
        info!("Downloading ISP stub ({} bytes)", stub.len());
        self.write_memory(stub, SRAM_LOAD_ADDRESS, progress)
    }

    /// Jump to `address`. The ROM does not reply.
    pub fn boot(&mut self, address: u32) -> Result<()> {
        info!("Booting from {address:#010x}");
        self.transport
            .send(&Request::with_length(IspOp::MemoryBoot, address, 0))
    }
}
