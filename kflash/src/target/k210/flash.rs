//! Stage-1 session with the flash-mode stub.

use std::thread;

use log::{debug, info};

use crate::error::Result;
use crate::image::chunks;
use crate::port::Port;
use crate::protocol::isp::{ErrorCode, FlashOp, Request, Response};
use crate::protocol::transaction::{CallOptions, Transport};
use crate::target::board::Board;
use crate::target::k210::{FlashChip, Timeouts, Timing};

/// Bytes per FLASH_WRITE frame.
pub const FLASH_CHUNK_SIZE: usize = 16 * 1024;

/// Accept exactly `op` with `reason`.
fn expect(op: FlashOp, reason: ErrorCode) -> impl Fn(FlashOp, ErrorCode) -> bool {
    move |got_op, got_reason| got_op == op && got_reason == reason
}

fn never(_: FlashOp, _: ErrorCode) -> bool {
    false
}

/// Flash-mode stub session over a borrowed transport.
pub struct FlashSession<'a, P: Port> {
    transport: &'a mut Transport<P>,
    timeouts: Timeouts,
    timing: Timing,
}

impl<'a, P: Port> FlashSession<'a, P> {
    /// Borrow `transport` for stage-1 requests.
    pub fn new(transport: &'a mut Transport<P>, timeouts: Timeouts, timing: Timing) -> Self {
        Self {
            transport,
            timeouts,
            timing,
        }
    }

    /// Wait for the stub to answer a NOP.
    pub fn greet(&mut self) -> Result<Response<FlashOp>> {
        let options = CallOptions::new("flash greeting", self.timeouts.command);
        let response = self.transport.call(
            &Request::bare(FlashOp::Nop),
            &options,
            expect(FlashOp::Nop, ErrorCode::Ok),
            never,
        )?;
        info!("Boot to flash mode successfully");
        Ok(response)
    }

    /// Switch the stub to `baud`. The stub does not reply.
    ///
    /// The host follows with [`Board::host_baud`], which differs from `baud`
    /// only for bridges with aliased divisors.
    pub fn change_baud(&mut self, baud: u32, board: Board) -> Result<()> {
        info!("Selected baud rate is {baud}");
        self.transport.send(&Request::new(
            FlashOp::UarthsBaudRateSet,
            0,
            baud.to_le_bytes(),
        ))?;
        thread::sleep(self.timing.baud_settle);
        let host = board.host_baud(baud);
        self.transport.port_mut().set_baud_rate(host)?;
        debug!("Host baud rate set to {host}");
        Ok(())
    }

    /// Select and initialise the flash chip.
    pub fn init_flash(&mut self, chip: FlashChip) -> Result<()> {
        info!("Selected flash: {chip}");
        let options = CallOptions::new("flash init", self.timeouts.command);
        self.transport.call(
            &Request::with_length(FlashOp::FlashInit, chip.selector(), 0),
            &options,
            expect(FlashOp::FlashInit, ErrorCode::Ok),
            never,
        )?;
        Ok(())
    }

    /// Erase `length` bytes from `address` and wait until the chip is idle.
    ///
    /// `(0, 0)` erases the whole chip.
    pub fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        if address == 0 && length == 0 {
            info!("Erasing the whole flash, this may take a while");
        } else {
            info!("Erasing {length:#x} bytes from {address:#010x}");
        }

        let start = CallOptions::new("flash erase", self.timeouts.bulk)
            .busy_delay(self.timing.busy_poll);
        self.transport.call(
            &Request::with_length(FlashOp::FlashEraseNonblocking, address, length),
            &start,
            expect(FlashOp::FlashEraseNonblocking, ErrorCode::Ok),
            expect(FlashOp::FlashEraseNonblocking, ErrorCode::FlashBusy),
        )?;

        self.transport.clear()?;
        thread::sleep(self.timing.erase_settle);

        let poll = CallOptions::new("flash status", self.timeouts.command)
            .busy_delay(self.timing.busy_poll);
        self.transport.call(
            &Request::bare(FlashOp::FlashStatus),
            &poll,
            expect(FlashOp::FlashStatus, ErrorCode::Ok),
            expect(FlashOp::FlashStatus, ErrorCode::FlashBusy),
        )?;
        info!("Erase complete");
        Ok(())
    }

    /// Write `data` to flash at `address` in 16 KiB frames.
    ///
    /// With `aligned` the first frame is shortened so later frames start on a
    /// chunk boundary.
    pub fn write(
        &mut self,
        data: &[u8],
        address: u32,
        aligned: bool,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        debug!("Writing {} bytes to flash at {address:#010x}", data.len());
        let options = CallOptions::new("flash write", self.timeouts.bulk)
            .busy_delay(self.timing.write_busy)
            .reopen_on_io_error();
        self.transport.write_frames(
            FlashOp::FlashWrite,
            chunks(data, address, FLASH_CHUNK_SIZE, aligned),
            &options,
            expect(FlashOp::FlashWrite, ErrorCode::Ok),
            expect(FlashOp::FlashWrite, ErrorCode::FlashBusy),
            progress,
        )
    }

    /// Ask the stub to reset the chip.
    pub fn reboot(&mut self) -> Result<()> {
        info!("Rebooting...");
        let options =
            CallOptions::new("reboot", self.timeouts.bulk).busy_delay(self.timing.busy_poll);
        self.transport.call(
            &Request::bare(FlashOp::Reboot),
            &options,
            expect(FlashOp::Reboot, ErrorCode::Ok),
            expect(FlashOp::Reboot, ErrorCode::FlashBusy),
        )?;
        Ok(())
    }
}
