//! Kendryte K210 support.
//!
//! Flashing is a two-stage affair. The boot ROM (stage 0, [`isp`]) can only
//! write SRAM and jump into it, so a small flash-mode stub is loaded first.
//! The stub (stage 1, [`flash`]) then erases and programs the SPI flash.
//! [`flasher`] sequences both.

pub mod flash;
pub mod flasher;
pub mod isp;

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

pub use flash::FlashSession;
pub use flasher::{
    EraseRange, FlashOutcome, K210Flasher, Plan, RebootMethod, SessionConfig, SessionState,
};
pub use isp::IspSession;

/// Rate the boot ROM and a freshly booted stub listen on.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Per-call reply deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Boot ROM greeting during reset and auto-detect.
    pub greeting: Duration,
    /// Ordinary commands.
    pub command: Duration,
    /// Flash erase, write and reboot.
    pub bulk: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            greeting: Duration::from_millis(500),
            command: Duration::from_secs(3),
            bulk: Duration::from_secs(90),
        }
    }
}

/// Fixed delays of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// After each DTR/RTS step.
    pub reset_step: Duration,
    /// Between booting the stub and greeting it.
    pub boot_settle: Duration,
    /// Between a baud change request and switching the host side.
    pub baud_settle: Duration,
    /// Between status polls while the flash is busy erasing or rebooting.
    pub busy_poll: Duration,
    /// Before re-sending a chunk the flash was too busy to take.
    pub write_busy: Duration,
    /// Between starting an erase and the first status poll.
    pub erase_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reset_step: Duration::from_millis(100),
            boot_settle: Duration::from_millis(100),
            baud_settle: Duration::from_millis(50),
            busy_poll: Duration::from_secs(5),
            write_busy: Duration::from_millis(500),
            erase_settle: Duration::from_millis(100),
        }
    }
}

impl Timing {
    /// No delays at all, for simulated devices.
    pub fn none() -> Self {
        Self {
            reset_step: Duration::ZERO,
            boot_settle: Duration::ZERO,
            baud_settle: Duration::ZERO,
            busy_poll: Duration::ZERO,
            write_busy: Duration::ZERO,
            erase_settle: Duration::ZERO,
        }
    }
}

/// SPI flash the stub should program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashChip {
    /// In-chip flash on SPI3.
    InChip,
    /// On-board flash on SPI0.
    #[default]
    OnBoard,
}

impl FlashChip {
    /// Value of the FLASH_INIT address field.
    pub fn selector(self) -> u32 {
        match self {
            Self::InChip => 0,
            Self::OnBoard => 1,
        }
    }
}

impl TryFrom<u8> for FlashChip {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::InChip),
            1 => Ok(Self::OnBoard),
            other => Err(Error::Config(format!(
                "invalid flash chip {other} (0 = in-chip, 1 = on-board)"
            ))),
        }
    }
}

impl fmt::Display for FlashChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InChip => write!(f, "In-Chip"),
            Self::OnBoard => write!(f, "On-Board"),
        }
    }
}

#[cfg(test)]
pub(crate) mod sim {
    //! A scripted K210 for session tests.

    use std::sync::{Arc, Mutex};

    use crate::port::mock::{Lines, MockPort, reply};
    use crate::protocol::isp::{Dialect, FlashOp, IspOp, Request};

    /// What the simulated device has seen.
    #[derive(Debug, Default)]
    pub(crate) struct Journal {
        pub sram: Vec<(u32, Vec<u8>)>,
        pub flash: Vec<(u32, Vec<u8>)>,
        pub erases: Vec<(u32, u32)>,
        pub ops: Vec<u8>,
    }

    /// Device that is in ISP mode after any reset and answers everything.
    ///
    /// `answers_greeting` decides, from the line levels at the time of the
    /// NOP, whether the reset sequence worked.
    pub(crate) fn device<F>(answers_greeting: F) -> (MockPort, Arc<Mutex<Journal>>)
    where
        F: Fn(Lines) -> bool + Send + 'static,
    {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let log = Arc::clone(&journal);
        let mut erase_polls = 0;

        let port = MockPort::with_line_responder(move |request: &Request, lines| {
            let mut log = log.lock().unwrap();
            log.ops.push(request.op());
            match request.op() {
                op if op == IspOp::Nop.as_byte() => {
                    if answers_greeting(lines) {
                        vec![reply(0xC2, 0xE0)]
                    } else {
                        Vec::new()
                    }
                },
                op if op == IspOp::MemoryWrite.as_byte() => {
                    log.sram.push((request.address(), request.payload().to_vec()));
                    vec![reply(0xC3, 0x00)]
                },
                op if op == IspOp::MemoryBoot.as_byte() => Vec::new(),
                op if op == IspOp::ChangeBaudRate.as_byte() => Vec::new(),
                op if op == FlashOp::Nop.as_byte() => vec![reply(0xD2, 0xE0)],
                op if op == FlashOp::UarthsBaudRateSet.as_byte() => Vec::new(),
                op if op == FlashOp::FlashInit.as_byte() => vec![reply(0xD7, 0xE0)],
                op if op == FlashOp::FlashEraseNonblocking.as_byte() => {
                    log.erases.push((request.address(), request.length()));
                    vec![reply(0xD8, 0xE0)]
                },
                op if op == FlashOp::FlashStatus.as_byte() => {
                    erase_polls += 1;
                    if erase_polls < 3 {
                        vec![reply(0xD9, 0xE7)]
                    } else {
                        vec![reply(0xD9, 0xE0)]
                    }
                },
                op if op == FlashOp::FlashWrite.as_byte() => {
                    log.flash.push((request.address(), request.payload().to_vec()));
                    vec![reply(0xD4, 0xE0)]
                },
                op if op == FlashOp::Reboot.as_byte() => vec![reply(0xD5, 0xE0)],
                _ => vec![reply(request.op(), 0xE3)],
            }
        });
        (port, journal)
    }
}
