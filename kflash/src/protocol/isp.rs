//! K210 ISP request/response wire format.
//!
//! Two dialects share the same framing. The boot ROM speaks the stage-0
//! dialect ([`IspOp`], `0xC1..=0xC6`); the flash-mode stub loaded into SRAM
//! speaks the stage-1 dialect ([`FlashOp`], `0xD1..=0xD9`).
//!
//! ## Request format
//!
//! ```text
//! +--------+----------+--------+---------+--------+-----------+
//! |   Op   | Reserved | CRC32  | Address | Length |  Payload  |
//! +--------+----------+--------+---------+--------+-----------+
//! | u16 LE |  u16 LE  | u32 LE | u32 LE  | u32 LE | variable  |
//! +--------+----------+--------+---------+--------+-----------+
//! ```
//!
//! The CRC32 covers address, length and payload. Bare commands (NOP, flash
//! status, reboot) are the op byte followed by twelve zero bytes.
//!
//! ## Response format
//!
//! ```text
//! +----+--------+---------------------+
//! | Op | Reason | Optional UTF-8 text |
//! +----+--------+---------------------+
//! ```

use std::fmt;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// Length of a bare command body.
pub const BARE_COMMAND_LEN: usize = 13;

/// Stage-0 (boot ROM) operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IspOp {
    /// Echo (0xC1).
    Echo,
    /// No operation, used as the greeting (0xC2).
    Nop,
    /// Write to SRAM (0xC3).
    MemoryWrite,
    /// Read from SRAM (0xC4).
    MemoryRead,
    /// Jump to an SRAM address (0xC5).
    MemoryBoot,
    /// Change the UART baud rate (0xC6).
    ChangeBaudRate,
    /// Debug text from the device (0xD1).
    DebugInfo,
    /// Any other byte.
    Unknown(u8),
}

/// Stage-1 (flash-mode stub) operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashOp {
    /// Debug text from the stub (0xD1).
    DebugInfo,
    /// No operation, used as the greeting (0xD2).
    Nop,
    /// Blocking erase (0xD3).
    FlashErase,
    /// Write one chunk to flash (0xD4).
    FlashWrite,
    /// Reset the chip (0xD5).
    Reboot,
    /// Change the UARTHS baud rate (0xD6).
    UarthsBaudRateSet,
    /// Select and initialise the flash chip (0xD7).
    FlashInit,
    /// Start an erase and return immediately (0xD8).
    FlashEraseNonblocking,
    /// Poll the state of a nonblocking erase (0xD9).
    FlashStatus,
    /// Any other byte.
    Unknown(u8),
}

/// Reason codes carried in the second byte of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 0x00.
    Default,
    /// 0xE0.
    Ok,
    /// 0xE1.
    BadDataLen,
    /// 0xE2.
    BadDataChecksum,
    /// 0xE3.
    InvalidCommand,
    /// 0xE4, stage-1 only.
    BadInit,
    /// 0xE5, stage-1 only.
    BadErase,
    /// 0xE6, stage-1 only.
    BadWrite,
    /// 0xE7, stage-1 only.
    FlashBusy,
    /// Any other byte, or a stage-1 code seen in a stage-0 response.
    Unknown(u8),
}

impl ErrorCode {
    /// Map a reason byte. `flash_mode` enables the stage-1 only codes.
    pub fn from_byte(byte: u8, flash_mode: bool) -> Self {
        match byte {
            0x00 => Self::Default,
            0xE0 => Self::Ok,
            0xE1 => Self::BadDataLen,
            0xE2 => Self::BadDataChecksum,
            0xE3 => Self::InvalidCommand,
            0xE4 if flash_mode => Self::BadInit,
            0xE5 if flash_mode => Self::BadErase,
            0xE6 if flash_mode => Self::BadWrite,
            0xE7 if flash_mode => Self::FlashBusy,
            other => Self::Unknown(other),
        }
    }

    /// Wire value.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Default => 0x00,
            Self::Ok => 0xE0,
            Self::BadDataLen => 0xE1,
            Self::BadDataChecksum => 0xE2,
            Self::InvalidCommand => 0xE3,
            Self::BadInit => 0xE4,
            Self::BadErase => 0xE5,
            Self::BadWrite => 0xE6,
            Self::FlashBusy => 0xE7,
            Self::Unknown(b) => b,
        }
    }

    /// Text used when the device sends none.
    pub fn default_text(self) -> &'static str {
        match self {
            Self::Default | Self::Ok => "",
            Self::BadDataLen => "bad data len",
            Self::BadDataChecksum => "bad data checksum",
            Self::InvalidCommand => "invalid command",
            Self::BadInit => "bad initialization",
            Self::BadErase => "bad flash erase",
            Self::BadWrite => "bad flash write",
            Self::FlashBusy => "flash is busy",
            Self::Unknown(_) => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#04x})", self.as_byte())
    }
}

/// One of the two operation-code enumerations.
///
/// Responses are parsed against the dialect of the session that sent the
/// request, so a stage-0 reply is never mistaken for a stage-1 one.
pub trait Dialect: Copy + Eq + fmt::Debug {
    /// Human-readable dialect name for logs.
    const NAME: &'static str;
    /// Whether stage-1 reason codes are meaningful.
    const FLASH_MODE: bool;

    /// Total mapping from a byte.
    fn from_byte(byte: u8) -> Self;

    /// Wire value.
    fn as_byte(self) -> u8;

    /// Whether this op carries device log text rather than a reply.
    fn is_debug_info(self) -> bool;
}

impl Dialect for IspOp {
    const NAME: &'static str = "ISP";
    const FLASH_MODE: bool = false;

    fn from_byte(byte: u8) -> Self {
        match byte {
            0xC1 => Self::Echo,
            0xC2 => Self::Nop,
            0xC3 => Self::MemoryWrite,
            0xC4 => Self::MemoryRead,
            0xC5 => Self::MemoryBoot,
            0xC6 => Self::ChangeBaudRate,
            0xD1 => Self::DebugInfo,
            other => Self::Unknown(other),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Echo => 0xC1,
            Self::Nop => 0xC2,
            Self::MemoryWrite => 0xC3,
            Self::MemoryRead => 0xC4,
            Self::MemoryBoot => 0xC5,
            Self::ChangeBaudRate => 0xC6,
            Self::DebugInfo => 0xD1,
            Self::Unknown(b) => b,
        }
    }

    fn is_debug_info(self) -> bool {
        self == Self::DebugInfo
    }
}

impl Dialect for FlashOp {
    const NAME: &'static str = "flash";
    const FLASH_MODE: bool = true;

    fn from_byte(byte: u8) -> Self {
        match byte {
            0xD1 => Self::DebugInfo,
            0xD2 => Self::Nop,
            0xD3 => Self::FlashErase,
            0xD4 => Self::FlashWrite,
            0xD5 => Self::Reboot,
            0xD6 => Self::UarthsBaudRateSet,
            0xD7 => Self::FlashInit,
            0xD8 => Self::FlashEraseNonblocking,
            0xD9 => Self::FlashStatus,
            other => Self::Unknown(other),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::DebugInfo => 0xD1,
            Self::Nop => 0xD2,
            Self::FlashErase => 0xD3,
            Self::FlashWrite => 0xD4,
            Self::Reboot => 0xD5,
            Self::UarthsBaudRateSet => 0xD6,
            Self::FlashInit => 0xD7,
            Self::FlashEraseNonblocking => 0xD8,
            Self::FlashStatus => 0xD9,
            Self::Unknown(b) => b,
        }
    }

    fn is_debug_info(self) -> bool {
        self == Self::DebugInfo
    }
}

/// Request body, before SLIP framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    op: u8,
    kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestKind {
    Bare,
    Full {
        address: u32,
        length: u32,
        payload: Vec<u8>,
    },
}

impl Request {
    /// A request whose length field is the payload length.
    pub fn new(op: impl Dialect, address: u32, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            op: op.as_byte(),
            kind: RequestKind::Full {
                address,
                length: payload.len() as u32,
                payload,
            },
        }
    }

    /// A request with an explicit length field and no payload.
    pub fn with_length(op: impl Dialect, address: u32, length: u32) -> Self {
        Self {
            op: op.as_byte(),
            kind: RequestKind::Full {
                address,
                length,
                payload: Vec::new(),
            },
        }
    }

    /// A bare command: the op byte and twelve zero bytes, no checksum.
    pub fn bare(op: impl Dialect) -> Self {
        Self {
            op: op.as_byte(),
            kind: RequestKind::Bare,
        }
    }

    /// Operation byte.
    pub fn op(&self) -> u8 {
        self.op
    }

    /// Address field (0 for bare commands).
    pub fn address(&self) -> u32 {
        match &self.kind {
            RequestKind::Bare => 0,
            RequestKind::Full { address, .. } => *address,
        }
    }

    /// Length field (0 for bare commands).
    pub fn length(&self) -> u32 {
        match &self.kind {
            RequestKind::Bare => 0,
            RequestKind::Full { length, .. } => *length,
        }
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        match &self.kind {
            RequestKind::Bare => &[],
            RequestKind::Full { payload, .. } => payload,
        }
    }

    /// Serialise the request body.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        match &self.kind {
            RequestKind::Bare => {
                let mut buf = vec![0u8; BARE_COMMAND_LEN];
                buf[0] = self.op;
                buf
            },
            RequestKind::Full {
                address,
                length,
                payload,
            } => {
                let mut body = Vec::with_capacity(8 + payload.len());
                body.write_u32::<LittleEndian>(*address).unwrap();
                body.write_u32::<LittleEndian>(*length).unwrap();
                body.extend_from_slice(payload);

                let mut buf = Vec::with_capacity(8 + body.len());
                buf.write_u16::<LittleEndian>(u16::from(self.op)).unwrap();
                buf.write_u16::<LittleEndian>(0).unwrap();
                buf.write_u32::<LittleEndian>(crc32fast::hash(&body)).unwrap();
                buf.extend_from_slice(&body);
                buf
            },
        }
    }

    /// Parse a request body. Mostly useful for device simulators and logs.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Protocol(format!(
                "request too short: {} byte(s)",
                data.len()
            )));
        }
        let op = data[0];
        if data.len() == BARE_COMMAND_LEN && data[1..].iter().all(|&b| b == 0) {
            return Ok(Self {
                op,
                kind: RequestKind::Bare,
            });
        }
        if data.len() < 16 {
            return Err(Error::Protocol(format!(
                "request too short: {} byte(s)",
                data.len()
            )));
        }

        let word =
            |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let checksum = word(4);
        let actual = crc32fast::hash(&data[8..]);
        if checksum != actual {
            return Err(Error::Protocol(format!(
                "request checksum mismatch: expected {checksum:#010x}, got {actual:#010x}"
            )));
        }

        Ok(Self {
            op,
            kind: RequestKind::Full {
                address: word(8),
                length: word(12),
                payload: data[16..].to_vec(),
            },
        })
    }
}

/// Parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<D> {
    /// Operation the device is answering.
    pub op: D,
    /// Reason code.
    pub reason: ErrorCode,
    /// Text sent by the device, if any.
    pub text: Option<String>,
}

impl<D: Dialect> Response<D> {
    /// Parse a SLIP payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::ShortResponse(data.len()));
        }

        let op = D::from_byte(data[0]);
        let reason = ErrorCode::from_byte(data[1], D::FLASH_MODE);
        let text = (data.len() > 2)
            .then(|| String::from_utf8_lossy(&data[2..]).trim_end_matches('\0').to_string());

        Ok(Self { op, reason, text })
    }

    /// Device text, or the default text for the reason code.
    pub fn message(&self) -> &str {
        self.text
            .as_deref()
            .unwrap_or_else(|| self.reason.default_text())
    }
}
