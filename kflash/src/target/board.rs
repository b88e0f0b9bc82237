//! Board profiles.
//!
//! A K210 enters the boot ROM's ISP mode when IO16 is held low while reset
//! is released. Each board wires DTR and RTS of its USB bridge to those two
//! pins differently, so each profile carries its own line sequences. Adding
//! a board means adding data here, not new control flow.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One control-line write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Set DTR to the given level.
    Dtr(bool),
    /// Set RTS to the given level.
    Rts(bool),
}

/// Line writes applied together, followed by one settle delay.
pub type ResetStep = &'static [Signal];

/// A fixed DTR/RTS sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSequence {
    /// Name for logs.
    pub name: &'static str,
    /// Steps, in order.
    pub steps: &'static [ResetStep],
}

use Signal::{Dtr, Rts};

const KD233_ISP: ResetSequence = ResetSequence {
    name: "kd233",
    steps: &[
        &[Dtr(false), Rts(false)],
        &[Dtr(true), Rts(false)],
        &[Rts(true), Dtr(false)],
    ],
};

const KD233_BOOT: ResetSequence = ResetSequence {
    name: "kd233",
    steps: &[
        &[Dtr(false), Rts(false)],
        &[Dtr(true), Rts(false)],
        &[Rts(false), Dtr(false)],
    ],
};

const DAN_ISP: ResetSequence = ResetSequence {
    name: "dan",
    steps: &[
        &[Dtr(false), Rts(false)],
        &[Dtr(false), Rts(true)],
        &[Rts(false), Dtr(true)],
    ],
};

const DAN_BOOT: ResetSequence = ResetSequence {
    name: "dan",
    steps: &[
        &[Dtr(false), Rts(false)],
        &[Dtr(false), Rts(true)],
        &[Rts(false), Dtr(false)],
    ],
};

const GO_D_ISP: ResetSequence = ResetSequence {
    name: "goD",
    steps: &[
        &[Dtr(true), Rts(true)],
        &[Rts(false), Dtr(true)],
        &[Rts(false), Dtr(true)],
    ],
};

const GO_D_BOOT: ResetSequence = ResetSequence {
    name: "goD",
    steps: &[
        &[Dtr(false), Rts(false)],
        &[Rts(false), Dtr(true)],
        &[Rts(true), Dtr(true)],
    ],
};

const MAIXGO_BOOT: ResetSequence = ResetSequence {
    name: "maixgo",
    steps: &[
        &[Dtr(false), Rts(false)],
        &[Rts(false), Dtr(true)],
        &[Rts(false), Dtr(false)],
    ],
};

/// Supported development boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Board {
    /// Kendryte KD233.
    Kd233,
    /// Sipeed Maix Dan Dock.
    Dan,
    /// Sipeed Maix Bit.
    Bit,
    /// Sipeed Maix Bit with microphone array.
    BitMic,
    /// Sipeed Maix Go with open-ec / new CMSIS-DAP firmware. Also Maixduino.
    GoE,
    /// Sipeed Maix Go with old CMSIS-DAP firmware.
    GoD,
    /// Trainer board.
    Trainer,
}

/// Profiles tried in order when no board is given.
///
/// kd233 appears twice on purpose; some boards only answer the second try.
pub const AUTO_DETECT_ORDER: [Board; 4] = [Board::Dan, Board::Kd233, Board::GoD, Board::Kd233];

impl Board {
    /// Every board, for help text and completions.
    pub const ALL: [Board; 7] = [
        Self::Kd233,
        Self::Dan,
        Self::Bit,
        Self::BitMic,
        Self::GoE,
        Self::GoD,
        Self::Trainer,
    ];

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Kd233 => "kd233",
            Self::Dan => "dan",
            Self::Bit => "bit",
            Self::BitMic => "bit_mic",
            Self::GoE => "goE",
            Self::GoD => "goD",
            Self::Trainer => "trainer",
        }
    }

    /// Parse a board name, accepting aliases. Case insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "kd233" => Some(Self::Kd233),
            "dan" => Some(Self::Dan),
            "bit" => Some(Self::Bit),
            "bit_mic" => Some(Self::BitMic),
            "goe" | "maixduino" => Some(Self::GoE),
            "god" => Some(Self::GoD),
            "trainer" => Some(Self::Trainer),
            _ => None,
        }
    }

    /// Sequence that leaves the chip in the boot ROM's ISP mode.
    pub fn isp_sequence(self) -> &'static ResetSequence {
        match self {
            Self::Dan | Self::Bit | Self::Trainer => &DAN_ISP,
            Self::Kd233 | Self::BitMic | Self::GoE => &KD233_ISP,
            Self::GoD => &GO_D_ISP,
        }
    }

    /// Sequence that restarts the chip into its flashed firmware.
    pub fn boot_sequence(self) -> &'static ResetSequence {
        match self {
            Self::Dan | Self::Bit | Self::Trainer => &DAN_BOOT,
            Self::Kd233 | Self::BitMic => &KD233_BOOT,
            Self::GoE => &MAIXGO_BOOT,
            Self::GoD => &GO_D_BOOT,
        }
    }

    /// Boards behind an FT2232 bridge, which can follow the stage-0 clock
    /// trim needed for fast mode.
    pub fn is_ft2232(self) -> bool {
        matches!(self, Self::GoE | Self::Trainer)
    }

    /// Host-side rate to program after asking the stub for `baud`.
    ///
    /// The open-ec bridge on goE maps a few nominal rates onto magic
    /// divisor values.
    pub fn host_baud(self, baud: u32) -> u32 {
        if self != Self::GoE {
            return baud;
        }
        match baud {
            4_500_000 => 300,
            6_000_000 => 250,
            7_500_000 => 350,
            other => other,
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Board {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| {
            let names: Vec<_> = Self::ALL.iter().map(|b| b.name()).collect();
            Error::Config(format!(
                "unknown board '{s}' (expected one of: {}, maixduino)",
                names.join(", ")
            ))
        })
    }
}
