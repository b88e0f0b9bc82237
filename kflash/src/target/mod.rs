//! Targets and board profiles.
//!
//! The CLI talks to a [`Flasher`] trait object so it does not depend on the
//! port type underneath.

pub mod board;
pub mod k210;

use crate::error::Result;

pub use board::{AUTO_DETECT_ORDER, Board, ResetSequence, Signal};
pub use k210::{
    EraseRange, FlashChip, FlashOutcome, K210Flasher, Plan, RebootMethod, SessionConfig,
    SessionState, Timeouts, Timing,
};

/// Programming operations independent of the port implementation.
pub trait Flasher {
    /// Reset into ISP mode and wait for the boot ROM; returns the board used.
    fn connect(&mut self) -> Result<Board>;

    /// Execute a plan and close the port.
    ///
    /// `progress` receives `(name, done, total)` once per chunk.
    fn run(
        &mut self,
        plan: &Plan<'_>,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<FlashOutcome>;

    /// Board in use, once connected.
    fn board(&self) -> Option<Board>;

    /// Current session state.
    fn state(&self) -> SessionState;

    /// Close the port. Safe to call more than once.
    fn close(&mut self);
}

/// Open `port_name` and build a flasher for it.
#[cfg(feature = "native")]
pub fn create_flasher(port_name: &str, config: SessionConfig) -> Result<Box<dyn Flasher>> {
    Ok(Box::new(K210Flasher::open(port_name, config)?))
}
