//! Protocol implementations.

pub mod isp;
pub mod slip;
pub mod transaction;

// Re-export common types
pub use isp::{Dialect, ErrorCode, FlashOp, IspOp, Request, Response};
pub use transaction::{CallOptions, CallReport, RetryPolicy, Transport};
