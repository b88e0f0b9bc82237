//! Firmware encryption.
//!
//! The device stub decrypts with AES-CBC under an all-zero IV and expects
//! zero padding, so both are fixed here rather than configurable.

pub mod aes;
pub mod cbc;

pub use aes::{Aes, BLOCK_SIZE};
pub use cbc::Cbc;
