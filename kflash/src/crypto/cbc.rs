//! CBC chaining over [`Aes`] with a zero IV.

use crate::crypto::aes::{Aes, BLOCK_SIZE};
use crate::error::{Error, Result};

/// Streaming CBC state.
///
/// Encryption and decryption share one chaining value, so use a fresh
/// instance per direction.
#[derive(Debug, Clone)]
pub struct Cbc {
    cipher: Aes,
    chain: [u8; BLOCK_SIZE],
}

impl Cbc {
    /// Start a chain with an all-zero IV.
    pub fn new(key: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: Aes::new(key)?,
            chain: [0u8; BLOCK_SIZE],
        })
    }

    /// Encrypt the next block of the stream.
    pub fn encrypt_block(&mut self, plaintext: &[u8]) -> Result<[u8; BLOCK_SIZE]> {
        if plaintext.len() != BLOCK_SIZE {
            return Err(Error::InvalidBlockLength(plaintext.len()));
        }
        let mut mixed = [0u8; BLOCK_SIZE];
        for (out, (p, c)) in mixed.iter_mut().zip(plaintext.iter().zip(self.chain)) {
            *out = p ^ c;
        }
        self.chain = self.cipher.encrypt_block(&mixed)?;
        Ok(self.chain)
    }

    /// Decrypt the next block of the stream.
    pub fn decrypt_block(&mut self, ciphertext: &[u8]) -> Result<[u8; BLOCK_SIZE]> {
        let mut plain = self.cipher.decrypt_block(ciphertext)?;
        for (p, c) in plain.iter_mut().zip(self.chain) {
            *p ^= c;
        }
        self.chain.copy_from_slice(ciphertext);
        Ok(plain)
    }

    /// Encrypt a whole buffer. Its length must be a multiple of 16.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Self::check_len(data)?;
        let mut out = Vec::with_capacity(data.len());
        for block in data.chunks_exact(BLOCK_SIZE) {
            out.extend_from_slice(&self.encrypt_block(block)?);
        }
        Ok(out)
    }

    /// Decrypt a whole buffer. Its length must be a multiple of 16.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Self::check_len(data)?;
        let mut out = Vec::with_capacity(data.len());
        for block in data.chunks_exact(BLOCK_SIZE) {
            out.extend_from_slice(&self.decrypt_block(block)?);
        }
        Ok(out)
    }

    fn check_len(data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(Error::InvalidBlockLength(data.len()));
        }
        Ok(())
    }
}
