//! AES block cipher (FIPS-197), table driven.
//!
//! The round tables are derived from the S-box at compile time. Decryption
//! uses the equivalent inverse cipher, so both directions run the same
//! four-table round function.

use crate::error::{Error, Result};

/// Block size in bytes.
pub const BLOCK_SIZE: usize = 16;

const SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

const INV_SBOX: [u8; 256] = invert(&SBOX);

const RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

/// Forward round tables: SubBytes + ShiftRows + MixColumns per byte lane.
const TE: [[u32; 256]; 4] = lanes(&forward_table());
/// Inverse round tables: InvSubBytes + InvMixColumns per byte lane.
const TD: [[u32; 256]; 4] = lanes(&inverse_table());
/// InvMixColumns alone, applied to the middle decryption round keys.
const TU: [[u32; 256]; 4] = lanes(&inv_mix_table());

const fn invert(sbox: &[u8; 256]) -> [u8; 256] {
    let mut out = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        out[sbox[i] as usize] = i as u8;
        i += 1;
    }
    out
}

const fn xtime(b: u8) -> u8 {
    (b << 1) ^ if b & 0x80 != 0 { 0x1b } else { 0 }
}

const fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        a = xtime(a);
        b >>= 1;
    }
    product
}

const fn column(b0: u8, b1: u8, b2: u8, b3: u8) -> u32 {
    ((b0 as u32) << 24) | ((b1 as u32) << 16) | ((b2 as u32) << 8) | b3 as u32
}

const fn forward_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let s = SBOX[i];
        table[i] = column(gmul(s, 2), s, s, gmul(s, 3));
        i += 1;
    }
    table
}

const fn inverse_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let s = INV_SBOX[i];
        table[i] = column(gmul(s, 14), gmul(s, 9), gmul(s, 13), gmul(s, 11));
        i += 1;
    }
    table
}

const fn inv_mix_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        table[i] = column(gmul(b, 14), gmul(b, 9), gmul(b, 13), gmul(b, 11));
        i += 1;
    }
    table
}

const fn lanes(base: &[u32; 256]) -> [[u32; 256]; 4] {
    let mut out = [[0u32; 256]; 4];
    let mut i = 0;
    while i < 256 {
        out[0][i] = base[i];
        out[1][i] = base[i].rotate_right(8);
        out[2][i] = base[i].rotate_right(16);
        out[3][i] = base[i].rotate_right(24);
        i += 1;
    }
    out
}

fn sub_word(w: u32) -> u32 {
    column(
        SBOX[(w >> 24) as usize & 0xFF],
        SBOX[(w >> 16) as usize & 0xFF],
        SBOX[(w >> 8) as usize & 0xFF],
        SBOX[w as usize & 0xFF],
    )
}

fn round(tables: &[[u32; 256]; 4], t: [u32; 4], key: [u32; 4], shift: [usize; 3]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (i, word) in out.iter_mut().enumerate() {
        *word = tables[0][(t[i] >> 24) as usize & 0xFF]
            ^ tables[1][(t[(i + shift[0]) % 4] >> 16) as usize & 0xFF]
            ^ tables[2][(t[(i + shift[1]) % 4] >> 8) as usize & 0xFF]
            ^ tables[3][t[(i + shift[2]) % 4] as usize & 0xFF]
            ^ key[i];
    }
    out
}

fn final_round(sbox: &[u8; 256], t: [u32; 4], key: [u32; 4], shift: [usize; 3]) -> [u8; 16] {
    let mut out = [0u8; BLOCK_SIZE];
    for i in 0..4 {
        let word = column(
            sbox[(t[i] >> 24) as usize & 0xFF],
            sbox[(t[(i + shift[0]) % 4] >> 16) as usize & 0xFF],
            sbox[(t[(i + shift[1]) % 4] >> 8) as usize & 0xFF],
            sbox[t[(i + shift[2]) % 4] as usize & 0xFF],
        ) ^ key[i];
        out[4 * i..4 * i + 4].copy_from_slice(&word.to_be_bytes());
    }
    out
}

fn load(block: &[u8]) -> Result<[u32; 4]> {
    if block.len() != BLOCK_SIZE {
        return Err(Error::InvalidBlockLength(block.len()));
    }
    let mut words = [0u32; 4];
    for (word, bytes) in words.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(words)
}

const ENCRYPT_SHIFT: [usize; 3] = [1, 2, 3];
const DECRYPT_SHIFT: [usize; 3] = [3, 2, 1];

/// Expanded AES key, usable for both directions.
#[derive(Clone)]
pub struct Aes {
    rounds: usize,
    encrypt_keys: Vec<[u32; 4]>,
    decrypt_keys: Vec<[u32; 4]>,
}

impl std::fmt::Debug for Aes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Round keys stay out of logs
        f.debug_struct("Aes")
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

impl Aes {
    /// Expand a 16, 24 or 32 byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let rounds = match key.len() {
            16 => 10,
            24 => 12,
            32 => 14,
            other => return Err(Error::InvalidKeySize(other)),
        };

        let nk = key.len() / 4;
        let total = (rounds + 1) * 4;
        let mut words: Vec<u32> = key
            .chunks_exact(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        for i in nk..total {
            let mut temp = words[i - 1];
            if i % nk == 0 {
                temp = sub_word(temp.rotate_left(8)) ^ (u32::from(RCON[i / nk - 1]) << 24);
            } else if nk > 6 && i % nk == 4 {
                // 256-bit keys substitute once more mid-expansion
                temp = sub_word(temp);
            }
            words.push(words[i - nk] ^ temp);
        }

        let encrypt_keys: Vec<[u32; 4]> = words
            .chunks_exact(4)
            .map(|w| [w[0], w[1], w[2], w[3]])
            .collect();

        let mut decrypt_keys: Vec<[u32; 4]> = encrypt_keys.iter().rev().copied().collect();
        for key in &mut decrypt_keys[1..rounds] {
            for word in key.iter_mut() {
                let w = *word;
                *word = TU[0][(w >> 24) as usize & 0xFF]
                    ^ TU[1][(w >> 16) as usize & 0xFF]
                    ^ TU[2][(w >> 8) as usize & 0xFF]
                    ^ TU[3][w as usize & 0xFF];
            }
        }

        Ok(Self {
            rounds,
            encrypt_keys,
            decrypt_keys,
        })
    }

    /// Number of rounds (10, 12 or 14).
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Encrypt one 16-byte block.
    pub fn encrypt_block(&self, block: &[u8]) -> Result<[u8; BLOCK_SIZE]> {
        let mut t = load(block)?;
        for (word, key) in t.iter_mut().zip(self.encrypt_keys[0]) {
            *word ^= key;
        }
        for key in &self.encrypt_keys[1..self.rounds] {
            t = round(&TE, t, *key, ENCRYPT_SHIFT);
        }
        Ok(final_round(&SBOX, t, self.encrypt_keys[self.rounds], ENCRYPT_SHIFT))
    }

    /// Decrypt one 16-byte block.
    pub fn decrypt_block(&self, block: &[u8]) -> Result<[u8; BLOCK_SIZE]> {
        let mut t = load(block)?;
        for (word, key) in t.iter_mut().zip(self.decrypt_keys[0]) {
            *word ^= key;
        }
        for key in &self.decrypt_keys[1..self.rounds] {
            t = round(&TD, t, *key, DECRYPT_SHIFT);
        }
        Ok(final_round(&INV_SBOX, t, self.decrypt_keys[self.rounds], DECRYPT_SHIFT))
    }
}
