//! Counter-mode keystream used as the entropy source for leaf signing
//!
//! A [`CounterRng`] is a pure function of (CA private key, seed):
//!
//! - the AES-128 key is the first 16 bytes of SHA-256 over the private key DER
//! - the initial 96-bit counter is the first 12 bytes of SHA-256 over the seed
//! - every refill seals a block of zeros under AES-128-GCM with the current
//!   counter as nonce (which yields the raw CTR keystream), then increments
//!   the counter
//!
//! Two streams built from the same key and seed produce identical bytes in any
//! process, so signing the same host set under the same CA is reproducible.

use std::io;

use rand::{CryptoRng, RngCore};
use rcgen::KeyPair;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};

use super::ca::KeyKind;
use super::error::{MitmError, Result};

/// Keystream bytes produced per refill
const BLOCK_LEN: usize = 64;

/// AES-128 key length
const KEY_LEN: usize = 16;

/// Deterministic AES counter-mode byte stream
pub struct CounterRng {
    cipher: LessSafeKey,
    counter: [u8; NONCE_LEN],
    block: [u8; BLOCK_LEN],
    pos: usize,
}

impl CounterRng {
    /// Build a stream from raw private key material and a seed
    pub fn new(key_material: &[u8], seed: &[u8]) -> Result<Self> {
        if key_material.is_empty() {
            return Err(MitmError::UnsupportedKey("empty key material".to_string()));
        }

        let key_digest = digest(&SHA256, key_material);
        let unbound = UnboundKey::new(&AES_128_GCM, &key_digest.as_ref()[..KEY_LEN])
            .map_err(|_| MitmError::Entropy("cannot derive AES-128 key".to_string()))?;

        let seed_digest = digest(&SHA256, seed);
        let mut counter = [0u8; NONCE_LEN];
        counter.copy_from_slice(&seed_digest.as_ref()[..NONCE_LEN]);

        Ok(Self {
            cipher: LessSafeKey::new(unbound),
            counter,
            block: [0u8; BLOCK_LEN],
            pos: BLOCK_LEN,
        })
    }

    /// Build a stream keyed from an RSA or ECDSA key pair
    pub fn from_key_pair(key: &KeyPair, seed: &[u8]) -> Result<Self> {
        if KeyKind::of(key.algorithm()).is_none() {
            return Err(MitmError::UnsupportedKey(format!("{:?}", key.algorithm())));
        }
        Self::new(&key.serialize_der(), seed)
    }

    /// Fill `dest` from the keystream, refilling as needed
    pub fn fill(&mut self, dest: &mut [u8]) -> Result<()> {
        let mut written = 0;
        while written < dest.len() {
            if self.pos == BLOCK_LEN {
                self.refill()?;
            }
            let n = (BLOCK_LEN - self.pos).min(dest.len() - written);
            dest[written..written + n].copy_from_slice(&self.block[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        Ok(())
    }

    fn refill(&mut self) -> Result<()> {
        let mut block = [0u8; BLOCK_LEN];
        let nonce = Nonce::assume_unique_for_key(self.counter);
        self.cipher
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut block)
            .map_err(|_| MitmError::Entropy("AES-GCM seal failed".to_string()))?;

        increment(&mut self.counter);
        self.block = block;
        self.pos = 0;
        Ok(())
    }
}

/// Big-endian increment with wrap-around
fn increment(counter: &mut [u8]) {
    for byte in counter.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

impl RngCore for CounterRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        // fill_bytes has no error channel, never hand out partial output
        if let Err(err) = self.fill(dest) {
            panic!("counter keystream failed: {err}");
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill(dest).map_err(rand::Error::new)
    }
}

impl CryptoRng for CounterRng {}

impl io::Read for CounterRng {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }
}
