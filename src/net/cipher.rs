//! Pluggable byte transform applied to everything a connection sends
//!
//! A cipher must be fragment-stable: ciphertext produced from arbitrary
//! plaintext fragments must decrypt correctly when the receiver sees it cut at
//! different boundaries, because the reliable transport is a byte stream.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

use crate::config::TextEncoding;
use crate::net::framing::{encode_frame, FrameBuffer};
use crate::net::protocol::{format_call, HandlerRef, Timestamp};

pub type Transform = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

const SELF_TEST_ROUNDS: usize = 8;
const SELF_TEST_MAX_FRAGMENT: usize = 23;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("Cipher round trip corrupted framed payload (round {0})")]
    RoundTrip(usize),
    #[error("Cipher failed single-byte round trip")]
    SingleByte,
}

/// Encrypt/decrypt pair
#[derive(Clone)]
pub struct Cipher {
    encrypt: Transform,
    decrypt: Transform,
}

impl Cipher {
    pub fn new(encrypt: Transform, decrypt: Transform) -> Self {
        Self { encrypt, decrypt }
    }

    /// Pass-through cipher used until one is installed
    pub fn identity() -> Self {
        Self {
            encrypt: Arc::new(|bytes: &[u8]| bytes.to_vec()),
            decrypt: Arc::new(|bytes: &[u8]| bytes.to_vec()),
        }
    }

    #[inline]
    pub fn encrypt(&self, bytes: &[u8]) -> Vec<u8> {
        (self.encrypt)(bytes)
    }

    #[inline]
    pub fn decrypt(&self, bytes: &[u8]) -> Vec<u8> {
        (self.decrypt)(bytes)
    }

    /// Verify the pair survives fragmented, re-cut traffic
    ///
    /// Plaintext is encrypted in random fragments, the ciphertext is re-cut at
    /// independent random boundaries, and each piece is decrypted and fed to a
    /// frame buffer. The reassembled frames must equal the originals.
    pub fn self_test(&self) -> Result<(), CipherError> {
        let single = self.decrypt(&self.encrypt(b"x"));
        if single != b"x" {
            return Err(CipherError::SingleByte);
        }

        let messages = self_test_messages();
        let payload: Vec<u8> = messages.iter().flat_map(|m| encode_frame(m)).collect();
        let mut rng = rand::thread_rng();

        for round in 0..SELF_TEST_ROUNDS {
            let mut ciphertext = Vec::with_capacity(payload.len());
            for fragment in random_cuts(&payload, &mut rng) {
                ciphertext.extend(self.encrypt(fragment));
            }

            let mut buffer = FrameBuffer::new(TextEncoding::Utf8, payload.len() + 1);
            let mut frames = Vec::with_capacity(messages.len());
            for piece in random_cuts(&ciphertext, &mut rng) {
                for frame in buffer.push(&self.decrypt(piece)) {
                    frames.push(frame.map_err(|_| CipherError::RoundTrip(round))?);
                }
            }

            if frames != messages || buffer.pending_len() != 0 {
                return Err(CipherError::RoundTrip(round));
            }
        }

        Ok(())
    }
}

impl Default for Cipher {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher")
    }
}

fn self_test_messages() -> Vec<String> {
    const PROBE: HandlerRef = HandlerRef::new("Probe", "Echo");
    let samples: [&[&str]; 4] = [
        &[],
        &["plain", "ascii"],
        &["größe", "日本語", "emoji 🚀"],
        &["", "trailing empty", ""],
    ];

    samples
        .iter()
        .enumerate()
        .filter_map(|(i, args)| format_call(PROBE, Timestamp(i as u64 * 7919), args).ok())
        .collect()
}

fn random_cuts<'a>(bytes: &'a [u8], rng: &mut impl Rng) -> Vec<&'a [u8]> {
    let mut pieces = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let size = rng.gen_range(1..=SELF_TEST_MAX_FRAGMENT).min(bytes.len() - offset);
        pieces.push(&bytes[offset..offset + size]);
        offset += size;
    }
    pieces
}
