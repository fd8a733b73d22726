//! FNV-1a-64 digest computation, whole-file and block-indexed.
//!
//! Offset basis and prime are fixed by the sidecar's checksum format:
//! any incremental computation over a partition of the byte sequence
//! must agree with a single-pass computation over the whole.

use std::fs::File;
use std::io::{self, Read};

const OFFSET_BASIS: u64 = 0x14650FB0739D0383;
const PRIME: u64 = 0x100000001B3;

/// Size of a block in block-indexed checksum mode.
pub const BLOCK_SIZE: u64 = 4096;

/// Incremental FNV-1a-64 accumulator.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

impl Fnv1a {
    pub fn new() -> Self {
        Fnv1a(OFFSET_BASIS)
    }

    /// Reconstruct an accumulator from a previously stored hex digest.
    pub fn from_hex(hex: &str) -> Option<Self> {
        u64::from_str_radix(hex, 16).ok().map(Fnv1a)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        let mut h = self.0;
        for &b in bytes {
            h = (h ^ b as u64).wrapping_mul(PRIME);
        }
        self.0 = h;
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

const CHUNK: usize = 64 * 1024;

/// Digest a byte slice in one pass.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut h = Fnv1a::new();
    h.update(bytes);
    h.to_hex()
}

/// Stream the whole file through the accumulator without loading it
/// entirely into memory.
pub fn digest_file(path: &std::path::Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut h = Fnv1a::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.to_hex())
}
