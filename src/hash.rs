//! Fingerprint computation (C1).
//!
//! Chunks, files and the chunk-format itself are all identified by a
//! 256-bit digest rendered as 64 lowercase hex characters, computed with
//! SHA-256 (`openssl::sha::Sha256`).

use std::fmt;
use std::io::Read;

use openssl::sha::Sha256;

use crate::error::Result;

pub const FINGERPRINT_SIZE: usize = 32;

/// A 256-bit content fingerprint, lexicographically ordered over its hex
/// encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Parse the 64-character lowercase hex encoding used on disk and in
    /// every API surface.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != FINGERPRINT_SIZE * 2 {
            return Err(crate::error::Error::invalid_input(format!(
                "fingerprint must be {} hex chars, got {}",
                FINGERPRINT_SIZE * 2,
                hex.len()
            )));
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let s = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(s, 16)
                .map_err(|_| crate::error::Error::invalid_input(format!("bad hex in fingerprint: {}", s)))?;
        }
        Ok(Fingerprint(bytes))
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(FINGERPRINT_SIZE * 2);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// First byte of the hex encoding, used as the shard directory name in
    /// `ChunkStore`'s physical layout.
    pub fn shard_prefix(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    pub fn rest_of_hex(&self) -> String {
        let mut s = String::with_capacity((FINGERPRINT_SIZE - 1) * 2);
        for b in &self.0[1..] {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Compute the fingerprint of a single in-memory buffer.
pub fn hash_buffer(data: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Fingerprint(hasher.finish())
}

/// Incrementally hash a byte stream, yielding one final fingerprint.
/// Feeding the same bytes through any blocking does not change the
/// result - the hasher never re-frames its input.
pub struct StreamHasher {
    inner: Sha256,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self { inner: Sha256::new() }
    }

    pub fn update(&mut self, block: &[u8]) {
        self.inner.update(block);
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.inner.finish())
    }

    /// Convenience: hash everything a `Read` yields.
    pub fn hash_reader<R: Read>(mut reader: R) -> Result<Fingerprint> {
        let mut hasher = StreamHasher::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Read` wrapper that accumulates a running fingerprint of everything
/// read through it.
pub struct HashingReader<R> {
    reader: R,
    hasher: StreamHasher,
}

impl<R: Read> HashingReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, hasher: StreamHasher::new() }
    }

    pub fn finish(self) -> (R, Fingerprint) {
        (self.reader, self.hasher.finish())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.reader.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}
