//! Content-defined chunking (C2).
//!
//! Splits a byte stream into variable-length chunks at boundaries chosen
//! by a rolling buzhash over a fixed window, so local edits only perturb
//! nearby chunks (shift resilience): unlike a hash that resets at every
//! chunk boundary, the window here slides continuously across the whole
//! stream, so the hash value at a given byte of *content* does not depend
//! on where the previous cut happened to land. The cut rule follows the
//! FastCDC family: scan forward past `min_size` for the first position
//! where the rolling hash matches a mask tuned for `avg_size`; force a
//! cut at `max_size` if none is found.

use std::io::Read;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Lower bound, target average, and upper bound for emitted chunk sizes.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerParams {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

impl ChunkerParams {
    pub const HARD_MAX: usize = 256 * 1024 * 1024;

    pub fn new(min_size: usize, avg_size: usize, max_size: usize) -> Result<Self> {
        if !(min_size <= avg_size && avg_size <= max_size) {
            return Err(Error::invalid_input(
                "chunker params must satisfy min_size <= avg_size <= max_size",
            ));
        }
        if max_size > Self::HARD_MAX {
            return Err(Error::invalid_input(format!(
                "max_size {} exceeds hard limit {}",
                max_size,
                Self::HARD_MAX
            )));
        }
        if min_size == 0 {
            return Err(Error::invalid_input("min_size must be >= 1"));
        }
        Ok(Self { min_size, avg_size, max_size })
    }

    /// A mask whose popcount is chosen so that, for random data, a cut is
    /// expected roughly every `avg_size` bytes.
    fn mask(&self) -> u64 {
        let bits = (self.avg_size as u64).max(2).trailing_zeros().min(31);
        (1u64 << bits) - 1
    }
}

impl Default for ChunkerParams {
    /// Defaults from the configuration table: 16 KiB / 64 KiB / 4 MiB.
    fn default() -> Self {
        Self { min_size: 16 * 1024, avg_size: 64 * 1024, max_size: 4 * 1024 * 1024 }
    }
}

const GEAR_TABLE_SIZE: usize = 256;
const WINDOW_SIZE: usize = 48;

static GEAR: Lazy<[u64; GEAR_TABLE_SIZE]> = Lazy::new(build_gear_table);

/// Deterministically derive a 256-entry table using a small splitmix64
/// generator. The table is fixed for the life of the process (and across
/// processes, since splitmix64 is seeded with a constant), which is
/// required for P1/determinism: the same bytes must always cut at the
/// same offsets.
fn build_gear_table() -> [u64; GEAR_TABLE_SIZE] {
    let mut table = [0u64; GEAR_TABLE_SIZE];
    let mut state: u64 = 0x9E3779B97F4A7C15;
    for slot in table.iter_mut() {
        state = state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;
        *slot = z;
    }
    table
}

/// A single content-defined chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub offset: u64,
    pub length: usize,
    pub data: Vec<u8>,
}

/// Splits a `Read` stream into a finite, lazy sequence of `ChunkSpan`.
/// Single-pass, not restartable, as required by §4.2.
pub struct Chunker<R: Read> {
    reader: R,
    params: ChunkerParams,
    read_buf: Box<[u8]>,
    read_pos: usize,
    read_len: usize,
    eof: bool,

    window: [u8; WINDOW_SIZE],
    window_pos: usize,
    window_len: usize,
    hash: u64,

    current: Vec<u8>,
    bytes_since_cut: usize,
    chunk_start: u64,

    cancel: Option<Box<dyn Fn() -> bool + Send>>,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, params: ChunkerParams) -> Self {
        Self {
            reader,
            params,
            read_buf: vec![0u8; 64 * 1024].into_boxed_slice(),
            read_pos: 0,
            read_len: 0,
            eof: false,
            window: [0u8; WINDOW_SIZE],
            window_pos: 0,
            window_len: 0,
            hash: 0,
            current: Vec::new(),
            bytes_since_cut: 0,
            chunk_start: 0,
            cancel: None,
        }
    }

    /// Install a cooperative cancellation check, polled between chunk
    /// emissions per §4.2's failure contract.
    pub fn with_cancel(mut self, cancel: impl Fn() -> bool + Send + 'static) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }

    fn refill(&mut self) -> Result<()> {
        loop {
            match self.reader.read(&mut self.read_buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.read_pos = 0;
                    self.read_len = n;
                    return Ok(());
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn roll(&mut self, byte: u8) {
        if self.window_len < WINDOW_SIZE {
            self.hash = self.hash.rotate_left(1) ^ GEAR[byte as usize];
            self.window[self.window_pos] = byte;
            self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;
            self.window_len += 1;
        } else {
            let outgoing = self.window[self.window_pos];
            self.hash = self.hash.rotate_left(1)
                ^ GEAR[byte as usize]
                ^ GEAR[outgoing as usize].rotate_left(WINDOW_SIZE as u32);
            self.window[self.window_pos] = byte;
            self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;
        }
    }

    fn next_span(&mut self) -> Result<Option<ChunkSpan>> {
        if let Some(cancel) = &self.cancel {
            if cancel() {
                return Err(Error::Cancelled);
            }
        }

        let mask = self.params.mask();

        loop {
            if self.read_pos >= self.read_len {
                if self.eof {
                    break;
                }
                self.refill()?;
                continue;
            }

            let byte = self.read_buf[self.read_pos];
            self.read_pos += 1;

            self.current.push(byte);
            self.bytes_since_cut += 1;
            self.roll(byte);

            if self.bytes_since_cut >= self.params.min_size && (self.hash & mask) == 0 {
                break;
            }
            if self.bytes_since_cut >= self.params.max_size {
                break;
            }
        }

        if self.current.is_empty() {
            return Ok(None);
        }

        let data = std::mem::take(&mut self.current);
        let length = data.len();
        let offset = self.chunk_start;
        self.chunk_start += length as u64;
        self.bytes_since_cut = 0;

        Ok(Some(ChunkSpan { offset, length, data }))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<ChunkSpan>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_span() {
            Ok(Some(span)) => Some(Ok(span)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_buffer;
    use std::collections::HashSet;
    use std::io::Cursor;

    fn small_params() -> ChunkerParams {
        ChunkerParams::new(256, 1024, 4096).unwrap()
    }

    fn chunk_all(data: Vec<u8>, params: ChunkerParams) -> Vec<ChunkSpan> {
        Chunker::new(Cursor::new(data), params).collect::<Result<Vec<_>>>().unwrap()
    }

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(ChunkerParams::new(100, 50, 200).is_err());
        assert!(ChunkerParams::new(100, 200, 150).is_err());
        assert!(ChunkerParams::new(0, 200, 300).is_err());
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let spans = chunk_all(Vec::new(), ChunkerParams::default());
        assert!(spans.is_empty());
    }

    #[test]
    fn small_file_is_single_chunk() {
        // Scenario 2: 256 bytes [0x00..0xFF], defaults (min=16KiB) -> one chunk.
        let data: Vec<u8> = (0..=255u8).collect();
        let spans = chunk_all(data.clone(), ChunkerParams::default());
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].data, data);
        assert_eq!(spans[0].offset, 0);
    }

    #[test]
    fn offsets_are_contiguous() {
        let data = pseudo_random(100_000, 1);
        let spans = chunk_all(data, small_params());
        let mut expected = 0u64;
        for span in &spans {
            assert_eq!(span.offset, expected);
            expected += span.length as u64;
        }
    }

    #[test]
    fn bounds_hold_except_last_chunk() {
        // P5
        let data = pseudo_random(800_000, 2);
        let params = small_params();
        let spans = chunk_all(data, params);
        assert!(!spans.is_empty());
        let last = spans.len() - 1;
        for (i, span) in spans.iter().enumerate() {
            assert!(span.length <= params.max_size);
            if i != last {
                assert!(span.length >= params.min_size);
            }
        }
    }

    #[test]
    fn determinism() {
        let data = pseudo_random(500_000, 3);
        let params = small_params();
        let a = chunk_all(data.clone(), params);
        let b = chunk_all(data, params);
        assert_eq!(a, b);
    }

    #[test]
    fn dedup_unaffected_by_repeated_backup() {
        // P3: hashing the same file twice yields the same chunk fingerprints.
        let data = pseudo_random(300_000, 4);
        let params = small_params();
        let a = chunk_all(data.clone(), params);
        let b = chunk_all(data, params);
        let fps_a: HashSet<_> = a.iter().map(|c| hash_buffer(&c.data)).collect();
        let fps_b: HashSet<_> = b.iter().map(|c| hash_buffer(&c.data)).collect();
        assert_eq!(fps_a, fps_b);
    }

    #[test]
    fn shift_resilience() {
        // P4: prepending k < min_size bytes only perturbs a small number
        // of leading chunks; the rest dedup against the unshifted file.
        let params = small_params();
        let data = pseudo_random(600_000, 5);

        let original = chunk_all(data.clone(), params);
        let mut shifted_data = vec![1u8; 10];
        shifted_data.extend_from_slice(&data);
        let shifted = chunk_all(shifted_data, params);

        let orig_fps: HashSet<_> = original.iter().map(|c| hash_buffer(&c.data)).collect();
        let shifted_fps: HashSet<_> = shifted.iter().map(|c| hash_buffer(&c.data)).collect();

        let overlap = orig_fps.intersection(&shifted_fps).count();
        let smaller = orig_fps.len().min(shifted_fps.len());
        assert!(
            overlap as f64 >= 0.7 * smaller as f64,
            "expected most chunks to survive a small prefix shift: overlap={} smaller={}",
            overlap,
            smaller
        );
    }

    #[test]
    fn cancellation_is_observed() {
        let data = pseudo_random(100_000, 6);
        let mut chunker = Chunker::new(Cursor::new(data), small_params()).with_cancel(|| true);
        match chunker.next() {
            Some(Err(Error::Cancelled)) => {}
            other => panic!("expected Cancelled, got {:?}", other.map(|r| r.is_ok())),
        }
    }
}
