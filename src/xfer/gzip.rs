//! Gzip transfer filter, id `b'g'`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::TransferFilter;

/// Gzip compression filter.
///
/// Encoders and decoders are constructed per call; the output buffer is
/// pre-sized from the source length to keep reallocation off the hot path.
pub struct Gzip {
    id: u8,
    level: Compression,
}

impl Gzip {
    /// Create a gzip filter at the given compression level (0-9).
    ///
    /// # Panics
    ///
    /// Panics on a level outside 0..=9.
    pub fn new(level: u32) -> Self {
        assert!(level <= 9, "gzip: invalid compression level: {}", level);
        Self {
            id: b'g',
            level: Compression::new(level),
        }
    }
}

impl TransferFilter for Gzip {
    fn id(&self) -> u8 {
        self.id
    }

    fn pack(&self, src: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(src.len() / 2 + 64), self.level);
        encoder.write_all(src)?;
        encoder.finish()
    }

    fn unpack(&self, src: &[u8]) -> std::io::Result<Vec<u8>> {
        if src.is_empty() {
            return Ok(Vec::new());
        }
        let mut decoder = GzDecoder::new(src);
        let mut out = Vec::with_capacity(src.len() * 2);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}
