//! Sender side of the inline segment framing.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::SENTINEL;

/// Default size at which a burst is worth compressing.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 256;

/// Produces framed output: short bursts stay literal, long or
/// sentinel-carrying bursts become gzip segments.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    threshold: usize,
    level: Compression,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPRESS_THRESHOLD,
            level: Compression::fast(),
        }
    }
}

impl FrameEncoder {
    /// Create an encoder that compresses bursts of at least `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Set the gzip level (0-9).
    pub fn level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    /// Frame one burst.
    ///
    /// Literal output is only possible when the burst has no sentinel byte.
    pub fn encode(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        if data.len() < self.threshold && !data.contains(&SENTINEL) {
            return Ok(data.to_vec());
        }
        self.compress_segment(data)
    }

    /// Frame a burst as a compressed segment regardless of size.
    pub fn compress_segment(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data)?;
        let block = encoder.finish()?;

        let length = u32::try_from(block.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "compressed segment exceeds u32 length field",
            )
        })?;

        let mut framed = Vec::with_capacity(1 + 4 + block.len());
        framed.push(SENTINEL);
        framed.extend_from_slice(&length.to_le_bytes());
        framed.extend_from_slice(&block);
        Ok(framed)
    }
}
