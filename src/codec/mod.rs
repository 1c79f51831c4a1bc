//! Inline compression framing for engine output.
//!
//! The remote side interleaves literal bytes with self-delimited gzip
//! segments:
//!
//! ```text
//! literal-bytes* | (0xFF length:u32-le gzip-block[length])*
//! ```
//!
//! Short interactive replies stay literal and are delivered as soon as they
//! arrive, while long bursts travel compressed. [`FrameDecoder`] turns such a
//! stream back into plain bytes; [`FrameEncoder`] produces it.
//!
//! # Example
//!
//! ```
//! use std::io::{Cursor, Read};
//! use kata_tunnel::codec::{FrameDecoder, FrameEncoder};
//!
//! let encoder = FrameEncoder::new(8);
//! let mut wire = encoder.encode(b"= \n\n").unwrap();
//! wire.extend(encoder.encode(&b"info move Q16 ".repeat(30)).unwrap());
//!
//! let mut plain = Vec::new();
//! FrameDecoder::new(Cursor::new(wire)).read_to_end(&mut plain).unwrap();
//! assert!(plain.starts_with(b"= \n\ninfo move Q16 "));
//! ```

mod decoder;
mod encoder;

pub use decoder::{decompress_segment, FrameDecoder};
pub use encoder::{FrameEncoder, DEFAULT_COMPRESS_THRESHOLD};

use serde::{Deserialize, Serialize};

/// Byte that opens a compressed segment.
pub const SENTINEL: u8 = 0xFF;

/// Size of the little-endian segment length field.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Bytes pulled from the source per decoder fill.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// How a session interprets the remote command's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Output carries inline segments and is decoded.
    #[default]
    Framed,
    /// Output is passed through untouched.
    Raw,
}

impl OutputMode {
    /// Whether output goes through a [`FrameDecoder`].
    pub fn is_framed(&self) -> bool {
        matches!(self, OutputMode::Framed)
    }
}
