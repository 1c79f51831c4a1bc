//! Pull-based decoder for the inline segment framing.

use std::collections::VecDeque;
use std::io::{self, Read};

use flate2::read::MultiGzDecoder;
use tracing::{debug, trace, warn};

use super::{DEFAULT_CHUNK_SIZE, LENGTH_FIELD_SIZE, SENTINEL};

/// Condition that ends a decoder for good.
#[derive(Debug, Clone)]
enum Terminal {
    /// Underlying source reported end of stream.
    Eof,
    /// A read or framing failure, replayed on every later read.
    Failed(io::ErrorKind, String),
}

impl Terminal {
    fn from_error(e: &io::Error) -> Self {
        Terminal::Failed(e.kind(), e.to_string())
    }
}

/// Decodes a byte stream that mixes literal bytes with gzip segments.
///
/// Each underlying pull reads one chunk and walks it left to right. Literal
/// spans are copied to the residual buffer; a [`SENTINEL`] starts a segment
/// whose length field and body are completed from further pulls when the
/// chunk runs out. Decoded segments are appended whole, so consumers never
/// see half a segment followed by the next literal span.
///
/// Once the source ends or a framing error occurs, that condition is sticky:
/// after the residual buffer drains, every read reports it again without
/// touching the source.
///
/// Not meant for concurrent use; one pump owns one decoder.
pub struct FrameDecoder<R: Read> {
    inner: R,
    residual: VecDeque<u8>,
    terminal: Option<Terminal>,
    chunk: Vec<u8>,
}

impl<R: Read> FrameDecoder<R> {
    /// Create a decoder over `inner` with the default chunk size.
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE)
    }

    /// Create a decoder that pulls at most `size` bytes per underlying read.
    pub fn with_chunk_size(inner: R, size: usize) -> Self {
        Self {
            inner,
            residual: VecDeque::new(),
            terminal: None,
            chunk: vec![0u8; size.max(1)],
        }
    }

    fn replay_terminal(&self) -> io::Result<usize> {
        match &self.terminal {
            Some(Terminal::Failed(kind, msg)) => Err(io::Error::new(*kind, msg.clone())),
            _ => Ok(0),
        }
    }

    /// Pull one chunk from the source and decode it into the residual buffer.
    fn fill(&mut self) {
        let mut chunk = std::mem::take(&mut self.chunk);
        let result = self.pull_chunk(&mut chunk);
        self.chunk = chunk;

        if let Err(terminal) = result {
            self.terminal = Some(terminal);
        }
    }

    fn pull_chunk(&mut self, chunk: &mut [u8]) -> Result<(), Terminal> {
        let n = loop {
            match self.inner.read(chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Terminal::from_error(&e)),
            }
        };
        if n == 0 {
            debug!("frame decoder: source reached EOF");
            return Err(Terminal::Eof);
        }
        trace!("frame decoder: pulled {} bytes", n);

        let chunk = &chunk[..n];
        let mut idx = 0;
        while idx < chunk.len() {
            let rest = &chunk[idx..];
            match rest.iter().position(|&b| b == SENTINEL) {
                None => {
                    self.residual.extend(rest);
                    break;
                }
                Some(offset) => {
                    self.residual.extend(&rest[..offset]);
                    idx += offset + 1;
                    idx += self
                        .read_segment(&chunk[idx..])
                        .map_err(|e| Terminal::from_error(&e))?;
                }
            }
        }
        Ok(())
    }

    /// Read one segment whose bytes start in `available`, pulling from the
    /// source for whatever the chunk does not hold. Returns how many bytes of
    /// `available` were consumed.
    fn read_segment(&mut self, available: &[u8]) -> io::Result<usize> {
        let mut header = [0u8; LENGTH_FIELD_SIZE];
        let from_chunk = available.len().min(LENGTH_FIELD_SIZE);
        header[..from_chunk].copy_from_slice(&available[..from_chunk]);
        self.inner
            .read_exact(&mut header[from_chunk..])
            .map_err(|e| framing_error(e, "segment length"))?;
        let mut consumed = from_chunk;

        let length = u32::from_le_bytes(header) as usize;
        let available = &available[consumed..];
        let from_chunk = available.len().min(length);
        let mut block = Vec::with_capacity(from_chunk);
        block.extend_from_slice(&available[..from_chunk]);
        consumed += from_chunk;

        let missing = (length - from_chunk) as u64;
        if missing > 0 {
            let got = (&mut self.inner)
                .take(missing)
                .read_to_end(&mut block)
                .map_err(|e| framing_error(e, "segment body"))?;
            if (got as u64) < missing {
                return Err(framing_error(
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                    "segment body",
                ));
            }
        }

        let decoded = decompress_segment(&block);
        trace!(
            "frame decoder: segment of {} bytes decoded to {} bytes",
            length,
            decoded.len()
        );
        self.residual.extend(decoded);
        Ok(consumed)
    }
}

impl<R: Read> Read for FrameDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // A chunk may decode to nothing (an empty segment), so keep pulling
        // until there is output or the stream is finished.
        while self.residual.is_empty() {
            if self.terminal.is_some() {
                return self.replay_terminal();
            }
            self.fill();
        }

        let n = buf.len().min(self.residual.len());
        for (dst, src) in buf.iter_mut().zip(self.residual.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

fn framing_error(e: io::Error, part: &str) -> io::Error {
    io::Error::new(e.kind(), format!("truncated {}: {}", part, e))
}

/// Inflate one gzip block, including every concatenated member in it.
///
/// A block cut short still yields what was inflated before the cut. Any
/// other failure drops the block.
pub fn decompress_segment(block: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    match MultiGzDecoder::new(block).read_to_end(&mut out) {
        Ok(_) => out,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => out,
        Err(e) => {
            warn!("frame decoder: dropping undecodable segment: {}", e);
            Vec::new()
        }
    }
}
