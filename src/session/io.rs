//! Blocking stdio adapters for remote sessions.
//!
//! Callers hand the controller plain `Read`/`Write` endpoints. These adapters
//! move bytes between them and the async channel driver over mpsc queues,
//! running the blocking side on dedicated threads so the tokio runtime is
//! never blocked.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::codec::{FrameDecoder, OutputMode};

/// Chunk size for blocking reads.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Caller-supplied endpoints for one remote command.
pub struct Stdio {
    /// Source forwarded to the remote command's stdin.
    pub stdin: Box<dyn Read + Send>,
    /// Sink receiving decoded stdout.
    pub stdout: Box<dyn Write + Send>,
    /// Sink receiving the remote stderr as is.
    pub stderr: Box<dyn Write + Send>,
}

impl Stdio {
    /// Bundle three endpoints.
    pub fn new(
        stdin: impl Read + Send + 'static,
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// Use the process's own stdin, stdout and stderr.
    pub fn inherit() -> Self {
        Self::new(io::stdin(), io::stdout(), io::stderr())
    }
}

/// Forwards a blocking reader into the channel input queue.
///
/// Runs on its own OS thread rather than the blocking pool: a reader such as
/// the terminal may never return, and the thread must not hold up runtime
/// shutdown. It ends at EOF, on a read error, or once the queue is closed.
pub struct InputForwarder<R: Read + Send + 'static> {
    reader: R,
    tx: mpsc::Sender<Vec<u8>>,
    buffer_size: usize,
}

impl<R: Read + Send + 'static> InputForwarder<R> {
    /// Create a forwarder from `reader` into `tx`.
    pub fn new(reader: R, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            reader,
            tx,
            buffer_size: READ_BUFFER_SIZE,
        }
    }

    /// Start forwarding on a detached thread.
    pub fn spawn(self) -> io::Result<()> {
        thread::Builder::new()
            .name("kata-stdin".into())
            .spawn(move || self.run())
            .map(|_| ())
    }

    fn run(mut self) {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    debug!("stdin forwarder: EOF");
                    break;
                }
                Ok(n) => {
                    trace!("stdin forwarder: read {} bytes", n);
                    if self.tx.blocking_send(buf[..n].to_vec()).is_err() {
                        debug!("stdin forwarder: channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("stdin forwarder error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Writes queued chunks to a blocking writer until the queue closes.
pub struct OutputForwarder<W: Write + Send + 'static> {
    writer: W,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl<W: Write + Send + 'static> OutputForwarder<W> {
    /// Create a forwarder from `rx` into `writer`.
    pub fn new(writer: W, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { writer, rx }
    }

    /// Start the writer loop on the blocking pool.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut writer = self.writer;
        let mut rx = self.rx;

        tokio::task::spawn_blocking(move || {
            while let Some(data) = rx.blocking_recv() {
                trace!("output forwarder: writing {} bytes", data.len());
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        debug!("output forwarder: broken pipe");
                    } else {
                        error!("output forwarder error: {}", e);
                    }
                    break;
                }
            }
            debug!("output forwarder: channel closed");
        })
    }
}

/// Blocking `Read` over the queue of stdout chunks from the channel.
///
/// Reports EOF once the driver drops the sending side, which happens when
/// the channel closes.
pub struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    /// Wrap a chunk receiver.
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Moves channel output to the caller's sink, decoding it when framed.
pub struct OutputPump {
    source: ChannelReader,
    mode: OutputMode,
}

impl OutputPump {
    /// Create a pump over `source`.
    pub fn new(source: ChannelReader, mode: OutputMode) -> Self {
        Self { source, mode }
    }

    /// Start pumping into `sink` on the blocking pool.
    ///
    /// The task ends cleanly at end of stream. Read errors are logged and end
    /// the task; they never fail the command, whose exit status decides the
    /// outcome.
    pub fn spawn<W: Write + Send + 'static>(self, sink: W) -> JoinHandle<()> {
        let mode = self.mode;
        let source = self.source;
        tokio::task::spawn_blocking(move || {
            let reader: Box<dyn Read> = if mode.is_framed() {
                Box::new(FrameDecoder::new(source))
            } else {
                Box::new(source)
            };
            pump(reader, sink)
        })
    }
}

fn pump<R: Read, W: Write>(mut reader: R, mut sink: W) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("output pump: EOF");
                break;
            }
            Ok(n) => {
                if let Err(e) = sink.write_all(&buf[..n]).and_then(|_| sink.flush()) {
                    error!("output pump: failed to write decoded output: {}", e);
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("output pump: failed to read from channel output: {}", e);
                return;
            }
        }
    }
}

/// Cloneable in-memory sink, for collecting command output.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Contents as lossy UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameEncoder;
    use std::io::Cursor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_input_forwarder() {
        let (tx, mut rx) = mpsc::channel(8);
        InputForwarder::new(Cursor::new(b"genmove b\n".to_vec()), tx)
            .spawn()
            .unwrap();

        let mut received = Vec::new();
        while let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await
        {
            received.extend(chunk);
        }
        assert_eq!(received, b"genmove b\n");
    }

    #[tokio::test]
    async fn test_input_forwarder_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        InputForwarder::new(Cursor::new(vec![1u8; 10_000]), tx)
            .spawn()
            .unwrap();
        // Nothing to assert beyond not hanging or panicking.
    }

    #[tokio::test]
    async fn test_output_forwarder() {
        let sink = CaptureBuffer::new();
        let (tx, rx) = mpsc::channel(8);
        let handle = OutputForwarder::new(sink.clone(), rx).spawn();

        tx.send(b"warn: ".to_vec()).await.unwrap();
        tx.send(b"low memory\n".to_vec()).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.contents(), b"warn: low memory\n");
    }

    #[tokio::test]
    async fn test_channel_reader_spans_chunks() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(b"ab".to_vec()).await.unwrap();
        tx.send(Vec::new()).await.unwrap();
        tx.send(b"cde".to_vec()).await.unwrap();
        drop(tx);

        let out = tokio::task::spawn_blocking(move || {
            let mut reader = ChannelReader::new(rx);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        })
        .await
        .unwrap();
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn test_pump_decodes_framed_output() {
        let plain = b"info move C3 visits 7\n".repeat(30);
        let mut wire = b"= \n".to_vec();
        wire.extend(FrameEncoder::default().compress_segment(&plain).unwrap());

        // More chunks than the queue holds: the pump has to be draining
        // while they are sent.
        let (tx, rx) = mpsc::channel(8);
        let sink = CaptureBuffer::new();
        let pump = OutputPump::new(ChannelReader::new(rx), OutputMode::Framed).spawn(sink.clone());
        for piece in wire.chunks(5) {
            tx.send(piece.to_vec()).await.unwrap();
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();

        let mut expected = b"= \n".to_vec();
        expected.extend(plain);
        assert_eq!(sink.contents(), expected);
    }

    #[tokio::test]
    async fn test_pump_raw_mode_passthrough() {
        let wire = vec![b'a', 0xFF, 0x00, b'b'];
        let (tx, rx) = mpsc::channel(8);
        tx.send(wire.clone()).await.unwrap();
        drop(tx);

        let sink = CaptureBuffer::new();
        OutputPump::new(ChannelReader::new(rx), OutputMode::Raw)
            .spawn(sink.clone())
            .await
            .unwrap();
        assert_eq!(sink.contents(), wire);
    }

    #[tokio::test]
    async fn test_pump_stops_on_framing_error() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(vec![b'x', 0xFF, 0x01]).await.unwrap();
        drop(tx);

        let sink = CaptureBuffer::new();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            OutputPump::new(ChannelReader::new(rx), OutputMode::Framed).spawn(sink.clone()),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(sink.contents(), b"x");
    }
}
