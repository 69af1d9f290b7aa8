//! Line-Delimited JSON Transport
//!
//! One JSON value per `\n`-terminated line in both directions.
//!
//! Writes go through a single async mutex: a frame is serialized outside the lock,
//! then written and flushed while holding it, so concurrent producers (responses,
//! batch notifications from many queries) never interleave partial lines.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialize a message as one compact line, including the trailing newline
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Shared, cloneable handle to the output stream
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self { inner: Arc::new(Mutex::new(Box::new(writer))) }
    }

    /// Writer over the process stdout
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Write one message as a single line
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let frame = encode_frame(message)?;
        let mut out = self.inner.lock().await;
        out.write_all(&frame).await?;
        out.flush().await?;
        Ok(())
    }

    /// Write one message unless `cancel` has fired
    ///
    /// The token is checked while the output lock is held, so nothing is written after
    /// a cancel acknowledgment that was itself written through this writer.
    /// Returns whether the frame was written.
    pub async fn send_unless_cancelled<T: Serialize>(
        &self,
        cancel: &CancellationToken,
        message: &T,
    ) -> Result<bool> {
        let frame = encode_frame(message)?;
        let mut out = self.inner.lock().await;
        if cancel.is_cancelled() {
            return Ok(false);
        }
        out.write_all(&frame).await?;
        out.flush().await?;
        Ok(true)
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

/// One decoded input line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A JSON value that may be a request
    Message(Value),
    /// A log record that ended up on the channel
    Diagnostic(Value),
    /// Invalid UTF-8 or invalid JSON
    Malformed { line: String, error: String },
}

/// Classify a parsed line as a message or a log record
///
/// Log records are objects with `level`, `msg` or `time` and none of `id`, `result`, `error`.
#[must_use]
pub fn classify(value: Value) -> Frame {
    let is_log = value.as_object().is_some_and(|obj| {
        let has_log_field = ["level", "msg", "time"].iter().any(|k| obj.contains_key(*k));
        let has_rpc_field = ["id", "result", "error"].iter().any(|k| obj.contains_key(*k));
        has_log_field && !has_rpc_field
    });

    if is_log {
        Frame::Diagnostic(value)
    } else {
        Frame::Message(value)
    }
}

/// Decode a single line (without its newline)
#[must_use]
pub fn decode_line(raw: &[u8]) -> Option<Frame> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            return Some(Frame::Malformed {
                line: String::from_utf8_lossy(raw).into_owned(),
                error: format!("invalid UTF-8: {e}"),
            })
        }
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    Some(match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => classify(value),
        Err(e) => Frame::Malformed { line: trimmed.to_string(), error: e.to_string() },
    })
}

/// Reads frames from a byte stream, skipping blank lines
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { inner: BufReader::new(reader), buf: Vec::with_capacity(4096) }
    }

    /// Next frame, or `None` at end of stream
    ///
    /// A final line without a trailing newline is still decoded.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            self.buf.clear();
            let n = self.inner.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }

            let line = self.buf.strip_suffix(b"\n").unwrap_or(self.buf.as_slice());
            if let Some(frame) = decode_line(line) {
                return Ok(Some(frame));
            }
        }
    }
}
