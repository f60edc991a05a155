use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::error::ApiError;
use crate::progress::ProgressReporter;

/// Validate a client-supplied filename.
///
/// The name must be exactly its own path base: no directory components, no
/// backslashes, not empty. Control characters and double quotes are out too,
/// since accepted names travel inside a quoted `Content-Disposition` header
/// on download. Rejection happens before any backend call.
pub fn sanitize_filename(raw: &str) -> Result<String, ApiError> {
    if raw.is_empty() {
        return Err(ApiError::InvalidInput(
            "filename must not be empty".to_string(),
        ));
    }
    if raw.contains('\\') {
        return Err(ApiError::InvalidInput(format!("invalid filename: {raw}")));
    }
    if raw.chars().any(|c| c.is_control() || c == '"') {
        return Err(ApiError::InvalidInput(format!("invalid filename: {raw}")));
    }
    let base = Path::new(raw).file_name().and_then(|n| n.to_str());
    match base {
        Some(base) if base == raw => Ok(raw.to_string()),
        _ => Err(ApiError::InvalidInput(format!("invalid filename: {raw}"))),
    }
}

/// Wraps an upload body, counting bytes read off the wire.
///
/// Drives progress when a reporter is attached (uploads without a declared
/// size) and enforces the configured size cap mid-stream either way.
pub struct CountingReader<R> {
    inner: R,
    reporter: Option<ProgressReporter>,
    limit: Option<u64>,
    total: u64,
}

impl<R: AsyncRead + Unpin> CountingReader<R> {
    pub fn new(inner: R, reporter: Option<ProgressReporter>, limit: Option<u64>) -> Self {
        Self {
            inner,
            reporter,
            limit,
            total: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.total
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    me.total += n as u64;
                    if let Some(limit) = me.limit
                        && me.total > limit
                    {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("upload exceeds maximum size of {limit} bytes"),
                        )));
                    }
                    if let Some(reporter) = &me.reporter {
                        reporter.tick(me.total);
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// AsyncWrite half of the download pipe.
///
/// Bytes written here surface as response body frames; a dropped response
/// body turns further writes into `BrokenPipe` so the backend read stops
/// promptly.
pub struct ChannelWriter {
    sender: PollSender<Result<Bytes, io::Error>>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self {
            sender: PollSender::new(tx),
        }
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body closed")
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let len = buf.len();
                if self
                    .sender
                    .send_item(Ok(Bytes::copy_from_slice(buf)))
                    .is_err()
                {
                    return Poll::Ready(Err(closed_pipe()));
                }
                Poll::Ready(Ok(len))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}

/// Response body stream for downloads.
///
/// Counts delivered bytes into the transfer's progress reporter and emits
/// the terminal event exactly once: success when the pipe drains cleanly,
/// error when the backend task reported one or the body is dropped before
/// the end of the stream.
pub struct ProgressBody {
    rx: mpsc::Receiver<Result<Bytes, io::Error>>,
    reporter: ProgressReporter,
    sent: u64,
    done: bool,
}

impl ProgressBody {
    pub fn new(rx: mpsc::Receiver<Result<Bytes, io::Error>>, reporter: ProgressReporter) -> Self {
        Self {
            rx,
            reporter,
            sent: 0,
            done: false,
        }
    }
}

impl Stream for ProgressBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        match me.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                me.sent += chunk.len() as u64;
                me.reporter.tick(me.sent);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                me.done = true;
                me.reporter.fail(&err.to_string());
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if !me.done {
                    me.done = true;
                    me.reporter.finish();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProgressBody {
    fn drop(&mut self) {
        if !self.done {
            // Client went away mid-stream; the reporter's terminal guard
            // makes this a no-op when an outcome was already reported.
            self.reporter.fail("client disconnected");
        }
    }
}
