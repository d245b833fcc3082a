//! Output stream wiring shared by both backends
//!
//! Each of stdout and stderr goes to exactly one target: discarded, copied into
//! a caller-supplied writer, or into the write half of an in-memory pipe whose
//! read half was handed to the caller.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RunnerError;

/// Caller-supplied output sink
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bytes buffered in an output pipe before the producer waits for the reader
pub const PIPE_CAPACITY: usize = 64 * 1024;

const CHUNK_SIZE: usize = 8 * 1024;

/// In-memory sink whose contents stay readable after it is handed to a runner
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Contents decoded as UTF-8, lossily
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Boxed writer sharing this buffer
    #[must_use]
    pub fn writer(&self) -> BoxedWriter {
        Box::new(self.clone())
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut inner = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        inner.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Where one output stream goes
#[derive(Default)]
pub(crate) enum OutputTarget {
    #[default]
    Discard,
    Writer(BoxedWriter),
    Pipe(DuplexStream),
}

impl std::fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputTarget::Discard => f.write_str("Discard"),
            OutputTarget::Writer(_) => f.write_str("Writer"),
            OutputTarget::Pipe(_) => f.write_str("Pipe"),
        }
    }
}

impl OutputTarget {
    /// Route this stream into a new pipe and return its read half
    pub(crate) fn pipe(&mut self, stream: &str) -> Result<DuplexStream, RunnerError> {
        match self {
            OutputTarget::Discard => {
                let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
                *self = OutputTarget::Pipe(writer);
                Ok(reader)
            }
            OutputTarget::Pipe(_) => Err(RunnerError::PipeSetup(format!(
                "{stream} pipe already taken"
            ))),
            OutputTarget::Writer(_) => Err(RunnerError::PipeSetup(format!(
                "{stream} already has a writer"
            ))),
        }
    }

    pub(crate) fn is_pipe(&self) -> bool {
        matches!(self, OutputTarget::Pipe(_))
    }

    /// Write one chunk; a failing sink is dropped so the producer keeps draining
    pub(crate) async fn write_chunk(&mut self, data: &[u8]) {
        let result = match self {
            OutputTarget::Discard => return,
            OutputTarget::Writer(writer) => writer.write_all(data).await,
            OutputTarget::Pipe(pipe) => pipe.write_all(data).await,
        };

        if let Err(e) = result {
            debug!(error = %e, "output sink closed, discarding remaining output");
            *self = OutputTarget::Discard;
        }
    }

    /// Flush and shut the sink down so pipe readers see EOF
    pub(crate) async fn finish(&mut self) {
        let result = match std::mem::take(self) {
            OutputTarget::Discard => return,
            OutputTarget::Writer(mut writer) => writer.shutdown().await,
            OutputTarget::Pipe(mut pipe) => pipe.shutdown().await,
        };

        if let Err(e) = result {
            debug!(error = %e, "failed to shut down output sink");
        }
    }
}

/// Copy `reader` into `target` until EOF or cancellation, then finish the target
pub(crate) async fn pump<R>(
    mut reader: R,
    mut target: OutputTarget,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];

    let result = loop {
        let n = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            () = target.write_chunk(&buf[..n]) => {}
        }
    };

    target.finish().await;
    result
}
