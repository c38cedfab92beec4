//! Line-oriented duplex channel to the peer, usually a child process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::LaunchSpec;
use crate::error::ClientError;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Write side of the connection plus ownership of the peer process.
///
/// Writes are serialized by a lock so two messages never interleave on the
/// wire. The read side is handed out separately as a [`LineReader`] because
/// exactly one task drains it.
pub struct Transport {
    writer: Mutex<LineWriter>,
    child: Mutex<Option<Child>>,
    shutdown_grace: Duration,
}

/// The sink plus whether a line is only partly written to it.
///
/// A `write_line` future dropped mid-write leaves `torn` set; the stream is
/// then unusable because the next line would be glued onto the fragment.
struct LineWriter {
    sink: BoxedWriter,
    torn: bool,
}

impl LineWriter {
    fn new(sink: BoxedWriter) -> Self {
        Self { sink, torn: false }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Start the peer process with piped stdin/stdout.
    ///
    /// stderr is inherited so the peer's diagnostics stay visible. The child
    /// is killed if the transport is dropped without [`Transport::terminate`].
    pub fn spawn(
        spec: &LaunchSpec,
        shutdown_grace: Duration,
    ) -> Result<(Self, LineReader), ClientError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ClientError::transport(format!(
                "failed to spawn {}: {e}",
                spec.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::transport("failed to capture peer stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::transport("failed to capture peer stdout"))?;

        tracing::info!(
            program = %spec.program.display(),
            args = ?spec.args,
            pid = child.id(),
            "peer process spawned"
        );

        let transport = Self {
            writer: Mutex::new(LineWriter::new(Box::new(stdin))),
            child: Mutex::new(Some(child)),
            shutdown_grace,
        };
        Ok((transport, LineReader::new(BufReader::new(stdout))))
    }

    /// Wrap an arbitrary byte stream pair; there is no process to manage.
    pub fn from_stream<R, W>(reader: R, writer: W) -> (Self, LineReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Self {
            writer: Mutex::new(LineWriter::new(Box::new(writer))),
            child: Mutex::new(None),
            shutdown_grace: Duration::ZERO,
        };
        (transport, LineReader::new(BufReader::new(reader)))
    }

    /// Write `line` followed by `\n`, then flush.
    ///
    /// Fails without writing once an earlier call was cancelled or failed
    /// part way through its line.
    pub async fn write_line(&self, line: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        if writer.torn {
            return Err(ClientError::transport(
                "an earlier write was interrupted mid-line",
            ));
        }

        writer.torn = true;
        writer
            .sink
            .write_all(line)
            .await
            .map_err(|e| ClientError::transport(format!("write failed: {e}")))?;
        writer
            .sink
            .write_all(b"\n")
            .await
            .map_err(|e| ClientError::transport(format!("write failed: {e}")))?;
        writer
            .sink
            .flush()
            .await
            .map_err(|e| ClientError::transport(format!("flush failed: {e}")))?;
        writer.torn = false;
        Ok(())
    }

    /// Ask the peer to stop, then kill it if it outlives the grace period.
    ///
    /// Closing stdin is the graceful request: stdio servers exit on EOF.
    /// Safe to call more than once; later calls just report the exit status.
    pub async fn terminate(&self) -> Result<Option<ExitStatus>, ClientError> {
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.sink.shutdown().await {
                tracing::debug!(error = %e, "closing peer stdin failed");
            }
            writer.sink = Box::new(tokio::io::sink());
        }

        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(None);
        };

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?status, "peer exited after stdin close");
                return Ok(Some(status));
            }
            Ok(Err(e)) => {
                return Err(ClientError::transport(format!("wait failed: {e}")));
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "peer did not exit within grace period, killing"
                );
            }
        }

        if let Err(e) = child.start_kill() {
            tracing::warn!(error = %e, "kill failed");
        }
        let status = child
            .wait()
            .await
            .map_err(|e| ClientError::transport(format!("wait failed: {e}")))?;
        tracing::info!(?status, "peer killed");
        Ok(Some(status))
    }

    /// Wait for the peer process to exit. `None` when there is no process.
    pub async fn wait(&self) -> Result<Option<ExitStatus>, ClientError> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => child
                .wait()
                .await
                .map(Some)
                .map_err(|e| ClientError::transport(format!("wait failed: {e}"))),
            None => Ok(None),
        }
    }
}

/// Read side of the connection, yielding one line at a time.
pub struct LineReader {
    inner: BoxedReader,
    buf: Vec<u8>,
}

impl std::fmt::Debug for LineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineReader").finish_non_exhaustive()
    }
}

impl LineReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    ///
    /// A final line with no trailing newline is still returned.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        self.buf.clear();
        let n = self
            .inner
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| ClientError::transport(format!("read failed: {e}")))?;
        if n == 0 {
            return Ok(None);
        }

        let mut end = self.buf.len();
        while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        Ok(Some(self.buf[..end].to_vec()))
    }
}
