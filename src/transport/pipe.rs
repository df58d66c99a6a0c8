//! Subprocess transport: line-delimited JSON-RPC over stdin/stdout.
//!
//! Lines are capped at [`MAX_RESPONSE_BYTES`] like buffered HTTP bodies; a
//! longer line kills the connection since the reader is left mid-line.

use std::io;
use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::load_balancer::backend::BackendDescriptor;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{match_response, TransportError, MAX_RESPONSE_BYTES};

#[derive(Debug)]
pub struct PipeConnection {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    max_line: usize,
    alive: bool,
}

/// Read one newline-terminated line of at most `max` bytes, terminator
/// excluded. `Ok(None)` at end of stream.
async fn read_line_bounded<R>(reader: &mut R, max: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", max),
        ));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl PipeConnection {
    /// Spawn the backend process. It is killed when the connection is dropped.
    pub fn spawn(descriptor: &BackendDescriptor) -> Result<Self, TransportError> {
        let mut child = Command::new(&descriptor.endpoint)
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connect(format!("spawn '{}': {}", descriptor.endpoint, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connect("child stdout unavailable".into()))?;

        tracing::debug!(backend = %descriptor.id, pid = ?child.id(), "Spawned stdio backend");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            max_line: MAX_RESPONSE_BYTES,
            alive: true,
        })
    }

    pub async fn send(&mut self, request: &JsonRpcRequest, id: &Value) -> Result<JsonRpcResponse, TransportError> {
        self.write_line(request).await?;
        loop {
            let line = match read_line_bounded(&mut self.stdout, self.max_line).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.alive = false;
                    return Err(TransportError::Closed);
                }
                Err(e) => {
                    self.alive = false;
                    return Err(TransportError::Io(e));
                }
            };
            if let Some(response) = match_response(&line, id) {
                return Ok(response);
            }
            tracing::trace!(line = %line, "Skipping unrelated backend output");
        }
    }

    pub async fn notify(&mut self, notification: &JsonRpcRequest) -> Result<(), TransportError> {
        self.write_line(notification).await
    }

    pub fn is_alive(&mut self) -> bool {
        self.alive && matches!(self.child.try_wait(), Ok(None))
    }

    async fn write_line(&mut self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push('\n');
        let written = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            self.alive = false;
            return Err(TransportError::Io(e));
        }
        Ok(())
    }
}
