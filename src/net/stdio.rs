//! Line-delimited JSON-RPC over stdin/stdout.
//!
//! # Responsibilities
//! - Read one JSON-RPC message per line
//! - Dispatch every request concurrently; responses may leave out of order
//! - Serialize all output through a single writer task
//!
//! # Design Decisions
//! - EOF on the input means the client is gone: in-flight work is cancelled
//! - Blank lines are ignored

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::protocol::{parse_message, JsonRpcResponse};

pub struct StdioFront {
    dispatcher: Dispatcher,
}

impl StdioFront {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Serve the process's own stdin and stdout.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout(), shutdown).await
    }

    /// Serve an arbitrary reader/writer pair until EOF or shutdown.
    pub async fn serve<R, W>(
        self,
        reader: R,
        writer: W,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tracing::info!("Stdio front starting");

        let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();

        let read_result = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parse_message(line.as_bytes()) {
                            Ok(request) => {
                                let dispatcher = self.dispatcher.clone();
                                let token = cancel.child_token();
                                let tx = tx.clone();
                                tasks.spawn(async move {
                                    if let Some(response) = dispatcher.handle(request, &token).await {
                                        let _ = tx.send(response);
                                    }
                                });
                            }
                            Err(response) => {
                                tracing::debug!("Rejected malformed JSON-RPC line");
                                let _ = tx.send(response);
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!(in_flight = tasks.len(), "Stdin closed, cancelling in-flight requests");
                        break Ok(());
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read stdin");
                        break Err(e);
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.recv() => {
                    tracing::info!("Stdio front received shutdown signal");
                    break Ok(());
                }
            }
        };

        cancel.cancel();
        while tasks.join_next().await.is_some() {}
        drop(tx);

        match writer_task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "Stdout writer stopped early"),
            Err(e) => tracing::error!(error = %e, "Stdout writer task failed"),
            Ok(Ok(())) => {}
        }
        tracing::info!("Stdio front stopped");
        read_result
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
