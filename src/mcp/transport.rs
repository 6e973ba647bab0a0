//! Line-delimited stdio transport for the upstream client boundary.
//!
//! Standard input is read one line at a time; standard output is owned by a
//! single writer task fed through a bounded queue, so every emission is one
//! whole JSON object followed by `\n` and writes are totally ordered.
//!
//! The queue being bounded is what gives the gateway its backpressure
//! behaviour: producers pause when the client stops reading, and the
//! dispatcher treats a queue that cannot drain within
//! [`BACKPRESSURE_TIMEOUT`] as fatal.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FatalError;
use crate::mcp::protocol::{JsonRpcError, JsonRpcNotification, JsonRpcResponse};

/// Capacity of the outbound write queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// How long the dispatcher waits for queue space before declaring the
/// client misbehaving.
pub const BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered reader over the gateway's standard input.
pub struct StdinReader {
    reader: BufReader<Stdin>,
}

impl StdinReader {
    /// Creates a reader over standard input.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
        }
    }

    /// Reads the next line, or `None` at end of input.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the dispatcher treats it as fatal.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

impl Default for StdinReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle that enqueues outbound messages for the writer task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Value>,
}

impl Outbound {
    /// Enqueues a response, logging if the writer is gone.
    pub async fn response(&self, response: &JsonRpcResponse) {
        self.enqueue_value(to_value(response)).await;
    }

    /// Enqueues an error reply, logging if the writer is gone.
    pub async fn error(&self, error: &JsonRpcError) {
        self.enqueue_value(to_value(error)).await;
    }

    /// Enqueues a notification, logging if the writer is gone.
    pub async fn notification(&self, notification: &JsonRpcNotification) {
        self.enqueue_value(to_value(notification)).await;
    }

    /// Enqueues an already-assembled JSON object (verbatim downstream
    /// notification relay).
    pub async fn raw(&self, value: Value) {
        self.enqueue_value(Some(value)).await;
    }

    /// Enqueues a response from the dispatcher's read loop.
    ///
    /// Unlike the best-effort senders this escalates: a full queue pauses
    /// the caller, and a queue that cannot drain within
    /// [`BACKPRESSURE_TIMEOUT`] is a fatal condition.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::Backpressure`] when the queue never drained,
    /// or [`FatalError::StdIo`] when the writer task is gone.
    pub async fn response_or_fatal(&self, response: &JsonRpcResponse) -> Result<(), FatalError> {
        self.enqueue_or_fatal(to_value(response)).await
    }

    /// Fatal-escalating variant of [`Self::error`].
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::response_or_fatal`].
    pub async fn error_or_fatal(&self, error: &JsonRpcError) -> Result<(), FatalError> {
        self.enqueue_or_fatal(to_value(error)).await
    }

    async fn enqueue_value(&self, value: Option<Value>) {
        let Some(value) = value else { return };
        if self.tx.send(value).await.is_err() {
            debug!("Outbound writer is gone; dropping message");
        }
    }

    async fn enqueue_or_fatal(&self, value: Option<Value>) -> Result<(), FatalError> {
        let Some(value) = value else { return Ok(()) };
        match self.tx.send_timeout(value, BACKPRESSURE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(FatalError::Backpressure),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(FatalError::StdIo(
                std::io::Error::other("stdout writer task is gone"),
            )),
        }
    }
}

fn to_value<T: serde::Serialize>(message: &T) -> Option<Value> {
    match serde_json::to_value(message) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "Failed to serialise outbound message");
            None
        }
    }
}

/// Spawns the single stdout writer task.
///
/// Returns the enqueue handle and the task's join handle; the task resolves
/// with a [`FatalError`] if standard output fails.
#[must_use]
pub fn spawn_writer() -> (Outbound, JoinHandle<Result<(), FatalError>>) {
    spawn_writer_to(tokio::io::stdout())
}

/// Spawns the writer task over an arbitrary sink. Tests capture output by
/// passing their own writer.
pub fn spawn_writer_to<W>(writer: W) -> (Outbound, JoinHandle<Result<(), FatalError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(value) = rx.recv().await {
            let line = value.to_string();
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(FatalError::StdIo)?;
            writer.write_all(b"\n").await.map_err(FatalError::StdIo)?;
            writer.flush().await.map_err(FatalError::StdIo)?;
        }
        Ok(())
    });
    (Outbound { tx }, handle)
}
