// Socket transport between the supervisor and one child
//
// The child inherits one end of a Unix socket pair; both directions carry
// newline-delimited JSON messages.

use crate::error::{Result, SupervisorError};
use crate::ipc::bridge::{send_guarded, ChildChannel, DnsBridge};
use crate::ipc::protocol::{parse_message, ChildMessage, IpcResponse};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// File descriptor number the child finds its end of the socket on
pub const CHILD_IPC_FD: i32 = 3;

/// Environment variable announcing the IPC descriptor to the child
pub const IPC_FD_ENV: &str = "ANALYSIS_IPC_FD";

/// Create the socket pair for a new child: `(supervisor end, child end)`
pub fn socket_pair() -> Result<(StdUnixStream, StdUnixStream)> {
    StdUnixStream::pair()
        .map_err(|e| SupervisorError::IpcError(format!("Failed to create socket pair: {}", e)))
}

/// Supervisor side of a child's IPC socket
pub struct IpcEndpoint {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl IpcEndpoint {
    /// Wrap the supervisor end of the socket pair. Must run inside a tokio runtime.
    pub fn from_std(stream: StdUnixStream) -> Result<Self> {
        stream.set_nonblocking(true).map_err(|e| {
            SupervisorError::IpcError(format!("Failed to configure IPC socket: {}", e))
        })?;
        let stream = UnixStream::from_std(stream)
            .map_err(|e| SupervisorError::IpcError(format!("Failed to register IPC socket: {}", e)))?;
        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer })
    }

    /// Start the reader and writer tasks
    ///
    /// Responses queued on the returned sender are written in order. Each
    /// incoming request is handled on its own task so a slow lookup does not
    /// hold back the others.
    pub fn spawn(
        self,
        analysis_id: String,
        bridge: DnsBridge,
        channel: Arc<dyn ChildChannel>,
        responses: mpsc::UnboundedReceiver<IpcResponse>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let reader = tokio::spawn(read_loop(
            analysis_id.clone(),
            self.reader,
            bridge,
            channel,
        ));
        let writer = tokio::spawn(write_loop(analysis_id, self.writer, responses));
        (reader, writer)
    }
}

async fn read_loop(
    analysis_id: String,
    reader: OwnedReadHalf,
    bridge: DnsBridge,
    channel: Arc<dyn ChildChannel>,
) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("IPC read error for analysis {}: {}", analysis_id, e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match parse_message(&line) {
            Ok(ChildMessage::Request(request)) => {
                let bridge = bridge.clone();
                let channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    bridge.handle_request(request, channel.as_ref()).await;
                });
            }
            Ok(ChildMessage::Invalid {
                kind,
                request_id,
                error,
            }) => {
                warn!(
                    "Invalid {} from analysis {}: {}",
                    kind, analysis_id, error
                );
                let reply = IpcResponse::rejection(
                    &kind,
                    request_id,
                    format!("Invalid request: {}", error),
                );
                send_guarded(channel.as_ref(), reply);
            }
            Ok(ChildMessage::Unknown(kind)) => {
                debug!(
                    "Ignoring IPC message of type '{}' from analysis {}",
                    kind, analysis_id
                );
            }
            Err(e) => {
                warn!("Malformed IPC message from analysis {}: {}", analysis_id, e);
            }
        }
    }

    debug!("IPC reader for analysis {} finished", analysis_id);
}

async fn write_loop(
    analysis_id: String,
    mut writer: OwnedWriteHalf,
    mut responses: mpsc::UnboundedReceiver<IpcResponse>,
) {
    while let Some(response) = responses.recv().await {
        let line = match response.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize IPC response: {}", e);
                continue;
            }
        };

        let mut data = line.into_bytes();
        data.push(b'\n');

        if let Err(e) = writer.write_all(&data).await {
            debug!("IPC write to analysis {} failed: {}", analysis_id, e);
            break;
        }
    }

    debug!("IPC writer for analysis {} finished", analysis_id);
}
