use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WorkiqError;
use crate::WorkiqConfig;

const TRANSPORT_TARGET: &str = "workiq::transport";
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Owns the stdio of a spawned workiq process. Outgoing messages are framed
/// as newline-terminated JSON; incoming bytes are reassembled into parsed
/// messages and delivered on an unbounded channel. The channel closing means
/// the process went away.
pub(crate) struct ProcessTransport {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    child: Mutex<Option<Child>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ProcessTransport {
    pub(crate) async fn spawn(
        config: &WorkiqConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>), WorkiqError> {
        let mut command = Command::new(&config.binary);
        command
            .args(&config.server_args)
            .env("PATH", augmented_path(config.bin_dir.as_deref()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(WorkiqError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkiqError::Spawn(std::io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkiqError::Spawn(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkiqError::Spawn(std::io::Error::other("stderr not captured")))?;

        info!(
            target: TRANSPORT_TARGET,
            binary = %config.binary,
            pid = child.id().unwrap_or_default(),
            "workiq process spawned"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(stdout, tx));
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let transport = Self {
            writer: Mutex::new(Box::new(stdin)),
            child: Mutex::new(Some(child)),
            tasks: StdMutex::new(vec![reader_task, stderr_task]),
        };
        Ok((transport, rx))
    }

    #[cfg(test)]
    pub(crate) fn from_stream(
        stream: tokio::io::DuplexStream,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(read_half, tx));
        let transport = Self {
            writer: Mutex::new(Box::new(write_half)),
            child: Mutex::new(None),
            tasks: StdMutex::new(vec![reader_task]),
        };
        (transport, rx)
    }

    /// Writes one framed message to the child's stdin. Fire-and-forget: any
    /// response arrives on the incoming channel.
    pub(crate) async fn send(&self, message: &Value) -> Result<(), WorkiqError> {
        let mut encoded = serde_json::to_string(message)?;
        encoded.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(err) = child.kill().await {
                warn!(target: TRANSPORT_TARGET, error = %err, "failed to kill workiq process");
            }
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn read_loop<R>(mut reader: R, tx: mpsc::UnboundedSender<Value>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for message in drain_lines(&mut buffer, &chunk[..n]) {
                    if tx.send(message).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(target: TRANSPORT_TARGET, error = %err, "workiq stdout read error");
                break;
            }
        }
    }
    debug!(target: TRANSPORT_TARGET, "workiq stdout closed");
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: TRANSPORT_TARGET, line = %line, "workiq stderr");
    }
}

/// Appends `chunk` to the pending buffer and parses every complete
/// newline-terminated line out of it. The trailing fragment (possibly empty)
/// stays in the buffer for the next chunk. Unparseable lines are dropped with
/// a log line; they must not disturb later lines in the same chunk.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<Value> {
    buffer.extend_from_slice(chunk);
    let mut messages = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(value) => messages.push(value),
            Err(err) => {
                warn!(
                    target: TRANSPORT_TARGET,
                    error = %err,
                    line = %trimmed,
                    "discarding unparseable line from workiq"
                );
            }
        }
    }
    messages
}

pub(crate) fn augmented_path(bin_dir: Option<&Path>) -> OsString {
    let current = std::env::var_os("PATH").unwrap_or_default();
    let Some(dir) = bin_dir else {
        return current;
    };
    let mut paths = vec![dir.to_path_buf()];
    paths.extend(std::env::split_paths(&current));
    std::env::join_paths(paths).unwrap_or(current)
}
