use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::error::WorkiqError;
use crate::transport::ProcessTransport;

const RPC_TARGET: &str = "workiq::rpc";

pub(crate) const JSONRPC_VERSION: &str = "2.0";

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<Result<Value, WorkiqError>>>>;

/// Correlates JSON-RPC requests with responses over a [`ProcessTransport`].
/// Each in-flight request owns a pending-table entry keyed by its id; the
/// entry is removed exactly once, by whichever of the matching response or
/// the timeout gets there first.
pub(crate) struct RpcSession {
    transport: ProcessTransport,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    dispatch_task: JoinHandle<()>,
}

impl RpcSession {
    pub(crate) fn new(
        transport: ProcessTransport,
        mut incoming: mpsc::UnboundedReceiver<Value>,
        request_timeout: Duration,
    ) -> Self {
        let pending: Arc<PendingTable> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let dispatch_pending = Arc::clone(&pending);
        let dispatch_closed = Arc::clone(&closed);
        let dispatch_task = tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                dispatch_message(&dispatch_pending, message).await;
            }
            // Transport gone: every still-pending request fails now rather
            // than waiting out its timeout.
            dispatch_closed.store(true, Ordering::SeqCst);
            let mut guard = dispatch_pending.lock().await;
            for (_, tx) in guard.drain() {
                let _ = tx.send(Err(WorkiqError::Closed));
            }
        });

        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            request_timeout,
            dispatch_task,
        }
    }

    /// True once the process side of the transport has gone away.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a request and waits for the correlated response or the
    /// per-request timeout, whichever comes first.
    pub(crate) async fn request(&self, method: &str, params: Value) -> Result<Value, WorkiqError> {
        if self.is_closed() {
            return Err(WorkiqError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.transport.send(&envelope).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(WorkiqError::Closed),
            Err(_) => {
                if self.pending.lock().await.remove(&id).is_some() {
                    Err(WorkiqError::Timeout {
                        method: method.to_string(),
                        seconds: self.request_timeout.as_secs(),
                    })
                } else {
                    // The response claimed the entry in the same instant; its
                    // value is already on the channel.
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(WorkiqError::Timeout {
                            method: method.to_string(),
                            seconds: self.request_timeout.as_secs(),
                        }),
                    }
                }
            }
        }
    }

    /// Sends a notification: no id, no response expected.
    pub(crate) async fn notify(&self, method: &str, params: Value) -> Result<(), WorkiqError> {
        let envelope = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
        });
        self.transport.send(&envelope).await
    }

    pub(crate) async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

async fn dispatch_message(pending: &PendingTable, message: Value) {
    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(target: RPC_TARGET, method = %method, "ignoring unsolicited message");
        return;
    };
    let Some(tx) = pending.lock().await.remove(&id) else {
        debug!(target: RPC_TARGET, id, "ignoring response with no pending request");
        return;
    };
    let outcome = if let Some(error) = message.get("error") {
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        Err(WorkiqError::Rpc(text))
    } else {
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    };
    // The requester may have timed out in the same instant; a dropped
    // receiver is fine.
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::transport::ProcessTransport;

    struct FakePeer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakePeer {
        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.expect("read failed");
            serde_json::from_str(line.trim()).expect("invalid json from client")
        }

        async fn send(&mut self, message: Value) {
            let mut encoded = message.to_string();
            encoded.push('\n');
            self.writer
                .write_all(encoded.as_bytes())
                .await
                .expect("write failed");
        }
    }

    fn session_with_peer(request_timeout: Duration) -> (RpcSession, FakePeer) {
        let (local, remote) = tokio::io::duplex(4096);
        let (transport, incoming) = ProcessTransport::from_stream(local);
        let session = RpcSession::new(transport, incoming, request_timeout);
        let (read_half, write_half) = tokio::io::split(remote);
        let peer = FakePeer {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        (session, peer)
    }

    #[tokio::test]
    async fn request_ids_start_at_one_and_increase() {
        let (session, mut peer) = session_with_peer(Duration::from_secs(5));
        let echo = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let request = peer.recv().await;
                let id = request.get("id").and_then(Value::as_u64).expect("no id");
                ids.push(id);
                peer.send(json!({"jsonrpc": "2.0", "id": id, "result": {}}))
                    .await;
            }
            ids
        });

        for _ in 0..3 {
            session
                .request("ping", json!({}))
                .await
                .expect("request failed");
        }
        let ids = echo.await.expect("peer task failed");
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn response_result_resolves_request() {
        let (session, mut peer) = session_with_peer(Duration::from_secs(5));
        tokio::spawn(async move {
            let request = peer.recv().await;
            assert_eq!(request.get("method"), Some(&json!("tools/list")));
            let id = request.get("id").cloned().expect("no id");
            peer.send(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}}))
                .await;
        });

        let result = session
            .request("tools/list", json!({}))
            .await
            .expect("request failed");
        assert_eq!(result, json!({"tools": []}));
    }

    #[tokio::test]
    async fn error_response_carries_message() {
        let (session, mut peer) = session_with_peer(Duration::from_secs(5));
        tokio::spawn(async move {
            let request = peer.recv().await;
            let id = request.get("id").cloned().expect("no id");
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32000, "message": "boom"}
            }))
            .await;
        });

        let err = session
            .request("tools/call", json!({}))
            .await
            .expect_err("expected rpc error");
        assert!(matches!(err, WorkiqError::Rpc(ref message) if message == "boom"));
    }

    #[tokio::test]
    async fn error_without_message_uses_serialized_error() {
        let (session, mut peer) = session_with_peer(Duration::from_secs(5));
        tokio::spawn(async move {
            let request = peer.recv().await;
            let id = request.get("id").cloned().expect("no id");
            peer.send(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000}}))
                .await;
        });

        let err = session
            .request("tools/call", json!({}))
            .await
            .expect_err("expected rpc error");
        assert!(matches!(err, WorkiqError::Rpc(ref message) if message.contains("-32000")));
    }

    #[tokio::test]
    async fn timeout_fires_and_late_response_is_ignored() {
        let (session, mut peer) = session_with_peer(Duration::from_millis(50));
        let err = session
            .request("slow/method", json!({}))
            .await
            .expect_err("expected timeout");
        assert!(matches!(err, WorkiqError::Timeout { ref method, .. } if method == "slow/method"));

        // Late response for the timed-out id must be a no-op, and the session
        // must keep working afterwards.
        let request = peer.recv().await;
        let id = request.get("id").cloned().expect("no id");
        peer.send(json!({"jsonrpc": "2.0", "id": id, "result": "late"}))
            .await;

        tokio::spawn(async move {
            let request = peer.recv().await;
            let id = request.get("id").cloned().expect("no id");
            peer.send(json!({"jsonrpc": "2.0", "id": id, "result": "fresh"}))
                .await;
        });
        let result = session
            .request("fast/method", json!({}))
            .await
            .expect("request after timeout failed");
        assert_eq!(result, json!("fresh"));
    }

    #[tokio::test]
    async fn unsolicited_messages_are_ignored() {
        let (session, mut peer) = session_with_peer(Duration::from_secs(5));
        tokio::spawn(async move {
            let request = peer.recv().await;
            let id = request.get("id").cloned().expect("no id");
            peer.send(json!({"jsonrpc": "2.0", "method": "notifications/progress"}))
                .await;
            peer.send(json!({"jsonrpc": "2.0", "id": 9999, "result": "stray"}))
                .await;
            peer.send(json!({"jsonrpc": "2.0", "id": id, "result": "real"}))
                .await;
        });

        let result = session
            .request("ask", json!({}))
            .await
            .expect("request failed");
        assert_eq!(result, json!("real"));
    }

    #[tokio::test]
    async fn peer_going_away_fails_pending_requests() {
        let (session, peer) = session_with_peer(Duration::from_secs(5));
        let request = session.request("ask", json!({}));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(peer);
        });
        let err = request.await.expect_err("expected closed error");
        assert!(matches!(err, WorkiqError::Closed));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn notifications_carry_no_id() {
        let (session, mut peer) = session_with_peer(Duration::from_secs(5));
        session
            .notify("notifications/initialized", json!({}))
            .await
            .expect("notify failed");
        let message = peer.recv().await;
        assert!(message.get("id").is_none());
        assert_eq!(
            message.get("method"),
            Some(&json!("notifications/initialized"))
        );
    }
}
