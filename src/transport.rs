// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON-lines transport over stdin/stdout.
//!
//! # Design
//!
//! ```text
//! stdin ──▶ read loop ──parse_line──┬─ Reply ────▶ MaelstromClient::resolve (wakes the RPC)
//!                                   └─ Request ──▶ spawned task ──▶ BroadcastNode::handle
//!                                                                        │
//!             MaelstromClient::rpc / reply ──▶ mpsc ──▶ writer task ──▶ stdout
//! ```
//!
//! - One writer task owns stdout, so lines never interleave.
//! - Outgoing RPCs carry a monotonically increasing `msg_id`; the reply is
//!   matched on `in_reply_to` through a table of pending waiters.
//! - A waiter that is dropped (its caller timed out) removes its own entry,
//!   so replies that arrive too late are simply discarded.
//! - `init` is handled inline by the read loop: the node's identity has to be
//!   fixed before anything else is dispatched. Every other request gets its
//!   own task.

use crate::client::{BoxFuture, PeerClient};
use crate::config::BroadcastConfig;
use crate::coordinator::BroadcastNode;
use crate::error::{BroadcastError, Result};
use crate::protocol::{self, Body, BroadcastPayload, Inbound, Message, Payload, Request};
use crate::topology::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type PendingTable = HashMap<u64, oneshot::Sender<Payload>>;

/// The stdio side of [`PeerClient`]: sends requests and correlates replies.
pub struct MaelstromClient {
    node_id: OnceLock<NodeId>,
    next_msg_id: AtomicU64,
    pending: Mutex<PendingTable>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Removes a pending entry when the waiting RPC goes away.
struct PendingGuard<'a> {
    client: &'a MaelstromClient,
    msg_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.pending().remove(&self.msg_id);
    }
}

impl MaelstromClient {
    pub fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            node_id: OnceLock::new(),
            next_msg_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fix the `src` of outgoing RPCs. The first id wins.
    pub fn set_node_id(&self, node_id: NodeId) {
        let _ = self.node_id.set(node_id);
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        self.node_id.get()
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of RPCs waiting for a reply.
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    fn send(&self, message: Message) -> Result<()> {
        let dest = message.dest.to_string();
        self.outbound
            .send(message)
            .map_err(|_| BroadcastError::transport(dest, "output closed"))
    }

    /// Answer request `in_reply_to` from `src` to `dest`.
    pub fn reply(&self, src: NodeId, dest: NodeId, in_reply_to: Option<u64>, payload: Payload) -> Result<()> {
        self.send(Message {
            src,
            dest,
            body: Body {
                msg_id: Some(self.next_msg_id()),
                in_reply_to,
                payload,
            },
        })
    }

    /// Send `payload` to `dest` and wait for the correlated reply.
    ///
    /// Waits indefinitely; callers wrap it in a timeout. Dropping the future
    /// unregisters the waiter.
    pub async fn rpc(&self, dest: &NodeId, payload: Payload) -> Result<Payload> {
        let src = self
            .node_id
            .get()
            .cloned()
            .ok_or_else(|| BroadcastError::Internal("rpc before init".to_string()))?;
        let msg_id = self.next_msg_id();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(msg_id, tx);
        let _guard = PendingGuard { client: self, msg_id };

        self.send(Message {
            src,
            dest: dest.clone(),
            body: Body {
                msg_id: Some(msg_id),
                in_reply_to: None,
                payload,
            },
        })?;

        rx.await
            .map_err(|_| BroadcastError::transport(dest.as_str(), "reply channel dropped"))
    }

    /// Hand a reply to its waiter. `false` if nobody is waiting any more.
    pub fn resolve(&self, in_reply_to: u64, payload: Payload) -> bool {
        let waiter = self.pending().remove(&in_reply_to);
        match waiter {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }
}

impl PeerClient for MaelstromClient {
    fn send_broadcast(&self, dest: &NodeId, payload: BroadcastPayload) -> BoxFuture<'_, ()> {
        let dest = dest.clone();
        Box::pin(async move {
            match self.rpc(&dest, payload.into_payload()).await? {
                Payload::BroadcastOk => Ok(()),
                Payload::Error { code, text } => Err(BroadcastError::Remote { code, text }),
                other => Err(BroadcastError::Internal(format!(
                    "unexpected reply to broadcast from {}: {:?}",
                    dest, other
                ))),
            }
        })
    }
}

/// Serve the node over `reader`/`writer` until `reader` hits EOF.
///
/// Returns the writer once every pending line has been written.
pub async fn run<R, W>(config: BroadcastConfig, reader: R, writer: W) -> Result<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();
    let writer_task = tokio::spawn(write_loop(out_rx, close_rx, writer));

    let client = Arc::new(MaelstromClient::new(out_tx));
    let node = Arc::new(BroadcastNode::new(config, Arc::clone(&client)));

    let served = read_loop(reader, &node, &client).await;

    node.shutdown().await;
    let _ = close_tx.send(());
    let writer = writer_task
        .await
        .map_err(|e| BroadcastError::Internal(format!("writer task failed: {}", e)))??;

    served.map(|_| writer)
}

/// Serve over the process's stdin/stdout.
pub async fn run_stdio(config: BroadcastConfig) -> Result<()> {
    run(config, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    node: &Arc<BroadcastNode<MaelstromClient>>,
    client: &Arc<MaelstromClient>,
) -> Result<()> {
    let mut lines = BufReader::new(reader).lines();
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => dispatch(&line, node, client, &mut tasks).await,
                    None => break,
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Request task panicked");
                }
            }
        }
    }

    info!(in_flight = tasks.len(), "Input closed, finishing in-flight requests");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Request task panicked");
        }
    }
    Ok(())
}

async fn dispatch(
    line: &str,
    node: &Arc<BroadcastNode<MaelstromClient>>,
    client: &Arc<MaelstromClient>,
    tasks: &mut JoinSet<()>,
) {
    if line.trim().is_empty() {
        return;
    }
    match protocol::parse_line(line) {
        Err(e) => warn!(error = %e, "Dropping unparseable line"),

        Ok(Inbound::Reply { src, in_reply_to, payload }) => {
            if !client.resolve(in_reply_to, payload) {
                debug!(src = %src, in_reply_to, "Reply arrived after its waiter gave up");
            }
        }

        Ok(Inbound::Request { src, dest, msg_id, request }) => {
            if let Ok(Request::Init { node_id, .. }) = &request {
                client.set_node_id(node_id.clone());
                answer(node, client, src, dest, msg_id, request).await;
                return;
            }
            let node = Arc::clone(node);
            let client = Arc::clone(client);
            tasks.spawn(async move {
                answer(&node, &client, src, dest, msg_id, request).await;
            });
        }
    }
}

async fn answer(
    node: &BroadcastNode<MaelstromClient>,
    client: &MaelstromClient,
    src: NodeId,
    dest: NodeId,
    msg_id: Option<u64>,
    request: Result<Request>,
) {
    let payload = match request {
        Ok(request) => match node.handle(&src, request).await {
            Ok(response) => response.into(),
            Err(e) => Payload::error(&e),
        },
        Err(e) => {
            warn!(src = %src, msg_id = ?msg_id, error = %e, "Rejecting request");
            Payload::error(&e)
        }
    };
    if let Err(e) = client.reply(dest, src, msg_id, payload) {
        warn!(error = %e, "Could not queue reply");
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut close_rx: oneshot::Receiver<()>,
    mut writer: W,
) -> Result<W> {
    let mut closing = false;
    loop {
        let message = if closing {
            rx.recv().await
        } else {
            tokio::select! {
                message = rx.recv() => message,
                _ = &mut close_rx => {
                    // Refuse new messages but flush what is queued.
                    closing = true;
                    rx.close();
                    continue;
                }
            }
        };
        let Some(message) = message else { break };

        let mut line = protocol::to_line(&message)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::store::Value;
    use std::time::Duration;

    fn outputs(raw: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(raw)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn reply_to<'a>(out: &'a [serde_json::Value], msg_id: u64) -> &'a serde_json::Value {
        out.iter()
            .find(|m| m["body"]["in_reply_to"] == msg_id)
            .unwrap_or_else(|| panic!("no reply to {}", msg_id))
    }

    #[tokio::test]
    async fn test_run_answers_requests() {
        let input = concat!(
            r#"{"src":"c0","dest":"n0","body":{"type":"init","msg_id":1,"node_id":"n0","node_ids":["n0"]}}"#, "\n",
            r#"{"src":"c1","dest":"n0","body":{"type":"broadcast","msg_id":2,"message":5}}"#, "\n",
            r#"{"src":"c1","dest":"n0","body":{"type":"broadcast","msg_id":3}}"#, "\n",
            r#"{"src":"c1","dest":"n0","body":{"type":"txn","msg_id":4}}"#, "\n",
            "garbage\n",
        );

        let writer = run(BroadcastConfig::for_testing(), input.as_bytes(), Vec::new())
            .await
            .unwrap();
        let out = outputs(&writer);

        assert_eq!(out.len(), 4);
        let init = reply_to(&out, 1);
        assert_eq!(init["body"]["type"], "init_ok");
        assert_eq!(init["src"], "n0");
        assert_eq!(init["dest"], "c0");

        assert_eq!(reply_to(&out, 2)["body"]["type"], "broadcast_ok");

        let malformed = reply_to(&out, 3);
        assert_eq!(malformed["body"]["type"], "error");
        assert_eq!(malformed["body"]["code"], codes::MALFORMED_REQUEST);

        let unknown = reply_to(&out, 4);
        assert_eq!(unknown["body"]["code"], codes::NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_rpc_correlates_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(MaelstromClient::new(tx));
        client.set_node_id("n0".into());

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .send_broadcast(&"n1".into(), BroadcastPayload::Single(Value(3)))
                    .await
            })
        };

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.src, NodeId::from("n0"));
        assert_eq!(sent.dest, NodeId::from("n1"));
        let msg_id = sent.body.msg_id.unwrap();
        assert_eq!(client.pending_len(), 1);

        assert!(client.resolve(msg_id, Payload::BroadcastOk));
        caller.await.unwrap().unwrap();
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_becomes_remote_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(MaelstromClient::new(tx));
        client.set_node_id("n0".into());

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .send_broadcast(&"n1".into(), BroadcastPayload::Batch(vec![Value(1)]))
                    .await
            })
        };
        let msg_id = rx.recv().await.unwrap().body.msg_id.unwrap();
        client.resolve(
            msg_id,
            Payload::Error {
                code: codes::TEMPORARILY_UNAVAILABLE,
                text: "busy".to_string(),
            },
        );

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, BroadcastError::Remote { code: 11, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_timed_out_rpc_unregisters() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = MaelstromClient::new(tx);
        client.set_node_id("n0".into());

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            client.send_broadcast(&"n1".into(), BroadcastPayload::Single(Value(1))),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(client.pending_len(), 0);
        // The late reply finds nobody.
        assert!(!client.resolve(1, Payload::BroadcastOk));
    }

    #[tokio::test]
    async fn test_rpc_before_init_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = MaelstromClient::new(tx);
        let err = client.rpc(&"n1".into(), Payload::Read).await.unwrap_err();
        assert!(matches!(err, BroadcastError::Internal(_)));
    }

    #[tokio::test]
    async fn test_msg_ids_increase() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = MaelstromClient::new(tx);
        client.reply("n0".into(), "c1".into(), Some(1), Payload::InitOk).unwrap();
        client.reply("n0".into(), "c1".into(), Some(2), Payload::TopologyOk).unwrap();
        let a = rx.recv().await.unwrap().body.msg_id.unwrap();
        let b = rx.recv().await.unwrap().body.msg_id.unwrap();
        assert!(b > a);
    }
}
