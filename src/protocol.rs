// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire model.
//!
//! Every line on stdin/stdout is one JSON envelope:
//!
//! ```json
//! {"src": "c1", "dest": "n0", "body": {"type": "broadcast", "msg_id": 7, "message": 42}}
//! ```
//!
//! The body's `type` field selects a [`Payload`] variant. Inbound bodies are
//! validated exactly once, in [`parse_line`], into a typed [`Inbound`]: either a
//! [`Request`] for the node to handle or a reply to correlate with an
//! outstanding RPC. Nothing past this module looks at raw JSON.

use crate::error::{BroadcastError, Result};
use crate::store::Value;
use crate::topology::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<B = Body> {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: B,
}

/// Message body: correlation ids plus the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,

    #[serde(flatten)]
    pub payload: Payload,
}

/// Every body shape this node sends or understands, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,
    Broadcast {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<Value>>,
    },
    BroadcastOk,
    Read,
    ReadOk {
        messages: Vec<Value>,
    },
    Error {
        code: u32,
        text: String,
    },
}

impl Payload {
    /// Error body describing `err`.
    pub fn error(err: &BroadcastError) -> Self {
        Self::Error {
            code: err.error_code(),
            text: err.to_string(),
        }
    }
}

/// Request types a node answers.
const REQUEST_TYPES: &[&str] = &["init", "topology", "broadcast", "read"];

// =============================================================================
// Typed request / response
// =============================================================================

/// What a `broadcast` carries: one value from a client or a peer's immediate
/// fan-out, or a batch from an anti-entropy push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastPayload {
    Single(Value),
    Batch(Vec<Value>),
}

impl BroadcastPayload {
    pub fn values(&self) -> &[Value] {
        match self {
            Self::Single(v) => std::slice::from_ref(v),
            Self::Batch(vs) => vs,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    pub fn into_payload(self) -> Payload {
        match self {
            Self::Single(v) => Payload::Broadcast {
                message: Some(v),
                messages: None,
            },
            Self::Batch(vs) => Payload::Broadcast {
                message: None,
                messages: Some(vs),
            },
        }
    }
}

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    Broadcast(BroadcastPayload),
    Read,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Topology { .. } => "topology",
            Self::Broadcast(_) => "broadcast",
            Self::Read => "read",
        }
    }
}

impl TryFrom<Payload> for Request {
    type Error = BroadcastError;

    fn try_from(payload: Payload) -> Result<Self> {
        match payload {
            Payload::Init { node_id, node_ids } => Ok(Self::Init { node_id, node_ids }),
            Payload::Topology { topology } => Ok(Self::Topology { topology }),
            Payload::Broadcast { message, messages } => match (message, messages) {
                (Some(v), None) => Ok(Self::Broadcast(BroadcastPayload::Single(v))),
                (None, Some(vs)) => Ok(Self::Broadcast(BroadcastPayload::Batch(vs))),
                (None, None) => Err(BroadcastError::MalformedRequest(
                    "broadcast needs `message` or `messages`".to_string(),
                )),
                (Some(_), Some(_)) => Err(BroadcastError::MalformedRequest(
                    "broadcast cannot carry both `message` and `messages`".to_string(),
                )),
            },
            Payload::Read => Ok(Self::Read),
            other => Err(BroadcastError::NotSupported(format!("{:?}", other))),
        }
    }
}

/// A successful answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    InitOk,
    TopologyOk,
    BroadcastOk,
    ReadOk { messages: Vec<Value> },
}

impl From<Response> for Payload {
    fn from(response: Response) -> Self {
        match response {
            Response::InitOk => Payload::InitOk,
            Response::TopologyOk => Payload::TopologyOk,
            Response::BroadcastOk => Payload::BroadcastOk,
            Response::ReadOk { messages } => Payload::ReadOk { messages },
        }
    }
}

// =============================================================================
// Inbound parsing
// =============================================================================

/// One inbound line after validation.
#[derive(Debug)]
pub enum Inbound {
    /// A request to answer. `request` is `Err` when the body was malformed
    /// or of an unknown type; it still deserves an `error` reply.
    Request {
        src: NodeId,
        dest: NodeId,
        msg_id: Option<u64>,
        request: Result<Request>,
    },
    /// A reply to one of our own RPCs.
    Reply {
        src: NodeId,
        in_reply_to: u64,
        payload: Payload,
    },
}

/// Parse and validate one line.
///
/// Fails only when the line is not an envelope at all, in which case there is
/// nobody to reply to.
pub fn parse_line(line: &str) -> Result<Inbound> {
    let raw: Message<serde_json::Value> = serde_json::from_str(line)?;
    let Message { src, dest, body } = raw;

    let field_u64 = |name: &str| body.get(name).and_then(serde_json::Value::as_u64);
    let msg_id = field_u64("msg_id");
    let in_reply_to = field_u64("in_reply_to");
    let kind = body
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned);

    if let Some(in_reply_to) = in_reply_to {
        let payload = serde_json::from_value::<Body>(body)
            .map(|b| b.payload)
            .map_err(|e| BroadcastError::MalformedRequest(format!("unreadable reply: {}", e)));
        return match payload {
            Ok(payload) => Ok(Inbound::Reply {
                src,
                in_reply_to,
                payload,
            }),
            // Still wake the waiter; it gets an error instead of a hang.
            Err(err) => Ok(Inbound::Reply {
                src,
                in_reply_to,
                payload: Payload::error(&err),
            }),
        };
    }

    let request = match kind.as_deref() {
        None => Err(BroadcastError::MalformedRequest(
            "body has no `type`".to_string(),
        )),
        Some(kind) if !REQUEST_TYPES.contains(&kind) => {
            Err(BroadcastError::NotSupported(kind.to_string()))
        }
        Some(kind) => serde_json::from_value::<Body>(body)
            .map_err(|e| BroadcastError::MalformedRequest(format!("{}: {}", kind, e)))
            .and_then(|b| Request::try_from(b.payload)),
    };

    Ok(Inbound::Request {
        src,
        dest,
        msg_id,
        request,
    })
}

/// Serialize a message as one JSON line (no trailing newline).
pub fn to_line(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
