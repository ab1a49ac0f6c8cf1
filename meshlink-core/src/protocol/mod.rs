/*
  Every physical send carries exactly one frame:

   0                                            15                                              31
   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                      body length(32)                                        |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                    msgpack body: { "event": name, "args": payload }                        |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::error::Result;
use crate::route::RouteAdvert;

/// Identifier of a tunnel, stable across every hop it traverses.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(u64);

impl TunnelId {
    pub fn random() -> TunnelId {
        TunnelId(rand::random())
    }
    pub const fn from_u64(value: u64) -> TunnelId {
        TunnelId(value)
    }
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An error that crosses the wire: the message plus the hops it travelled.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut source = error.source();
        while let Some(e) = source {
            stack.push(e.to_string());
            source = e.source();
        }
        Self {
            message: error.to_string(),
            stack: if stack.is_empty() {
                None
            } else {
                Some(stack.join("\n"))
            },
        }
    }
    /// Appends `at <node>` to the stack, recording a hop the error passed.
    pub fn at(mut self, node: &str) -> Self {
        let line = format!("at {node}");
        self.stack = Some(match self.stack.take() {
            Some(stack) => format!("{stack}\n{line}"),
            None => line,
        });
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorInfo {}

impl From<ErrorInfo> for io::Error {
    fn from(value: ErrorInfo) -> Self {
        io::Error::new(io::ErrorKind::ConnectionAborted, value)
    }
}

/// Metadata handed to the component that receives a tunnel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectContext {
    /// Where the traffic entered the mesh, e.g. a client socket address.
    #[serde(default)]
    pub source: Option<String>,
    /// Where the originator wants the traffic to leave the mesh.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl ConnectContext {
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// Describes a component instance: `name` is `node/component`, `kind` selects
/// the adapter and `options` is handed to it untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: Address,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Value,
}

impl ComponentDescriptor {
    pub fn new(name: Address, kind: impl Into<String>) -> Self {
        Self {
            name,
            kind: kind.into(),
            options: Value::Null,
        }
    }
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// One wire event: name plus ordered arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args")]
pub enum WireMessage {
    #[serde(rename = "auth")]
    Auth { user: String, token: String },
    #[serde(rename = "auth_ok")]
    AuthOk { name: String },
    #[serde(rename = "auth_failed")]
    AuthFailed,
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
    #[serde(rename = "regist")]
    Regist(ComponentDescriptor),
    #[serde(rename = "route")]
    Route(BTreeMap<String, RouteAdvert>),
    #[serde(rename = "tunnel::connect")]
    Connect {
        id: TunnelId,
        address: Address,
        context: ConnectContext,
    },
    #[serde(rename = "tunnel::connection")]
    Connection { id: TunnelId, args: Vec<Value> },
    #[serde(rename = "tunnel::data")]
    Data { id: TunnelId, chunk: Bytes },
    #[serde(rename = "tunnel::final")]
    Final { id: TunnelId },
    /// Whoever receives this may send `chunks` more data frames for `id`.
    #[serde(rename = "tunnel::credit")]
    Credit { id: TunnelId, chunks: u32 },
    #[serde(rename = "tunnel::error")]
    Error { id: TunnelId, error: ErrorInfo },
    #[serde(rename = "tunnel::close")]
    Close {
        id: TunnelId,
        error: Option<ErrorInfo>,
    },
    #[serde(rename = "tunnel::message")]
    Message {
        id: TunnelId,
        event: String,
        args: Vec<Value>,
    },
}

impl WireMessage {
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::Auth { .. } => "auth",
            WireMessage::AuthOk { .. } => "auth_ok",
            WireMessage::AuthFailed => "auth_failed",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::Regist(_) => "regist",
            WireMessage::Route(_) => "route",
            WireMessage::Connect { .. } => "tunnel::connect",
            WireMessage::Connection { .. } => "tunnel::connection",
            WireMessage::Data { .. } => "tunnel::data",
            WireMessage::Final { .. } => "tunnel::final",
            WireMessage::Credit { .. } => "tunnel::credit",
            WireMessage::Error { .. } => "tunnel::error",
            WireMessage::Close { .. } => "tunnel::close",
            WireMessage::Message { .. } => "tunnel::message",
        }
    }
    pub fn tunnel_id(&self) -> Option<TunnelId> {
        match self {
            WireMessage::Connect { id, .. }
            | WireMessage::Connection { id, .. }
            | WireMessage::Data { id, .. }
            | WireMessage::Final { id }
            | WireMessage::Credit { id, .. }
            | WireMessage::Error { id, .. }
            | WireMessage::Close { id, .. }
            | WireMessage::Message { id, .. } => Some(*id),
            _ => None,
        }
    }
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
    pub fn decode(buf: &[u8]) -> Result<WireMessage> {
        Ok(rmp_serde::from_slice(buf)?)
    }
}
