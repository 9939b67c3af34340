//! Wire protocol types shared by producers, consumers and workers.
//!
//! Every message on every socket is one fixed header followed by a body:
//!
//! ```text
//! | type: u8 | key: [u8; 32] | body_size: u32 (big-endian) | body: [u8; body_size] |
//! ```
//!
//! Two message families share that frame:
//! - **Client sockets**: put, get, response, call_register
//! - **Worker sockets**: dereg, results, acks (plus types only the broker sends)

use std::fmt;

use tokio_util::bytes::Bytes;

/// Length of a routing key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Fixed header size on the wire: type byte + key + body size.
pub const HEADER_SIZE: usize = 1 + KEY_SIZE + 4;

/// 256-bit opaque identifier that partitions queued messages and webhook bindings.
///
/// Equality and hashing are over the raw bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey([u8; KEY_SIZE]);

impl RoutingKey {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice; `None` unless it is exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_SIZE]>::try_from(bytes).ok().map(Self)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Lowercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;

        self.0.iter().fold(String::with_capacity(KEY_SIZE * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

impl From<[u8; KEY_SIZE]> for RoutingKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingKey({})", self.to_hex())
    }
}

/// Message types valid on client (producer/consumer) sockets.
///
/// Ordinals are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientMessageType {
    Error = 0,
    Put = 1,
    Get = 2,
    Response = 3,
    CallRegister = 4,
}

impl ClientMessageType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Put => "put",
            Self::Get => "get",
            Self::Response => "response",
            Self::CallRegister => "call_register",
        }
    }

    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Error),
            1 => Some(Self::Put),
            2 => Some(Self::Get),
            3 => Some(Self::Response),
            4 => Some(Self::CallRegister),
            _ => None,
        }
    }

    /// Whether the broker reads `body_size` bytes after this header.
    pub fn carries_body(&self) -> bool {
        matches!(self, Self::Put | Self::CallRegister)
    }
}

/// Message types valid on worker sockets (separate enumeration from the client family).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerMessageType {
    WorkerReg = 0,
    WorkerDereg = 1,
    WorkerResponse = 2,
    Ack = 3,
    Err = 4,
    WorkerPushRequest = 5,
    Trigger = 6,
}

impl WorkerMessageType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerReg => "worker_reg",
            Self::WorkerDereg => "worker_dereg",
            Self::WorkerResponse => "worker_response",
            Self::Ack => "ack",
            Self::Err => "err",
            Self::WorkerPushRequest => "worker_push_request",
            Self::Trigger => "trigger",
        }
    }

    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::WorkerReg),
            1 => Some(Self::WorkerDereg),
            2 => Some(Self::WorkerResponse),
            3 => Some(Self::Ack),
            4 => Some(Self::Err),
            5 => Some(Self::WorkerPushRequest),
            6 => Some(Self::Trigger),
            _ => None,
        }
    }

    pub fn carries_body(&self) -> bool {
        matches!(self, Self::WorkerResponse)
    }
}

/// Which side of the broker a socket belongs to. Decides how the type byte is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Worker,
}

impl Role {
    /// Whether an inbound header of this type is followed by a body on this role's sockets.
    ///
    /// Unknown type bytes are treated as bodiless.
    pub fn carries_body(self, kind: u8) -> bool {
        match self {
            Self::Client => ClientMessageType::from_u8(kind).is_some_and(|t| t.carries_body()),
            Self::Worker => WorkerMessageType::from_u8(kind).is_some_and(|t| t.carries_body()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// A well-formed packet that is not acceptable where it arrived.
///
/// Never fatal: the connection logs it and keeps reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("unknown {role} message type {byte}")]
    UnknownType { role: Role, byte: u8 },

    #[error("{role} socket received unexpected {name} message")]
    UnexpectedType { role: Role, name: &'static str },

    #[error("invalid webhook binding: {0}")]
    InvalidBinding(String),
}

/// Fixed-size packet header.
///
/// The type byte is kept raw so any byte survives a parse/dump round trip;
/// [`PacketHeader::client_type`] and [`PacketHeader::worker_type`] interpret it per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: u8,
    pub key: RoutingKey,
    pub body_size: u32,
}

impl PacketHeader {
    pub fn client(kind: ClientMessageType, key: RoutingKey) -> Self {
        Self {
            kind: kind.as_u8(),
            key,
            body_size: 0,
        }
    }

    pub fn worker(kind: WorkerMessageType, key: RoutingKey) -> Self {
        Self {
            kind: kind.as_u8(),
            key,
            body_size: 0,
        }
    }

    pub fn client_type(&self) -> Result<ClientMessageType, ProtocolViolation> {
        ClientMessageType::from_u8(self.kind).ok_or(ProtocolViolation::UnknownType {
            role: Role::Client,
            byte: self.kind,
        })
    }

    pub fn worker_type(&self) -> Result<WorkerMessageType, ProtocolViolation> {
        WorkerMessageType::from_u8(self.kind).ok_or(ProtocolViolation::UnknownType {
            role: Role::Worker,
            byte: self.kind,
        })
    }
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[t={}|k={}|d={}]", self.kind, self.key, self.body_size)
    }
}

/// Header plus body.
///
/// `header.body_size` is only authoritative after a parse; encoding recomputes it
/// from `body.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    pub fn client(kind: ClientMessageType, key: RoutingKey, body: impl Into<Bytes>) -> Self {
        Self::new(PacketHeader::client(kind, key), body)
    }

    pub fn worker(kind: WorkerMessageType, key: RoutingKey, body: impl Into<Bytes>) -> Self {
        Self::new(PacketHeader::worker(kind, key), body)
    }

    pub fn key(&self) -> &RoutingKey {
        &self.header.key
    }
}
