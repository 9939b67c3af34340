//! keymq: key-addressed message broker.
//!
//! Producers `put` opaque bodies under a 32-byte routing key, consumers `get`
//! them back in FIFO order, waiting if the key is empty. A key can carry a
//! webhook that fires on registration and on every put. Worker processes
//! attach on a separate port and speak their own message family.

pub mod bridge;
pub mod logging;
pub mod slot;
pub mod transport;
pub mod webhook;

pub use bridge::codec::{CodecError, PacketCodec};
pub use bridge::protocol::{
    ClientMessageType, HEADER_SIZE, KEY_SIZE, Packet, PacketHeader, ProtocolViolation, Role,
    RoutingKey, WorkerMessageType,
};
pub use slot::{DequeueError, Slot, SlotStore, WebhookBinding};
pub use tokio_util::sync::CancellationToken;
pub use transport::{
    BrokerServer, ClientConnection, ConnectionError, LoggingDispatch, ServerConfig,
    WorkerConnection, WorkerDispatch, WorkerError, WorkerId, WorkerRegistry, serve,
};
pub use webhook::{HttpInvoker, KEYMQ_VERSION, WebhookConfig, WebhookInvoker};
