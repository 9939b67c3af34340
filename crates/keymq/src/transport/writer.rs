//! Per-connection serialized packet writer.

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{CodecError, PacketCodec};
use crate::bridge::protocol::{Packet, Role};

/// Write half of a connection behind an async mutex.
///
/// Any number of tasks may hold an `Arc<PacketWriter>`; each `send` writes one
/// whole frame before the next one starts.
pub struct PacketWriter<W> {
    inner: Mutex<FramedWrite<W, PacketCodec>>,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(io: W, role: Role) -> Self {
        Self {
            inner: Mutex::new(FramedWrite::new(io, PacketCodec::new(role))),
        }
    }

    /// Write and flush one packet.
    pub async fn send(&self, packet: Packet) -> Result<(), CodecError> {
        let mut writer = self.inner.lock().await;
        writer.send(packet).await
    }
}
