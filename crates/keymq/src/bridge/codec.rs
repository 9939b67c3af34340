//! Binary framing for broker sockets.
//!
//! The free functions mirror the wire layout one field at a time; [`PacketCodec`]
//! wraps them as a tokio-util Decoder/Encoder so connections can use
//! FramedRead/FramedWrite over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{HEADER_SIZE, KEY_SIZE, Packet, PacketHeader, Role, RoutingKey};

/// Largest body a decoder accepts unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed header: need {HEADER_SIZE} bytes, have {len}")]
    MalformedHeader { len: usize },

    #[error("body of {size} bytes exceeds limit of {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("truncated body: expected {expected} bytes, have {actual}")]
    TruncatedBody { expected: usize, actual: usize },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Parse a header from the first [`HEADER_SIZE`] bytes of `bytes`.
pub fn parse_header(bytes: &[u8]) -> Result<PacketHeader, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::MalformedHeader { len: bytes.len() });
    }

    let mut buf = &bytes[..HEADER_SIZE];
    let kind = buf.get_u8();
    let mut key = [0u8; KEY_SIZE];
    buf.copy_to_slice(&mut key);
    let body_size = buf.get_u32();

    Ok(PacketHeader {
        kind,
        key: RoutingKey::new(key),
        body_size,
    })
}

/// Dump a header exactly as it is, `body_size` in network byte order.
pub fn dump_header(header: &PacketHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    let mut buf = &mut out[..];
    buf.put_u8(header.kind);
    buf.put_slice(header.key.as_bytes());
    buf.put_u32(header.body_size);
    out
}

/// Copy exactly `size` bytes of body out of `bytes`.
pub fn parse_body(size: u32, bytes: &[u8]) -> Result<Bytes, CodecError> {
    let size = size as usize;
    if bytes.len() < size {
        return Err(CodecError::TruncatedBody {
            expected: size,
            actual: bytes.len(),
        });
    }
    Ok(Bytes::copy_from_slice(&bytes[..size]))
}

/// Serialize a packet to its full wire form.
///
/// This is the only place `body_size` is set: it is recomputed from the body
/// and written back into `packet.header`.
pub fn serialize(packet: &mut Packet) -> Result<Bytes, CodecError> {
    packet.header.body_size = body_size_of(&packet.body)?;
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + packet.body.len());
    dst.put_slice(&dump_header(&packet.header));
    dst.put_slice(&packet.body);
    Ok(dst.freeze())
}

fn body_size_of(body: &[u8]) -> Result<u32, CodecError> {
    u32::try_from(body.len()).map_err(|_| CodecError::BodyTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })
}

/// Role-aware packet codec.
///
/// On the broker side, decoding reads a header, then a body only for types
/// that carry one on this role's sockets. Everything else comes out with an
/// empty body and the next 37 bytes are treated as the next header.
///
/// A peer-side codec ([`PacketCodec::peer`]) reads what the broker writes, and
/// the broker always writes an exact `body_size`, so it reads a body for every type.
#[derive(Debug)]
pub struct PacketCodec {
    role: Role,
    peer: bool,
    max_body_size: usize,
    pending: Option<PacketHeader>,
}

impl PacketCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            peer: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            pending: None,
        }
    }

    /// Codec for the remote end of a `role` socket (a client library or worker process).
    pub fn peer(role: Role) -> Self {
        Self {
            peer: true,
            ..Self::new(role)
        }
    }

    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    src.reserve(HEADER_SIZE - src.len());
                    return Ok(None);
                }
                let header = parse_header(&src[..])?;
                src.advance(HEADER_SIZE);
                tracing::trace!(role = %self.role, %header, "Decoded header");
                header
            }
        };

        if !self.peer && !self.role.carries_body(header.kind) {
            if header.body_size != 0 {
                tracing::warn!(
                    role = %self.role,
                    kind = header.kind,
                    body_size = header.body_size,
                    "Ignoring body size on bodiless message"
                );
            }
            return Ok(Some(Packet::new(header, Bytes::new())));
        }

        let size = header.body_size as usize;
        if size > self.max_body_size {
            return Err(CodecError::BodyTooLarge {
                size,
                max: self.max_body_size,
            });
        }

        if src.len() < size {
            src.reserve(size - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let body = src.split_to(size).freeze();
        Ok(Some(Packet::new(header, body)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(packet) = self.decode(buf)? {
            return Ok(Some(packet));
        }

        match self.pending.take() {
            Some(header) => Err(CodecError::TruncatedBody {
                expected: header.body_size as usize,
                actual: buf.len(),
            }),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::MalformedHeader { len: buf.len() }),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, mut item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.header.body_size = body_size_of(&item.body)?;
        tracing::trace!(role = %self.role, header = %item.header, "Encoding packet");
        dst.reserve(HEADER_SIZE + item.body.len());
        dst.put_slice(&dump_header(&item.header));
        dst.put_slice(&item.body);
        Ok(())
    }
}
