//! Wire protocol and framing shared by every broker socket.
//!
//! # Architecture
//!
//! - **protocol**: Routing keys, message type families, headers and packets
//! - **codec**: Fixed-header binary codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
