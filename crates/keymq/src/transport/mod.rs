//! Socket handling: per-role connection handlers and the accepting server.

use std::io;

use crate::bridge::codec::CodecError;

pub mod client;
pub mod server;
pub mod worker;
pub mod writer;

pub use client::ClientConnection;
pub use server::{BrokerServer, ServerConfig, serve};
pub use worker::{
    LoggingDispatch, WorkerConnection, WorkerDispatch, WorkerError, WorkerHandler, WorkerId,
    WorkerRegistry,
};
pub use writer::PacketWriter;

/// Why a connection stopped. Always local to that connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}
