//! Callback-driven WebSocket endpoint library (RFC 6455).
//!
//! An endpoint is either a [`Server`] accepting many peers or a client
//! connection opened with [`connect`]. Either way the protocol engine runs in
//! a per-connection reader task and hands events to a [`Handler`]:
//! `on_open`, then any number of `on_message` calls, then exactly one
//! `on_close`. Callbacks for one connection never run concurrently.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sphalerite::{async_trait, Connection, DataKind, Handler, Server};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Handler for Echo {
//!     async fn on_message(&self, connection: &Arc<Connection>, kind: DataKind, data: Vec<u8>) {
//!         let _ = connection.send(kind, &data).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sphalerite::Error> {
//!     let server = Server::open("127.0.0.1", 9001, Echo).await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     server.close().await;
//!     Ok(())
//! }
//! ```

mod client;
mod close;
mod connection;
pub mod frame;
mod handshake;
mod server;
mod transport;
pub mod utf8;

use std::sync::Arc;

use thiserror::Error;

pub use async_trait::async_trait;

pub use client::{connect, ClientOptions};
pub use close::CloseCode;
pub use connection::{Connection, Timeouts};
pub use frame::Opcode;
pub use handshake::accept_key;
pub use server::Server;
pub use transport::KeepaliveOptions;
pub use utf8::{Utf8State, Utf8Validator};

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] tokio::io::Error),
    #[error("could not get random data")]
    GetRandom(getrandom::Error),
    #[error("URL does not have a host")]
    NoHost,
    #[error("incorrect scheme, not one of \"ws\" or \"wss\"")]
    IncorrectScheme,
    #[error("TLS requested but the tls feature is not enabled")]
    TlsNotSupported,
    #[error("invalid TLS server name")]
    InvalidServerName,
    #[error("got an unexpected HTTP status in response: {0}")]
    UnexpectedStatus(String),
    #[error("got an unexpected HTTP request: {0}")]
    UnexpectedRequest(String),
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(String),
    #[error("missing or invalid header: {0}")]
    MissingOrInvalidHeader(&'static str),
    #[error("handshake is not valid text")]
    HandshakeEncoding,
    #[error("handshake did not finish in time")]
    HandshakeTimeout,
    #[error("reserved frame bits are set")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("mask flag does not match the connection role")]
    BadMask,
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload longer than 125 bytes")]
    OversizedControl,
    #[error("continuation frame without a message in progress")]
    StrayContinuation,
    #[error("data frame while a fragmented message is in progress")]
    InterleavedMessage,
    #[error("close frame with a payload length of 1")]
    BadCloseLength,
    #[error("close code {0} is not allowed")]
    InvalidCloseCode(u16),
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("could not buffer message")]
    NoMemory,
    #[error("fragmented message timed out")]
    MessageTimeout,
    #[error("connection is not open")]
    NotConnected,
}

impl From<getrandom::Error> for Error {
    fn from(error: getrandom::Error) -> Self {
        Error::GetRandom(error)
    }
}

impl Error {
    /// The close code announced to the peer before tearing the connection
    /// down. `None` means the failure is local and no frame is owed.
    pub(crate) fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::ReservedBits
            | Error::UnknownOpcode(_)
            | Error::BadMask
            | Error::FragmentedControl
            | Error::OversizedControl
            | Error::StrayContinuation
            | Error::InterleavedMessage
            | Error::BadCloseLength
            | Error::InvalidCloseCode(_) => Some(CloseCode::PROTOCOL_ERROR),
            Error::InvalidUtf8 => Some(CloseCode::INVALID_DATA),
            Error::NoMemory => Some(CloseCode::UNEXPECTED_CONDITION),
            _ => None,
        }
    }
}

/// Which side of the connection this endpoint is. Fixed at construction;
/// decides the masking policy in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// The two data message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Text,
    Binary,
}

impl DataKind {
    pub(crate) fn opcode(self) -> Opcode {
        match self {
            DataKind::Text => Opcode::Text,
            DataKind::Binary => Opcode::Binary,
        }
    }
}

/// User callbacks, invoked from the connection's reader task.
///
/// For one connection the order is `on_open`, then `on_message` per complete
/// message in frame-arrival order, then exactly one `on_close`; two callbacks
/// never run concurrently. A connection that fails its opening handshake, on
/// either side, gets an `on_close` without an `on_open`. The payload is owned
/// by the callback; clone the connection `Arc` to retain the connection
/// itself.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn on_open(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }

    async fn on_message(&self, connection: &Arc<Connection>, kind: DataKind, data: Vec<u8>);

    async fn on_close(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }
}
