//! The error taxonomy of the client library.
//!
//! Everything a client operation can fail with is enumerated here. Errors
//! raised on a transport worker thread are stored and rethrown from the
//! next user-visible call.

use ipbus_wire::{
    header,
    hub,
};
use std::net::Ipv4Addr;

/// Top-level errors surfaced by client operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("The device did not reply within the timeout period")]
    Timeout,
    #[error("Failed to create or connect the transport socket")]
    SocketCreation(#[source] std::io::Error),
    #[error("Transport I/O failed")]
    SocketIo(#[source] std::io::Error),
    #[error("Reply validation failed")]
    Validation(#[from] ValidationError),
    #[error("ControlHub gateway rejected the packet")]
    ControlHub(#[from] HubError),
    #[error(
        "A single transaction needs {requested_send} send and {requested_reply} reply bytes, \
         exceeding the packet budget"
    )]
    BufferOverflow {
        requested_send: usize,
        requested_reply: usize,
    },
    #[error("Value read before its buffer was dispatched and validated")]
    NonValidatedMemory,
    #[error("Could not parse device URI: {0}")]
    UriParse(String),
}

/// The ways a reply stream can fail to match what was sent
#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Unparseable send header")]
    SendHeader(#[source] header::Error),
    #[error("Unparseable reply header")]
    ReplyHeader(#[source] header::Error),
    #[error("Reply response code 0x{0:x} indicates a device-side error")]
    ResponseCode(u8),
    #[error("Reply transaction type {got:?} does not match sent {sent:?}")]
    TypeMismatch {
        sent: header::TransactionType,
        got: header::TransactionType,
    },
    #[error("Reply transaction id {got} does not match sent {sent}")]
    IdMismatch { sent: u16, got: u16 },
    #[error("Send and reply streams did not exhaust together")]
    Truncated,
    #[error("Reply was {got} bytes, expected scatter layout needs {expected}")]
    Length { expected: usize, got: usize },
}

/// Failures reported by (or about) a ControlHub gateway
#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("Gateway error: {0}")]
    Code(#[source] hub::ErrorCode),
    #[error("Gateway reported unknown error code 0x{0:04x}")]
    UnknownCode(u16),
    #[error("Gateway reply targets {got}, expected {expected}")]
    IpMismatch { expected: Ipv4Addr, got: Ipv4Addr },
    #[error("Gateway reply targets port {got}, expected {expected}")]
    PortMismatch { expected: u16, got: u16 },
}

impl Error {
    /// The error every operation returns once a transport has failed and
    /// been marked unusable
    pub(crate) fn unusable() -> Self {
        Error::SocketIo(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "transport is unusable after a previous failure",
        ))
    }
}
