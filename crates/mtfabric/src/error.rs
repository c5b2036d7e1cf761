// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for fabric operations.
//!
//! Each error kind maps to a distinct propagation policy:
//!
//! - [`ConfigError`] surfaces at graph-construction time and is never
//!   recovered internally.
//! - [`DecodeError`] is logged at the point of failure and the offending
//!   message is dropped.
//! - [`TransportError`] closes the affected session; liveness changes are
//!   reflected through the discovery state machine.
//! - [`DispatchError`] is reported to the caller as a failure reply on the
//!   normal order-output channel.

use crate::locator::ConnectionLocator;
use std::fmt;
use std::io;

/// Result type for fabric operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error union.
#[derive(Debug)]
pub enum Error {
    /// Malformed spec, unknown protocol, unsupported transport.
    Config(ConfigError),
    /// Bad wire frame or unparseable payload.
    Decode(DecodeError),
    /// Socket failure or RPC disconnect.
    Transport(TransportError),
    /// Request could not be routed to a session.
    Dispatch(DispatchError),
    /// Call after teardown.
    Lifecycle,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Dispatch(e) => write!(f, "dispatch error: {}", e),
            Self::Lifecycle => write!(f, "component already shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Dispatch(e) => Some(e),
            Self::Lifecycle => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

/// Construction-time configuration failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Protocol segment of a channel spec is not recognized.
    UnknownProtocol(String),
    /// Channel spec does not match `<protocol>://<host>:<port>[...]`.
    MalformedChannelSpec(String),
    /// Locator segment could not be parsed.
    MalformedLocator(String),
    /// Protocol is known but no driver is built in or registered.
    UnsupportedTransport(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProtocol(p) => write!(f, "unknown protocol '{}'", p),
            Self::MalformedChannelSpec(s) => write!(f, "malformed channel spec '{}'", s),
            Self::MalformedLocator(s) => write!(f, "malformed locator '{}'", s),
            Self::UnsupportedTransport(p) => {
                write!(f, "no transport driver available for '{}'", p)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Wire decode failures.
#[derive(Debug)]
pub enum DecodeError {
    /// CBOR decoding failed (includes trailing-bytes rejection).
    Cbor(String),
    /// Frame exceeded the staging buffer and was truncated by the socket.
    Oversize { size: usize, capacity: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cbor(msg) => write!(f, "bad CBOR frame: {}", msg),
            Self::Oversize { size, capacity } => {
                write!(f, "frame of {} bytes exceeds {}-byte buffer", size, capacity)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_cbor::Error> for DecodeError {
    fn from(e: serde_cbor::Error) -> Self {
        Self::Cbor(e.to_string())
    }
}

/// Socket and RPC-channel failures.
#[derive(Debug)]
pub enum TransportError {
    /// Underlying I/O error.
    Io(io::Error),
    /// ZeroMQ library error.
    Zmq(String),
    /// Session or endpoint was closed by the remote side.
    Closed,
    /// Connection could not be established.
    ConnectFailed(String),
    /// Worker thread could not be spawned.
    Spawn(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Zmq(msg) => write!(f, "zeromq error: {}", msg),
            Self::Closed => write!(f, "connection closed"),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            Self::Spawn(msg) => write!(f, "worker spawn failed: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<zmq::Error> for TransportError {
    fn from(e: zmq::Error) -> Self {
        Self::Zmq(e.to_string())
    }
}

/// Request routing failures, surfaced per-request through the reply channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// Designated dispatch named a locator with no live session.
    NoSuchConnection(ConnectionLocator),
    /// Random dispatch found no live session (canonical behavior is drop;
    /// this variant exists for callers that ask for an explicit reply).
    NoLiveSession,
    /// Facility was shut down before the request could be routed.
    Shutdown,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchConnection(l) => write!(f, "no live session for locator '{}'", l),
            Self::NoLiveSession => write!(f, "no live session"),
            Self::Shutdown => write!(f, "facility shut down"),
        }
    }
}

impl std::error::Error for DispatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_cause() {
        let err = Error::Config(ConfigError::UnknownProtocol("kafka".to_string()));
        assert!(err.to_string().contains("kafka"));

        let err = Error::Decode(DecodeError::Oversize {
            size: 32,
            capacity: 16,
        });
        assert!(err.to_string().contains("32"));
    }

    #[test]
    fn dispatch_error_preserves_locator() {
        let locator = ConnectionLocator::new("h", 1);
        let err = DispatchError::NoSuchConnection(locator.clone());
        assert!(err.to_string().contains("h:1"));
        match err {
            DispatchError::NoSuchConnection(l) => assert_eq!(l, locator),
            _ => panic!("wrong variant"),
        }
    }
}
