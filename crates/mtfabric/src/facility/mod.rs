// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote request/response facilities.
//!
//! A facility is a keyed request/response endpoint: callers submit keyed
//! orders, replies come back carrying the caller's correlation key. Behind
//! the facility sits a set of live RPC sessions that come and go with
//! `Register`/`Deregister` actions derived from heartbeat discovery.
//!
//! # Modules
//!
//! - `remote` - the multi-transport facility node itself
//! - `session` - RPC connector contract and per-session workers
//! - `loopback` - in-process connector for local facilities and tests
//! - `self_loop` - priming-request feedback wiring
//! - `subscriber` - long-lived subscription lifecycle helper
//! - `setup` - runtime-indexed bring-up of a facility fleet

pub mod loopback;
pub mod remote;
pub mod self_loop;
pub mod session;
pub mod setup;
pub mod subscriber;


pub use remote::{KeyedReply, OrderKey, RemoteFacility};
pub use self_loop::{SelfLoop, SelfLoopConfig, SelfLoopOutputs};
pub use session::{ConnectorRegistry, ReplyEnvelope, RpcChannel, RpcConnector};
pub use setup::{ChannelDescriptor, FacilityFabric, SetupRemoteFacilities};
pub use subscriber::{SubscriberHelper, SubscriptionProtocol};

use crate::error::ConfigError;
use crate::locator::ConnectionLocator;
use std::fmt;
use std::time::Duration;

// ===== Actions =====

/// What a discovery action asks the facility to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FacilityActionType {
    Register,
    Deregister,
    NoChange,
}

impl fmt::Display for FacilityActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Register => "register",
            Self::Deregister => "deregister",
            Self::NoChange => "no-change",
        })
    }
}

/// RPC channel transports a facility session can ride on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FacilityConnectionType {
    RabbitMq,
    Redis,
    ZeroMq,
    Nng,
    Grpc,
    JsonRest,
}

impl FacilityConnectionType {
    /// Scheme string used in facility channel specs and status strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RabbitMq => "rabbitmq",
            Self::Redis => "redis",
            Self::ZeroMq => "zeromq",
            Self::Nng => "nng",
            Self::Grpc => "grpc",
            Self::JsonRest => "json_rest",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "rabbitmq" => Some(Self::RabbitMq),
            "redis" => Some(Self::Redis),
            "zeromq" => Some(Self::ZeroMq),
            "nng" => Some(Self::Nng),
            "grpc" => Some(Self::Grpc),
            "json_rest" => Some(Self::JsonRest),
            _ => None,
        }
    }
}

impl fmt::Display for FacilityConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a facility channel spec such as `redis://h:6379`.
pub fn parse_facility_channel(
    text: &str,
) -> Result<(FacilityConnectionType, ConnectionLocator), ConfigError> {
    let (scheme, rest) = text
        .split_once("://")
        .ok_or_else(|| ConfigError::MalformedChannelSpec(text.to_string()))?;
    let connection_type = FacilityConnectionType::from_scheme(scheme)
        .ok_or_else(|| ConfigError::UnknownProtocol(scheme.to_string()))?;
    let locator = ConnectionLocator::parse(rest)?;
    Ok((connection_type, locator))
}

/// A discovery-derived lifecycle command for one facility connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFacilityAction {
    pub action_type: FacilityActionType,
    pub connection_type: FacilityConnectionType,
    pub locator: ConnectionLocator,
    /// Human-readable status string; see
    /// [`crate::heartbeat::tracker::build_status_info`].
    pub description: String,
}

impl RemoteFacilityAction {
    pub fn new(
        action_type: FacilityActionType,
        connection_type: FacilityConnectionType,
        locator: ConnectionLocator,
        description: impl Into<String>,
    ) -> Self {
        Self {
            action_type,
            connection_type,
            locator,
            description: description.into(),
        }
    }
}

/// Emitted on a facility's extra output when an action actually took
/// effect inside it, with the observed round-trip time.
#[derive(Clone, Debug)]
pub struct RemoteFacilityActionResult {
    pub action: RemoteFacilityAction,
    pub round_trip: Duration,
}

/// How outgoing orders pick among live sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Pick uniformly among currently live sessions at send time.
    Random,
    /// The caller names the exact locator; absence is a dispatch failure.
    Designated,
}
