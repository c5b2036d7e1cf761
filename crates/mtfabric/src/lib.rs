// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # MTFABRIC - Multi-Transport Messaging & Remote-Facility Fabric
//!
//! A runtime that lets application dataflow graphs discover, connect to,
//! and invoke remote request/response services ("facilities") carried
//! over a heterogeneous set of wire transports, keeping the set of live
//! connections synchronized with a stream of peer heartbeat
//! announcements.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |    user dataflow nodes call facilities, receive keyed replies      |
//! +--------------------------------------------------------------------+
//! |                        Facility Layer                              |
//! |  RemoteFacility | SelfLoop priming | SubscriberHelper | Setup      |
//! +--------------------------------------------------------------------+
//! |                        Discovery Layer                             |
//! |  HeartbeatMessage broadcasts -> HeartbeatTracker -> actions        |
//! +--------------------------------------------------------------------+
//! |                        Broadcast Layer                             |
//! |  ZeroMQ | UDP multicast | Redis/RabbitMQ/NNG adapter contract      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Data flow at runtime: peer heartbeats plus clock ticks feed the
//! tracker; the tracker emits one action array per tick; each array
//! drives one facility's live-session set; self-loops turn every
//! `Register` into a priming request and gate completion on the first
//! matching reply.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionLocator`] | Parsed endpoint address, the session identity |
//! | [`BroadcastRouter`] | Channel spec to concrete pub/sub transport |
//! | [`HeartbeatTracker`] | TTL liveness over `(sender, facility)` pairs |
//! | [`RemoteFacility`] | Keyed request/response over live RPC sessions |
//! | [`SelfLoop`] | Register-to-priming-request feedback wiring |
//! | [`SubscriberHelper`] | Subscription IDs and unsubscribe replay |
//!
//! ## Concurrency model
//!
//! Long-lived named worker threads with fine-grained mutexes: one
//! receive and one publish thread per broadcast endpoint, one worker per
//! open RPC session, one dispatcher plus one reply router per facility.
//! Blocking calls are bounded (1 s socket receives, millisecond condvar
//! waits); every component joins its threads on drop.

/// Broadcast transports: ZeroMQ, UDP multicast, and the driver contract.
pub mod broadcast;
/// Wire constants and `MTFABRIC_*` runtime tunables.
pub mod config;
/// Error kinds and their propagation policies.
pub mod error;
/// Remote facilities, sessions, self-loops, subscriber helper, setup.
pub mod facility;
/// Minimal dataflow plumbing (sources, sinks, workers, clocks).
pub mod flow;
/// Broadcast wire framing and user/wire byte hooks.
pub mod framing;
/// Heartbeat messages, listener/announcer, and the liveness tracker.
pub mod heartbeat;
/// Parsed endpoint addresses.
pub mod locator;

pub use broadcast::{
    BroadcastChannelSpec, BroadcastDriver, BroadcastProtocol, BroadcastRouter, MulticastComponent,
    TopicFilter, TypedDataWithTopic, ZeroMqComponent,
};
pub use error::{ConfigError, DecodeError, DispatchError, Error, Result, TransportError};
pub use facility::{
    ChannelDescriptor, ConnectorRegistry, DispatchStrategy, FacilityActionType,
    FacilityConnectionType, FacilityFabric, KeyedReply, OrderKey, RemoteFacility,
    RemoteFacilityAction, RemoteFacilityActionResult, ReplyEnvelope, RpcChannel, RpcConnector,
    SelfLoop, SelfLoopConfig, SelfLoopOutputs, SetupRemoteFacilities, SubscriberHelper,
    SubscriptionProtocol,
};
pub use flow::ShutdownSignal;
pub use framing::{ByteDataHookPair, ByteDataWithTopic, HookPairFactory};
pub use heartbeat::{AddSubscription, HeartbeatInput, HeartbeatMessage, HeartbeatTracker};
pub use locator::ConnectionLocator;
