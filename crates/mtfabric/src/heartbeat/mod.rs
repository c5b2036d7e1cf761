// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer heartbeat announcements.
//!
//! Every fabric node periodically broadcasts a [`HeartbeatMessage`]
//! advertising the facility channels it serves. Consumers feed observed
//! heartbeats plus clock ticks into a [`HeartbeatTracker`], which derives
//! `Register`/`Deregister` actions for the facilities they care about.

pub mod tracker;

pub use tracker::{build_status_info, parse_status_info, HeartbeatInput, HeartbeatTracker};

use crate::broadcast::{BroadcastChannelSpec, BroadcastRouter, TopicFilter, TypedDataWithTopic};
use crate::error::Error;
use crate::flow::{self, spawn_worker, Source, WorkerHandle};
use crate::framing::{UserToWireHook, WireToUserHook};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Periodic broadcast announcing a peer's live facility channels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Logical name of the announcing process.
    pub sender_name: String,
    /// Sender-side wall clock, milliseconds since the Unix epoch.
    /// Trackers key liveness off the *observed* time, not this field.
    pub timestamp_millis: u64,
    /// Host the sender runs on.
    pub host: String,
    /// facility name -> facility channel spec (e.g. `redis://h:6379`).
    pub facility_channels: BTreeMap<String, String>,
    /// Free-form per-component status lines.
    pub status_details: BTreeMap<String, String>,
}

impl HeartbeatMessage {
    /// Create a heartbeat stamped with the current wall clock.
    pub fn new(sender_name: impl Into<String>, host: impl Into<String>) -> Self {
        let timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            sender_name: sender_name.into(),
            timestamp_millis,
            host: host.into(),
            facility_channels: BTreeMap::new(),
            status_details: BTreeMap::new(),
        }
    }

    /// Builder-style facility channel advertisement.
    #[must_use]
    pub fn with_facility_channel(
        mut self,
        facility: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        self.facility_channels.insert(facility.into(), channel.into());
        self
    }
}

/// One value of this bootstraps the heartbeat listener: which broadcast
/// channel to join and which topics to admit.
#[derive(Clone, Debug)]
pub struct AddSubscription {
    pub channel: BroadcastChannelSpec,
    pub topic: TopicFilter,
}

/// Subscribe to a heartbeat channel and expose decoded messages as a
/// flow source.
///
/// Payloads that fail to decode as [`HeartbeatMessage`] are dropped by
/// the underlying typed importer. The returned worker relays messages
/// until it is dropped.
pub fn listen(
    router: &BroadcastRouter,
    subscription: &AddSubscription,
    hook: Option<WireToUserHook>,
) -> Result<(Source<HeartbeatMessage>, WorkerHandle), Error> {
    let typed: Source<TypedDataWithTopic<HeartbeatMessage>> =
        router.typed_importer(&subscription.channel, subscription.topic.clone(), hook)?;
    let (tx, rx) = flow::edge();
    // Strip the topic; trackers only consume the message body.
    let relay = spawn_worker("heartbeat-listen", move |stop| {
        while !stop.is_stopped() {
            match typed.recv_timeout(Duration::from_millis(100)) {
                Ok(data) => {
                    if tx.send(data.content).is_err() {
                        break;
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    });
    Ok((rx, relay))
}

/// Periodically broadcast this process's own heartbeat.
///
/// `message_factory` is invoked on every period so advertised channels and
/// status details can change over time. The returned handle stops the
/// announcer when dropped.
pub fn announce(
    router: &BroadcastRouter,
    channel: &BroadcastChannelSpec,
    topic: impl Into<String>,
    period: Duration,
    message_factory: Arc<dyn Fn() -> HeartbeatMessage + Send + Sync>,
    hook: Option<UserToWireHook>,
) -> Result<WorkerHandle, Error> {
    let publish = router.typed_publisher::<HeartbeatMessage>(channel, hook)?;
    let topic = topic.into();
    Ok(spawn_worker("heartbeat-announce", move |stop| {
        while !stop.wait_for(period) {
            publish(TypedDataWithTopic {
                topic: topic.clone(),
                content: message_factory(),
            });
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing;

    #[test]
    fn heartbeat_message_cbor_round_trip() {
        let msg = HeartbeatMessage::new("svc1", "hostA")
            .with_facility_channel("f", "redis://h:6379")
            .with_facility_channel("g", "zeromq://h:5561");

        let wire = serde_cbor::to_vec(&msg).expect("encode");
        let back: HeartbeatMessage = serde_cbor::from_slice(&wire).expect("decode");
        assert_eq!(back, msg);
    }

    #[test]
    fn heartbeat_frames_like_any_broadcast_payload() {
        let msg = HeartbeatMessage::new("svc1", "hostA");
        let content = serde_cbor::to_vec(&msg).expect("encode");
        let frame = framing::encode_frame(&framing::ByteDataWithTopic::new(
            "heartbeats",
            content,
        ));
        let data = framing::decode_frame(&frame).expect("frame decode");
        let back: HeartbeatMessage = serde_cbor::from_slice(&data.content).expect("decode");
        assert_eq!(back.sender_name, "svc1");
    }
}
