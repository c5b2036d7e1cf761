// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end discovery pipeline: heartbeats broadcast over ZeroMQ feed a
//! facility fleet whose sessions are served by an in-process connector.

use mtfabric::facility::loopback::{LoopbackConnector, LoopbackService};
use mtfabric::facility::session::{ReplyEnvelope, ReplySender};
use mtfabric::{
    AddSubscription, BroadcastChannelSpec, BroadcastRouter, ChannelDescriptor, ConnectionLocator,
    ConnectorRegistry, DispatchStrategy, FacilityConnectionType, HeartbeatMessage, SelfLoopConfig,
    SetupRemoteFacilities, TopicFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Request {
    Subscribe,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Response {
    Subscribed { id: u64 },
}

struct AckServer;

impl LoopbackService for AckServer {
    fn handle(
        &self,
        _locator: &ConnectionLocator,
        correlation_id: Uuid,
        payload: &[u8],
        replies: &ReplySender,
    ) {
        let request: Request = serde_cbor::from_slice(payload).expect("decode request");
        assert_eq!(request, Request::Subscribe);
        let payload = serde_cbor::to_vec(&Response::Subscribed { id: 7 }).expect("encode");
        replies.reply(ReplyEnvelope::new(correlation_id, payload, false));
    }
}

#[test]
fn heartbeats_drive_facility_registration_and_expiry() {
    let router = BroadcastRouter::new();
    let channel = BroadcastChannelSpec::parse("zeromq://localhost:15561").expect("spec");
    let bind = BroadcastChannelSpec::parse("zeromq://*:15561").expect("spec");

    // Peer side: announce facility "subs" at redis://h:1 every 100 ms.
    let announcer = mtfabric::heartbeat::announce(
        &router,
        &bind,
        "heartbeats",
        Duration::from_millis(100),
        Arc::new(|| {
            HeartbeatMessage::new("svc1", "localhost")
                .with_facility_channel("subs", "redis://h:1")
        }),
        None,
    )
    .expect("announcer");

    // Consumer side: listen, then bring up one designated channel.
    let subscription = AddSubscription {
        channel,
        topic: TopicFilter::Exact("heartbeats".to_string()),
    };
    let (heartbeats, _listener) =
        mtfabric::heartbeat::listen(&router, &subscription, None).expect("listener");

    let connectors = Arc::new(ConnectorRegistry::new());
    connectors.register(
        FacilityConnectionType::Redis,
        Arc::new(LoopbackConnector::new(Arc::new(AckServer))),
    );

    let descriptors = vec![ChannelDescriptor::<Request, Response> {
        channel_name: "subs".to_string(),
        strategy: DispatchStrategy::Designated,
        self_loop: Some(SelfLoopConfig {
            initial_input: Arc::new(|| Request::Subscribe),
            initial_callback: Arc::new(|_, response| {
                matches!(response, Response::Subscribed { .. })
            }),
        }),
    }];

    let mut fabric = SetupRemoteFacilities::run(
        heartbeats,
        regex::Regex::new("^svc.*").expect("regex"),
        descriptors,
        Duration::from_secs(1),
        Duration::from_millis(200),
        connectors,
        None,
    )
    .expect("fabric");

    let outputs = fabric.loop_outputs[0].take().expect("designated outputs");
    let expected = ConnectionLocator::new("h", 1);

    // Registration completes once a heartbeat crosses the ZeroMQ hop and
    // the priming reply passes the initial callback.
    let completed = outputs
        .completions
        .recv_timeout(Duration::from_secs(30))
        .expect("registration should complete");
    assert_eq!(completed, expected);
    assert_eq!(fabric.facilities[0].live_locators(), vec![expected.clone()]);

    let change = outputs
        .connection_changes
        .recv_timeout(Duration::from_secs(5))
        .expect("connect event");
    assert_eq!(change, (expected.clone(), true));

    // Peer stops heartbeating; the TTL expiry deregisters the session.
    drop(announcer);
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match outputs.connection_changes.recv_timeout(Duration::from_secs(30)) {
            Ok((locator, false)) => {
                assert_eq!(locator, expected);
                break;
            }
            Ok((_, true)) => {
                assert!(Instant::now() < deadline, "expiry never observed");
            }
            Err(e) => panic!("connection change stream ended: {}", e),
        }
    }
    assert!(fabric.facilities[0].live_locators().is_empty());
}
