// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC session plumbing.
//!
//! The fabric does not bind concrete RPC client libraries; it specifies
//! the adapter contract. An [`RpcConnector`] opens a channel to one
//! locator and is handed a [`ReplySender`] through which the adapter
//! delivers correlated replies (and failures) asynchronously. The
//! facility wraps each open channel in a [`Session`]: a dedicated worker
//! thread fed through an internal queue, so adapter `send` calls never
//! block the facility dispatcher.

use crate::config::SESSION_POLL;
use crate::error::TransportError;
use crate::flow::{Sink, Source};
use crate::locator::ConnectionLocator;
use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

use super::FacilityConnectionType;

/// One correlated reply from a session.
#[derive(Clone, Debug)]
pub struct ReplyEnvelope {
    pub correlation_id: Uuid,
    pub payload: Vec<u8>,
    /// Final replies clear the pending order; streaming facilities send
    /// any number of non-final replies first.
    pub is_final: bool,
}

impl ReplyEnvelope {
    pub fn new(correlation_id: Uuid, payload: Vec<u8>, is_final: bool) -> Self {
        Self {
            correlation_id,
            payload,
            is_final,
        }
    }
}

/// Event delivered from a session into the owning facility.
#[derive(Debug)]
pub(crate) struct SessionEvent {
    pub(crate) locator: ConnectionLocator,
    pub(crate) kind: SessionEventKind,
}

#[derive(Debug)]
pub(crate) enum SessionEventKind {
    Reply(ReplyEnvelope),
    /// The session broke; the facility closes it like a `Deregister`.
    Failed(TransportError),
}

pub(crate) type SessionEventSink = Sink<SessionEvent>;
pub(crate) type SessionEventSource = Source<SessionEvent>;

/// Handle an adapter uses to deliver replies for one session.
///
/// Clone freely; adapters typically move a clone into their receive
/// machinery. Delivery after facility shutdown is silently dropped.
#[derive(Clone)]
pub struct ReplySender {
    locator: ConnectionLocator,
    sink: SessionEventSink,
}

impl ReplySender {
    pub(crate) fn new(locator: ConnectionLocator, sink: SessionEventSink) -> Self {
        Self { locator, sink }
    }

    /// The locator this sender reports for.
    pub fn locator(&self) -> &ConnectionLocator {
        &self.locator
    }

    /// Deliver one correlated reply.
    pub fn reply(&self, envelope: ReplyEnvelope) {
        let _ = self.sink.send(SessionEvent {
            locator: self.locator.clone(),
            kind: SessionEventKind::Reply(envelope),
        });
    }

    /// Report the session as broken; the facility will close it.
    pub fn fail(&self, error: TransportError) {
        let _ = self.sink.send(SessionEvent {
            locator: self.locator.clone(),
            kind: SessionEventKind::Failed(error),
        });
    }
}

/// Adapter contract: open RPC channels over one connection type.
pub trait RpcConnector: Send + Sync {
    /// Open a channel to `locator`.
    ///
    /// Replies arrive through `replies` at any later point; the returned
    /// channel only carries the outgoing direction.
    fn connect(
        &self,
        locator: &ConnectionLocator,
        replies: ReplySender,
    ) -> Result<Box<dyn RpcChannel>, TransportError>;
}

/// Outgoing half of one open RPC channel.
pub trait RpcChannel: Send {
    /// Send one correlated request payload.
    fn send(&mut self, correlation_id: Uuid, payload: &[u8]) -> Result<(), TransportError>;

    /// Release the channel; called once before the session worker exits.
    fn close(&mut self);
}

/// Process-scoped registry mapping connection types to adapters.
#[derive(Default)]
pub struct ConnectorRegistry {
    inner: Mutex<HashMap<FacilityConnectionType, Arc<dyn RpcConnector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        connection_type: FacilityConnectionType,
        connector: Arc<dyn RpcConnector>,
    ) {
        self.inner.lock().insert(connection_type, connector);
    }

    pub fn resolve(
        &self,
        connection_type: FacilityConnectionType,
    ) -> Option<Arc<dyn RpcConnector>> {
        self.inner.lock().get(&connection_type).map(Arc::clone)
    }
}

// ===== Session worker =====

pub(crate) enum SessionCommand {
    Send(Uuid, Vec<u8>),
    Close,
}

/// One open RPC session: a channel plus its dedicated worker thread.
pub(crate) struct Session {
    locator: ConnectionLocator,
    queue: Sink<SessionCommand>,
    thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Open a channel through `connector` and start its worker.
    pub(crate) fn open(
        facility_name: &str,
        connector: &dyn RpcConnector,
        locator: ConnectionLocator,
        events: SessionEventSink,
    ) -> Result<Self, TransportError> {
        let replies = ReplySender::new(locator.clone(), events.clone());
        let mut channel = connector.connect(&locator, replies)?;

        let (queue_tx, queue_rx) = crossbeam::channel::unbounded::<SessionCommand>();
        let worker_locator = locator.clone();
        let thread = thread::Builder::new()
            .name(format!("facility-{}-{}", facility_name, locator.host_and_port()))
            .spawn(move || {
                run_session(channel.as_mut(), &worker_locator, &queue_rx, &events);
                channel.close();
            })
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        Ok(Self {
            locator,
            queue: queue_tx,
            thread: Some(thread),
        })
    }

    pub(crate) fn locator(&self) -> &ConnectionLocator {
        &self.locator
    }

    /// Hand one outgoing request to the worker.
    ///
    /// Returns `false` if the worker already exited.
    pub(crate) fn submit(&self, correlation_id: Uuid, payload: Vec<u8>) -> bool {
        self.queue
            .send(SessionCommand::Send(correlation_id, payload))
            .is_ok()
    }

    /// Stop the worker and join it.
    pub(crate) fn close(mut self) {
        let _ = self.queue.send(SessionCommand::Close);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.queue.send(SessionCommand::Close);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_session(
    channel: &mut dyn RpcChannel,
    locator: &ConnectionLocator,
    queue: &Source<SessionCommand>,
    events: &SessionEventSink,
) {
    loop {
        match queue.recv_timeout(SESSION_POLL) {
            Ok(SessionCommand::Send(correlation_id, payload)) => {
                if let Err(e) = channel.send(correlation_id, &payload) {
                    log::warn!("[facility] send failed on {}: {}", locator, e);
                    let _ = events.send(SessionEvent {
                        locator: locator.clone(),
                        kind: SessionEventKind::Failed(e),
                    });
                    break;
                }
            }
            Ok(SessionCommand::Close) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;
    use std::time::Duration;

    struct EchoConnector;

    impl RpcConnector for EchoConnector {
        fn connect(
            &self,
            _locator: &ConnectionLocator,
            replies: ReplySender,
        ) -> Result<Box<dyn RpcChannel>, TransportError> {
            Ok(Box::new(EchoChannel { replies }))
        }
    }

    struct EchoChannel {
        replies: ReplySender,
    }

    impl RpcChannel for EchoChannel {
        fn send(&mut self, correlation_id: Uuid, payload: &[u8]) -> Result<(), TransportError> {
            self.replies
                .reply(ReplyEnvelope::new(correlation_id, payload.to_vec(), true));
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn session_round_trip() {
        let (events_tx, events_rx) = flow::edge();
        let locator = ConnectionLocator::new("h", 1);
        let session = Session::open("test", &EchoConnector, locator.clone(), events_tx)
            .expect("session should open");

        let id = Uuid::new_v4();
        assert!(session.submit(id, b"ping".to_vec()));

        let event = events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("reply should arrive");
        assert_eq!(event.locator, locator);
        match event.kind {
            SessionEventKind::Reply(env) => {
                assert_eq!(env.correlation_id, id);
                assert_eq!(env.payload, b"ping");
                assert!(env.is_final);
            }
            SessionEventKind::Failed(e) => panic!("unexpected failure: {}", e),
        }

        session.close();
    }

    struct BrokenConnector;

    impl RpcConnector for BrokenConnector {
        fn connect(
            &self,
            _locator: &ConnectionLocator,
            _replies: ReplySender,
        ) -> Result<Box<dyn RpcChannel>, TransportError> {
            Ok(Box::new(BrokenChannel))
        }
    }

    struct BrokenChannel;

    impl RpcChannel for BrokenChannel {
        fn send(&mut self, _id: Uuid, _payload: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn send_failure_reports_and_stops_worker() {
        let (events_tx, events_rx) = flow::edge();
        let locator = ConnectionLocator::new("h", 2);
        let session = Session::open("test", &BrokenConnector, locator.clone(), events_tx)
            .expect("session should open");

        session.submit(Uuid::new_v4(), b"ping".to_vec());
        let event = events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("failure event should arrive");
        assert!(matches!(event.kind, SessionEventKind::Failed(_)));

        session.close();
    }

    #[test]
    fn registry_resolves_registered_connector() {
        let registry = ConnectorRegistry::new();
        assert!(registry.resolve(FacilityConnectionType::Redis).is_none());
        registry.register(FacilityConnectionType::Redis, Arc::new(EchoConnector));
        assert!(registry.resolve(FacilityConnectionType::Redis).is_some());
    }
}
