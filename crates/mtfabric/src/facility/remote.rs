// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-transport remote facility.
//!
//! A stateful request/response node with three I/O ports:
//!
//! - **action input** absorbs `Register`/`Deregister`/`NoChange` actions
//!   and maintains the live session set,
//! - **order input** takes keyed requests and dispatches them over one of
//!   the live sessions,
//! - **order output** carries keyed replies, with lifecycle results on a
//!   separate extra output.
//!
//! Actions and orders flow through one dispatcher thread, so action
//! application is serialized and no order is issued against a locator
//! before its `Register` has completed. A second thread routes correlated
//! replies from sessions back to caller keys.

use crate::error::DispatchError;
use crate::flow::{self, Sink, Source, StopFlag};
use crate::framing::{ByteDataHookPair, HookPairFactory, WireToUserHook};
use crate::locator::ConnectionLocator;
use crossbeam::channel::RecvTimeoutError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::session::{
    ConnectorRegistry, Session, SessionEventKind, SessionEventSink, SessionEventSource,
};
use super::{DispatchStrategy, FacilityActionType, RemoteFacilityAction, RemoteFacilityActionResult};

/// Caller-assigned correlation key for one order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderKey {
    pub id: Uuid,
    /// Designated dispatch names the exact session; `None` under Random.
    pub target: Option<ConnectionLocator>,
}

impl OrderKey {
    pub fn random_dispatch() -> Self {
        Self {
            id: Uuid::new_v4(),
            target: None,
        }
    }

    pub fn designated(locator: ConnectionLocator) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: Some(locator),
        }
    }
}

/// A keyed reply on the order output, preserving the caller's key.
#[derive(Clone, Debug)]
pub struct KeyedReply<I, O> {
    pub key: OrderKey,
    /// The original input, echoed back so Designated callers get the full
    /// `(locator, input)` key shape.
    pub input: I,
    pub result: Result<O, DispatchError>,
    pub is_final: bool,
}

enum FacilityInput<I> {
    Action(RemoteFacilityAction),
    Order(OrderKey, I),
    SessionFailed(ConnectionLocator),
}

struct PendingOrder<I> {
    target: Option<ConnectionLocator>,
    input: I,
}

/// Per-channel RPC facility owning a set of live sessions.
pub struct RemoteFacility<I, O> {
    name: String,
    strategy: DispatchStrategy,
    stop: Arc<StopFlag>,
    input_tx: Sink<FacilityInput<I>>,
    extra_rx: Source<RemoteFacilityActionResult>,
    order_rx: Source<KeyedReply<I, O>>,
    // Mirror of the dispatcher's live set, for introspection only.
    live_view: Arc<Mutex<Vec<ConnectionLocator>>>,
    pending: Arc<DashMap<Uuid, PendingOrder<I>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl<I, O> RemoteFacility<I, O>
where
    I: Serialize + Clone + Send + Sync + 'static,
    O: DeserializeOwned + Send + 'static,
{
    /// Create a facility for one logical channel.
    ///
    /// `connectors` supplies the RPC adapters per connection type;
    /// `hook_factory` is consulted once per session open.
    pub fn new(
        name: impl Into<String>,
        strategy: DispatchStrategy,
        connectors: Arc<ConnectorRegistry>,
        hook_factory: Option<HookPairFactory>,
    ) -> Self {
        let name = name.into();
        let stop = Arc::new(StopFlag::new());
        let (input_tx, input_rx) = flow::edge::<FacilityInput<I>>();
        let (extra_tx, extra_rx) = flow::edge();
        let (order_tx, order_rx) = flow::edge();
        let (event_tx, event_rx) = flow::edge();
        let pending: Arc<DashMap<Uuid, PendingOrder<I>>> = Arc::new(DashMap::new());
        let wire_hooks: Arc<DashMap<ConnectionLocator, WireToUserHook>> = Arc::new(DashMap::new());
        let live_view = Arc::new(Mutex::new(Vec::new()));

        let dispatcher = {
            let mut state = DispatcherState {
                name: name.clone(),
                strategy,
                connectors,
                hook_factory,
                live: Vec::new(),
                user_hooks: Vec::new(),
                pending: Arc::clone(&pending),
                wire_hooks: Arc::clone(&wire_hooks),
                live_view: Arc::clone(&live_view),
                event_tx,
                extra_tx,
                order_tx: order_tx.clone(),
            };
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("facility-{}-dispatch", name))
                .spawn(move || state.run(&input_rx, &stop))
                .expect("failed to spawn facility dispatcher")
        };

        let router = {
            let name = name.clone();
            let stop = Arc::clone(&stop);
            let input_tx = input_tx.clone();
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name(format!("facility-{}-replies", name))
                .spawn(move || {
                    run_reply_router(&name, &event_rx, &pending, &wire_hooks, &order_tx, &input_tx, &stop)
                })
                .expect("failed to spawn facility reply router")
        };

        Self {
            name,
            strategy,
            stop,
            input_tx,
            extra_rx,
            order_rx,
            live_view,
            pending,
            dispatcher: Mutex::new(Some(dispatcher)),
            router: Mutex::new(Some(router)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    /// Absorb one discovery action. Dropped silently after shutdown.
    pub fn apply_action(&self, action: RemoteFacilityAction) {
        if self.stop.is_stopped() {
            return;
        }
        let _ = self.input_tx.send(FacilityInput::Action(action));
    }

    /// Submit an order under Random dispatch; returns its correlation id.
    pub fn call(&self, input: I) -> Uuid {
        let key = OrderKey::random_dispatch();
        let id = key.id;
        self.submit(key, input);
        id
    }

    /// Submit an order to the exact session for `locator`.
    pub fn call_designated(&self, locator: ConnectionLocator, input: I) -> Uuid {
        let key = OrderKey::designated(locator);
        let id = key.id;
        self.submit(key, input);
        id
    }

    /// Submit an order with a caller-built key. Dropped after shutdown.
    pub fn submit(&self, key: OrderKey, input: I) {
        if self.stop.is_stopped() {
            return;
        }
        let _ = self.input_tx.send(FacilityInput::Order(key, input));
    }

    /// Lifecycle results: one per action that materially took effect.
    pub fn extra_output(&self) -> Source<RemoteFacilityActionResult> {
        self.extra_rx.clone()
    }

    /// Keyed replies, preserving caller correlation keys.
    pub fn order_output(&self) -> Source<KeyedReply<I, O>> {
        self.order_rx.clone()
    }

    /// Locators with a currently live session.
    pub fn live_locators(&self) -> Vec<ConnectionLocator> {
        self.live_view.lock().clone()
    }

    /// Orders still awaiting a final reply.
    pub fn pending_orders(&self) -> usize {
        self.pending.len()
    }

    /// Stop both worker threads and close every session.
    pub fn shutdown(&self) {
        self.stop.stop();
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.router.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<I, O> Drop for RemoteFacility<I, O> {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.router.lock().take() {
            let _ = handle.join();
        }
    }
}

// ===== Dispatcher thread =====

struct DispatcherState<I, O> {
    name: String,
    strategy: DispatchStrategy,
    connectors: Arc<ConnectorRegistry>,
    hook_factory: Option<HookPairFactory>,
    // Ordered live set; at most one entry per locator.
    live: Vec<Session>,
    // user->wire hooks aligned with `live` by index.
    user_hooks: Vec<Option<ByteDataHookPair>>,
    pending: Arc<DashMap<Uuid, PendingOrder<I>>>,
    wire_hooks: Arc<DashMap<ConnectionLocator, WireToUserHook>>,
    live_view: Arc<Mutex<Vec<ConnectionLocator>>>,
    event_tx: SessionEventSink,
    extra_tx: Sink<RemoteFacilityActionResult>,
    order_tx: Sink<KeyedReply<I, O>>,
}

impl<I, O> DispatcherState<I, O>
where
    I: Serialize + Clone + Send + 'static,
    O: Send + 'static,
{
    fn run(&mut self, input_rx: &Source<FacilityInput<I>>, stop: &StopFlag) {
        while !stop.is_stopped() {
            match input_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(FacilityInput::Action(action)) => self.handle_action(action),
                Ok(FacilityInput::Order(key, input)) => self.handle_order(key, input),
                Ok(FacilityInput::SessionFailed(locator)) => self.drop_session(&locator),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for session in self.live.drain(..) {
            session.close();
        }
        self.user_hooks.clear();
        self.wire_hooks.clear();
        self.pending.clear();
        self.refresh_live_view();
    }

    fn handle_action(&mut self, action: RemoteFacilityAction) {
        match action.action_type {
            FacilityActionType::Register => self.register(action),
            FacilityActionType::Deregister => self.deregister(action),
            FacilityActionType::NoChange => {}
        }
    }

    fn register(&mut self, action: RemoteFacilityAction) {
        if self.find_session(&action.locator).is_some() {
            // Already live; keep the invariant of one session per locator.
            log::debug!(
                "[facility:{}] ignoring duplicate register for {}",
                self.name,
                action.locator
            );
            return;
        }
        let connector = match self.connectors.resolve(action.connection_type) {
            Some(connector) => connector,
            None => {
                log::error!(
                    "[facility:{}] no connector registered for '{}', cannot register {}",
                    self.name,
                    action.connection_type,
                    action.locator
                );
                return;
            }
        };

        let hooks = self
            .hook_factory
            .as_ref()
            .and_then(|factory| factory.as_ref()(&self.name, &action.locator));

        let started = Instant::now();
        match Session::open(
            &self.name,
            connector.as_ref(),
            action.locator.clone(),
            self.event_tx.clone(),
        ) {
            Ok(session) => {
                log::info!("[facility:{}] registered {}", self.name, action.locator);
                if let Some(pair) = &hooks {
                    self.wire_hooks
                        .insert(action.locator.clone(), Arc::clone(&pair.wire_to_user));
                }
                self.live.push(session);
                self.user_hooks.push(hooks);
                self.refresh_live_view();
                let _ = self.extra_tx.send(RemoteFacilityActionResult {
                    action,
                    round_trip: started.elapsed(),
                });
            }
            Err(e) => {
                // No result is emitted, so the discovery loop re-registers
                // on the next Register action from the tracker.
                log::warn!(
                    "[facility:{}] failed to open session to {}: {}",
                    self.name,
                    action.locator,
                    e
                );
            }
        }
    }

    fn deregister(&mut self, action: RemoteFacilityAction) {
        let started = Instant::now();
        if self.remove_session(&action.locator) {
            log::info!("[facility:{}] deregistered {}", self.name, action.locator);
            let _ = self.extra_tx.send(RemoteFacilityActionResult {
                action,
                round_trip: started.elapsed(),
            });
        }
    }

    fn drop_session(&mut self, locator: &ConnectionLocator) {
        if self.remove_session(locator) {
            // Equivalent to a Deregister but without a result: the
            // liveness change surfaces through the tracker on its next
            // tick.
            log::warn!(
                "[facility:{}] session to {} failed and was closed",
                self.name,
                locator
            );
        }
    }

    fn remove_session(&mut self, locator: &ConnectionLocator) -> bool {
        match self.find_session(locator) {
            Some(idx) => {
                let session = self.live.remove(idx);
                self.user_hooks.remove(idx);
                self.wire_hooks.remove(locator);
                session.close();
                self.refresh_live_view();
                true
            }
            None => false,
        }
    }

    fn handle_order(&mut self, key: OrderKey, input: I) {
        let idx = match self.strategy {
            DispatchStrategy::Random => {
                if self.live.is_empty() {
                    // Canonical behavior: the request is dropped.
                    log::debug!(
                        "[facility:{}] dropping order {}: no live session",
                        self.name,
                        key.id
                    );
                    return;
                }
                // Explicit snapshot under the dispatcher's ownership of
                // the live set; no lock ordering concerns.
                fastrand::usize(..self.live.len())
            }
            DispatchStrategy::Designated => {
                let target = match &key.target {
                    Some(target) => target,
                    None => {
                        log::error!(
                            "[facility:{}] designated order {} carries no locator",
                            self.name,
                            key.id
                        );
                        self.fail_order(key.clone(), input, DispatchError::NoLiveSession);
                        return;
                    }
                };
                match self.find_session(target) {
                    Some(idx) => idx,
                    None => {
                        let target = target.clone();
                        self.fail_order(key, input, DispatchError::NoSuchConnection(target));
                        return;
                    }
                }
            }
        };

        let payload = match serde_cbor::to_vec(&input) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!(
                    "[facility:{}] failed to encode order {}: {}",
                    self.name,
                    key.id,
                    e
                );
                return;
            }
        };
        let payload = match &self.user_hooks[idx] {
            Some(pair) => (pair.user_to_wire)(payload),
            None => payload,
        };

        self.pending.insert(
            key.id,
            PendingOrder {
                target: key.target.clone(),
                input,
            },
        );
        let submitted = self.live[idx].submit(key.id, payload);
        if !submitted {
            // Worker already exited; close out the session like a failure.
            self.pending.remove(&key.id);
            let locator = self.live[idx].locator().clone();
            self.drop_session(&locator);
        }
    }

    fn fail_order(&self, key: OrderKey, input: I, error: DispatchError) {
        let _ = self.order_tx.send(KeyedReply {
            key,
            input,
            result: Err(error),
            is_final: true,
        });
    }

    fn find_session(&self, locator: &ConnectionLocator) -> Option<usize> {
        self.live.iter().position(|s| s.locator() == locator)
    }

    fn refresh_live_view(&self) {
        *self.live_view.lock() = self.live.iter().map(|s| s.locator().clone()).collect();
    }
}

// ===== Reply router thread =====

#[allow(clippy::too_many_arguments)]
fn run_reply_router<I, O>(
    name: &str,
    events: &SessionEventSource,
    pending: &DashMap<Uuid, PendingOrder<I>>,
    wire_hooks: &DashMap<ConnectionLocator, WireToUserHook>,
    order_tx: &Sink<KeyedReply<I, O>>,
    input_tx: &Sink<FacilityInput<I>>,
    stop: &StopFlag,
) where
    I: Clone,
    O: DeserializeOwned,
{
    while !stop.is_stopped() {
        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match event.kind {
            SessionEventKind::Failed(e) => {
                log::debug!("[facility:{}] session {} reported: {}", name, event.locator, e);
                let _ = input_tx.send(FacilityInput::SessionFailed(event.locator));
            }
            SessionEventKind::Reply(envelope) => {
                // A final reply retires its pending entry up front, so a
                // hook-suppressed or undecodable payload below cannot
                // leak the entry for the life of the facility.
                let order = if envelope.is_final {
                    pending.remove(&envelope.correlation_id).map(|(_, order)| order)
                } else {
                    pending.get(&envelope.correlation_id).map(|order| PendingOrder {
                        target: order.target.clone(),
                        input: order.input.clone(),
                    })
                };
                let Some(order) = order else {
                    log::debug!(
                        "[facility:{}] unmatched reply {} from {}",
                        name,
                        envelope.correlation_id,
                        event.locator
                    );
                    continue;
                };
                let key = OrderKey {
                    id: envelope.correlation_id,
                    target: order.target,
                };
                let input = order.input;

                let hook = wire_hooks
                    .get(&event.locator)
                    .map(|entry| Arc::clone(entry.value()));
                let payload = match hook {
                    Some(hook) => match hook(envelope.payload) {
                        Some(payload) => payload,
                        // Hook suppressed this reply for the caller.
                        None => continue,
                    },
                    None => envelope.payload,
                };
                match serde_cbor::from_slice::<O>(&payload) {
                    Ok(output) => {
                        let _ = order_tx.send(KeyedReply {
                            key,
                            input,
                            result: Ok(output),
                            is_final: envelope.is_final,
                        });
                    }
                    Err(e) => {
                        log::debug!(
                            "[facility:{}] dropping undecodable reply {}: {}",
                            name,
                            envelope.correlation_id,
                            e
                        );
                    }
                }
            }
        }
    }
}
