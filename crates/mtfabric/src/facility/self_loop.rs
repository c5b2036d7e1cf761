// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Priming-request feedback wiring.
//!
//! Plugs a discovered facility into a caller so that every `Register`
//! automatically issues one initial ("priming") request against the new
//! connection, and the first reply matching the caller's predicate marks
//! that registration complete. The cycle is expressed as a straight
//! pipeline with an explicit feedback edge: actions feed the facility,
//! the facility's extra output feeds the priming requests back into its
//! own order input.

use crate::flow::{self, spawn_worker, Sink, Source, WorkerHandle};
use crate::locator::ConnectionLocator;
use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::remote::{KeyedReply, RemoteFacility};
use super::{FacilityActionType, RemoteFacilityAction};

const LOOP_POLL: Duration = Duration::from_millis(100);

/// Caller-supplied pieces of one self-loop.
pub struct SelfLoopConfig<I, O> {
    /// Thunk producing the priming request for a fresh connection.
    pub initial_input: Arc<dyn Fn() -> I + Send + Sync>,
    /// Predicate picking the reply that completes a registration.
    pub initial_callback: Arc<dyn Fn(&I, &O) -> bool + Send + Sync>,
}

// Manual impl: the derive would demand Clone from I and O, but only the
// shared callbacks are cloned.
impl<I, O> Clone for SelfLoopConfig<I, O> {
    fn clone(&self) -> Self {
        Self {
            initial_input: Arc::clone(&self.initial_input),
            initial_callback: Arc::clone(&self.initial_callback),
        }
    }
}

/// Streams a wired self-loop exposes to its caller.
pub struct SelfLoopOutputs<I, O> {
    /// Every keyed reply, priming replies included.
    pub replies: Source<KeyedReply<I, O>>,
    /// `(locator, true)` on register results, `(locator, false)` on
    /// deregister results.
    pub connection_changes: Source<(ConnectionLocator, bool)>,
    /// One locator per completed registration.
    pub completions: Source<ConnectionLocator>,
}

/// A wired self-loop; dropping it stops its worker threads.
pub struct SelfLoop<I, O> {
    facility: Arc<RemoteFacility<I, O>>,
    workers: Vec<WorkerHandle>,
}

impl<I, O> SelfLoop<I, O>
where
    I: Serialize + Clone + Send + Sync + 'static,
    O: DeserializeOwned + Send + 'static,
{
    /// Wire `actions -> facility -> extra output -> priming feedback`.
    ///
    /// `gate`, when present, holds back action consumption until one
    /// token arrives (used to sequence facility bring-up); `ready`
    /// receives one token at the loop's first completed registration.
    pub fn wire(
        facility: Arc<RemoteFacility<I, O>>,
        actions: Source<Vec<RemoteFacilityAction>>,
        config: SelfLoopConfig<I, O>,
        gate: Option<Source<()>>,
        ready: Option<Sink<()>>,
    ) -> (Self, SelfLoopOutputs<I, O>) {
        let name = facility.name().to_string();
        let (replies_tx, replies_rx) = flow::edge();
        let (changes_tx, changes_rx) = flow::edge();
        let (completions_tx, completions_rx) = flow::edge();
        // Outstanding priming orders: correlation id -> locator.
        let priming: Arc<Mutex<HashMap<Uuid, ConnectionLocator>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let feeder = {
            let facility = Arc::clone(&facility);
            spawn_worker(&format!("selfloop-{}-actions", name), move |stop| {
                if let Some(gate) = gate {
                    loop {
                        match gate.recv_timeout(LOOP_POLL) {
                            Ok(()) => break,
                            Err(RecvTimeoutError::Timeout) => {
                                if stop.is_stopped() {
                                    return;
                                }
                            }
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }
                }
                while !stop.is_stopped() {
                    match actions.recv_timeout(LOOP_POLL) {
                        Ok(batch) => {
                            for action in batch {
                                facility.apply_action(action);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
        };

        let primer = {
            let facility = Arc::clone(&facility);
            let extra = facility.extra_output();
            let priming = Arc::clone(&priming);
            let initial_input = Arc::clone(&config.initial_input);
            spawn_worker(&format!("selfloop-{}-extra", name), move |stop| {
                while !stop.is_stopped() {
                    let result = match extra.recv_timeout(LOOP_POLL) {
                        Ok(result) => result,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let locator = result.action.locator.clone();
                    match result.action.action_type {
                        FacilityActionType::Register => {
                            // The register result means the session is
                            // materially open, so the priming order cannot
                            // outrun it through the serialized dispatcher.
                            // Record the id before submitting so the reply
                            // cannot beat the bookkeeping.
                            let key = super::OrderKey::designated(locator.clone());
                            priming.lock().insert(key.id, locator.clone());
                            facility.submit(key, initial_input());
                            let _ = changes_tx.send((locator, true));
                        }
                        FacilityActionType::Deregister => {
                            priming.lock().retain(|_, l| *l != locator);
                            let _ = changes_tx.send((locator, false));
                        }
                        FacilityActionType::NoChange => {}
                    }
                }
            })
        };

        let forwarder = {
            let orders = facility.order_output();
            let priming = Arc::clone(&priming);
            let callback = Arc::clone(&config.initial_callback);
            spawn_worker(&format!("selfloop-{}-replies", name), move |stop| {
                let mut ready = ready;
                while !stop.is_stopped() {
                    let reply = match orders.recv_timeout(LOOP_POLL) {
                        Ok(reply) => reply,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    if let Ok(output) = &reply.result {
                        let is_priming = priming.lock().contains_key(&reply.key.id);
                        if is_priming && callback(&reply.input, output) {
                            if let Some(locator) = priming.lock().remove(&reply.key.id) {
                                let _ = completions_tx.send(locator);
                                if let Some(sink) = ready.take() {
                                    let _ = sink.send(());
                                }
                            }
                        }
                    }
                    // Every reply flows through, priming ones included.
                    if replies_tx.send(reply).is_err() {
                        break;
                    }
                }
            })
        };

        (
            Self {
                facility,
                workers: vec![feeder, primer, forwarder],
            },
            SelfLoopOutputs {
                replies: replies_rx,
                connection_changes: changes_rx,
                completions: completions_rx,
            },
        )
    }

    /// The facility this loop drives.
    pub fn facility(&self) -> &Arc<RemoteFacility<I, O>> {
        &self.facility
    }

    /// Stop the loop's workers without touching the facility.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}
