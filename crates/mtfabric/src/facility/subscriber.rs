// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Long-lived subscription lifecycle helper.
//!
//! Subscription facilities hand out a server-assigned subscription ID on
//! the first accepted subscribe. This helper stores one ID per live
//! connection, drops IDs for connections that go away, replays paired
//! unsubscribes on an exit trigger, and raises the shared exit signal
//! once the last subscription is acknowledged gone.

use crate::flow::{spawn_worker, ShutdownSignal, Source, WorkerHandle};
use crate::locator::ConnectionLocator;
use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::remote::RemoteFacility;
use super::self_loop::SelfLoopOutputs;

const HELPER_POLL: Duration = Duration::from_millis(100);

/// Shape of a subscription facility's request/reply protocol.
///
/// `Output` values are classified three ways: subscription acks (carrying
/// the server-assigned ID), unsubscription acks (carrying the original
/// ID), and ordinary data, which this helper passes through untouched.
pub trait SubscriptionProtocol: Send + Sync + 'static {
    type Input: Serialize + Clone + Send + Sync + 'static;
    type Output: DeserializeOwned + Send + 'static;
    type Id: Clone + PartialEq + Send + 'static;

    /// The server-assigned ID if `output` is a subscription ack.
    fn subscription_id(output: &Self::Output) -> Option<Self::Id>;

    /// The original subscription ID if `output` is an unsubscription ack.
    fn unsubscribed_id(output: &Self::Output) -> Option<Self::Id>;

    /// Build the unsubscribe request for a stored ID.
    fn unsubscribe(id: Self::Id) -> Self::Input;
}

/// Tracks subscription IDs per connection and replays unsubscribes.
pub struct SubscriberHelper<P: SubscriptionProtocol> {
    id_map: Arc<Mutex<HashMap<ConnectionLocator, P::Id>>>,
    workers: Vec<WorkerHandle>,
}

impl<P: SubscriptionProtocol> SubscriberHelper<P> {
    /// Attach the helper to a wired self-loop.
    ///
    /// Consumes the loop's reply and connection-change streams; the
    /// returned source carries every reply onward to the caller.
    /// `exit_trigger` starts the unsubscribe drain; `shutdown` is raised
    /// once the ID map is empty.
    pub fn attach(
        facility: Arc<RemoteFacility<P::Input, P::Output>>,
        outputs: SelfLoopOutputs<P::Input, P::Output>,
        exit_trigger: Source<()>,
        shutdown: ShutdownSignal,
    ) -> (Self, Source<super::KeyedReply<P::Input, P::Output>>) {
        let id_map: Arc<Mutex<HashMap<ConnectionLocator, P::Id>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (forward_tx, forward_rx) = crate::flow::edge();
        let name = facility.name().to_string();

        let reply_watcher = {
            let id_map = Arc::clone(&id_map);
            let shutdown = shutdown.clone();
            let replies = outputs.replies;
            spawn_worker(&format!("subhelper-{}-replies", name), move |stop| {
                while !stop.is_stopped() {
                    let reply = match replies.recv_timeout(HELPER_POLL) {
                        Ok(reply) => reply,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    if let Ok(output) = &reply.result {
                        if let Some(id) = P::subscription_id(output) {
                            if let Some(locator) = &reply.key.target {
                                // First accepted subscribe per connection
                                // wins; later acks do not overwrite.
                                id_map.lock().entry(locator.clone()).or_insert(id);
                            }
                        } else if let Some(id) = P::unsubscribed_id(output) {
                            let mut map = id_map.lock();
                            map.retain(|_, stored| *stored != id);
                            if map.is_empty() {
                                shutdown.request_exit();
                            }
                        }
                    }
                    if forward_tx.send(reply).is_err() {
                        break;
                    }
                }
            })
        };

        let connection_watcher = {
            let id_map = Arc::clone(&id_map);
            let changes = outputs.connection_changes;
            spawn_worker(&format!("subhelper-{}-connections", name), move |stop| {
                while !stop.is_stopped() {
                    match changes.recv_timeout(HELPER_POLL) {
                        Ok((locator, false)) => {
                            // Server is gone; no unsubscribe needed.
                            id_map.lock().remove(&locator);
                        }
                        Ok((_, true)) => {}
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
        };

        let exit_drainer = {
            let id_map = Arc::clone(&id_map);
            let shutdown = shutdown.clone();
            spawn_worker(&format!("subhelper-{}-exit", name), move |stop| {
                loop {
                    match exit_trigger.recv_timeout(HELPER_POLL) {
                        Ok(()) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if stop.is_stopped() {
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                let snapshot: Vec<(ConnectionLocator, P::Id)> = {
                    let map = id_map.lock();
                    map.iter().map(|(l, id)| (l.clone(), id.clone())).collect()
                };
                if snapshot.is_empty() {
                    shutdown.request_exit();
                    return;
                }
                for (locator, id) in snapshot {
                    facility.call_designated(locator, P::unsubscribe(id));
                }
            })
        };

        (
            Self {
                id_map,
                workers: vec![reply_watcher, connection_watcher, exit_drainer],
            },
            forward_rx,
        )
    }

    /// Atomic snapshot of the stored IDs.
    pub fn ids(&self) -> HashMap<ConnectionLocator, P::Id> {
        self.id_map.lock().clone()
    }

    /// Stop the helper's workers.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}
