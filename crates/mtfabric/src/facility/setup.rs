// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime-indexed bring-up of a facility fleet.
//!
//! Given one heartbeat source and a vector of channel descriptors, this
//! wires the whole discovery pipeline: one tracker per channel, a shared
//! liveness-check clock, a facility per channel, and self-loops for the
//! designated channels. Designated channels come up sequentially (channel
//! `k+1` starts consuming actions after channel `k` completes its first
//! registration) and random-dispatch channels start after the whole
//! designated chain, so priming traffic settles before fan-out traffic
//! begins.

use crate::error::Error;
use crate::flow::{self, spawn_worker, Sink, Source, WorkerHandle};
use crate::framing::HookPairFactory;
use crate::heartbeat::{HeartbeatInput, HeartbeatMessage, HeartbeatTracker};
use crossbeam::channel::select;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::remote::RemoteFacility;
use super::self_loop::{SelfLoop, SelfLoopConfig, SelfLoopOutputs};
use super::session::ConnectorRegistry;
use super::{DispatchStrategy, RemoteFacilityAction};

/// One facility channel to bring up.
pub struct ChannelDescriptor<I, O> {
    /// Facility name as advertised in heartbeats; also the facility's
    /// registration name.
    pub channel_name: String,
    pub strategy: DispatchStrategy,
    /// Priming configuration; required for `Designated` channels and
    /// ignored for `Random` ones.
    pub self_loop: Option<SelfLoopConfig<I, O>>,
}

/// The wired fleet. Fields are declared in teardown order: dropping the
/// fabric stops the feeder workers first, then the loops, then the
/// facilities themselves.
pub struct FacilityFabric<I, O> {
    #[allow(dead_code)]
    workers: Vec<WorkerHandle>,
    #[allow(dead_code)]
    loops: Vec<SelfLoop<I, O>>,
    /// Self-loop streams for designated channels (`None` for random
    /// ones); take ownership per index to consume them.
    pub loop_outputs: Vec<Option<SelfLoopOutputs<I, O>>>,
    /// One facility per descriptor, in descriptor order.
    pub facilities: Vec<Arc<RemoteFacility<I, O>>>,
}

/// Entry point mirroring the discovery dataflow:
/// `heartbeats + ticks -> trackers -> per-channel actions -> facilities`.
pub struct SetupRemoteFacilities;

impl SetupRemoteFacilities {
    #[allow(clippy::too_many_arguments)]
    pub fn run<I, O>(
        heartbeats: Source<HeartbeatMessage>,
        sender_re: Regex,
        descriptors: Vec<ChannelDescriptor<I, O>>,
        ttl: Duration,
        check_period: Duration,
        connectors: Arc<ConnectorRegistry>,
        hook_factory: Option<HookPairFactory>,
    ) -> Result<FacilityFabric<I, O>, Error>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        let mut workers = Vec::new();

        // One tracker per channel: the facility regex pins the advertised
        // facility name, the shared sender regex picks the peers.
        let mut trackers = Vec::with_capacity(descriptors.len());
        let mut action_sinks: Vec<Sink<Vec<RemoteFacilityAction>>> = Vec::new();
        let mut action_sources: Vec<Source<Vec<RemoteFacilityAction>>> = Vec::new();
        for descriptor in &descriptors {
            let facility_re = Regex::new(&format!("^{}$", regex::escape(&descriptor.channel_name)))
                .map_err(|e| crate::error::ConfigError::MalformedChannelSpec(e.to_string()))?;
            trackers.push(HeartbeatTracker::new(sender_re.clone(), facility_re, ttl));
            let (tx, rx) = flow::edge();
            action_sinks.push(tx);
            action_sources.push(rx);
        }

        let (tick_tx, tick_rx) = flow::edge();
        workers.push(flow::recurring_clock("facility-check", check_period, tick_tx));

        // Single thread owns every tracker, matching their externally
        // single-threaded contract.
        workers.push(spawn_worker("facility-trackers", move |stop| {
            while !stop.is_stopped() {
                select! {
                    recv(heartbeats) -> msg => match msg {
                        Ok(message) => {
                            let observed = Instant::now();
                            for tracker in &mut trackers {
                                tracker.process(HeartbeatInput::Heartbeat(
                                    observed,
                                    message.clone(),
                                ));
                            }
                        }
                        Err(_) => break,
                    },
                    recv(tick_rx) -> tick => match tick {
                        Ok(now) => {
                            for (tracker, sink) in trackers.iter_mut().zip(&action_sinks) {
                                let actions = tracker.process(HeartbeatInput::Tick(now));
                                let _ = sink.send(actions);
                            }
                        }
                        Err(_) => break,
                    },
                    default(Duration::from_millis(100)) => continue,
                }
            }
        }));

        // Facilities, in descriptor order.
        let facilities: Vec<Arc<RemoteFacility<I, O>>> = descriptors
            .iter()
            .map(|d| {
                Arc::new(RemoteFacility::new(
                    d.channel_name.clone(),
                    d.strategy,
                    Arc::clone(&connectors),
                    hook_factory.clone(),
                ))
            })
            .collect();

        // Designated channels chain: each loop's first completion gates
        // the next loop's action feed.
        let mut loops = Vec::new();
        let mut loop_outputs: Vec<Option<SelfLoopOutputs<I, O>>> = Vec::new();
        let mut gate: Option<Source<()>> = None;
        let mut last_ready: Option<Source<()>> = None;
        let mut has_designated = false;

        let mut sources = action_sources.into_iter();
        let mut random_feeds: Vec<(Arc<RemoteFacility<I, O>>, Source<Vec<RemoteFacilityAction>>)> =
            Vec::new();
        for (descriptor, facility) in descriptors.iter().zip(&facilities) {
            let actions = sources.next().expect("one source per descriptor");
            match descriptor.strategy {
                DispatchStrategy::Designated => {
                    has_designated = true;
                    let config = descriptor.self_loop.clone().ok_or_else(|| {
                        crate::error::ConfigError::MalformedChannelSpec(format!(
                            "designated channel '{}' needs a self-loop config",
                            descriptor.channel_name
                        ))
                    })?;
                    let (ready_tx, ready_rx) = flow::edge();
                    let (wired, outputs) = SelfLoop::wire(
                        Arc::clone(facility),
                        actions,
                        config,
                        gate.take(),
                        Some(ready_tx),
                    );
                    gate = Some(ready_rx.clone());
                    last_ready = Some(ready_rx);
                    loops.push(wired);
                    loop_outputs.push(Some(outputs));
                }
                DispatchStrategy::Random => {
                    random_feeds.push((Arc::clone(facility), actions));
                    loop_outputs.push(None);
                }
            }
        }

        // Random channels start once the designated chain has completed
        // its first registrations; ungated when there is none.
        let random_gates: Vec<Option<Source<()>>> = if has_designated {
            let ready = last_ready.expect("designated chain has a ready source");
            let mut gate_sinks = Vec::new();
            let mut gate_sources = Vec::new();
            for _ in 0..random_feeds.len() {
                let (tx, rx) = flow::edge();
                gate_sinks.push(tx);
                gate_sources.push(Some(rx));
            }
            if !gate_sinks.is_empty() {
                workers.push(flow::fanout("facility-random-gate", ready, gate_sinks));
            }
            gate_sources
        } else {
            random_feeds.iter().map(|_| None).collect()
        };

        for ((facility, actions), gate) in random_feeds.into_iter().zip(random_gates) {
            let name = format!("facility-{}-actions", facility.name());
            workers.push(spawn_worker(&name, move |stop| {
                if let Some(gate) = gate {
                    loop {
                        match gate.recv_timeout(Duration::from_millis(100)) {
                            Ok(()) => break,
                            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                                if stop.is_stopped() {
                                    return;
                                }
                            }
                            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                        }
                    }
                }
                while !stop.is_stopped() {
                    match actions.recv_timeout(Duration::from_millis(100)) {
                        Ok(batch) => {
                            for action in batch {
                                facility.apply_action(action);
                            }
                        }
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }));
        }

        Ok(FacilityFabric {
            facilities,
            loop_outputs,
            loops,
            workers,
        })
    }
}
