// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ZeroMQ broadcast component.
//!
//! One SUB worker thread per `(host, port)` endpoint serves every
//! subscription on that endpoint, multiplexed by topic filter. One PUB
//! worker thread per port drains a condvar-notified queue and sends with
//! non-blocking semantics. ZeroMQ sockets are not `Send`, so each worker
//! creates its own socket; socket errors are logged and the worker keeps
//! looping.

use crate::broadcast::{BroadcastDriver, BroadcastHandler, ClientSet, Publisher, TopicFilter};
use crate::config::{RuntimeConfig, PUBLISH_WAIT};
use crate::error::TransportError;
use crate::flow::StopFlag;
use crate::framing::{decode_frame, encode_frame, ByteDataWithTopic, UserToWireHook, WireToUserHook};
use crate::locator::ConnectionLocator;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// ZeroMQ pub/sub component with shared per-endpoint workers.
///
/// Cheap to clone; clones share the same context and endpoint maps.
#[derive(Clone)]
pub struct ZeroMqComponent {
    shared: Arc<Shared>,
}

struct Shared {
    ctx: zmq::Context,
    cfg: RuntimeConfig,
    // One mutex guards both endpoint maps; entries are never evicted
    // while the component lives, so returned Arcs stay valid.
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<(String, u16), Arc<Subscription>>,
    senders: HashMap<u16, Arc<Sender>>,
}

impl Default for ZeroMqComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl ZeroMqComponent {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::from_env())
    }

    pub fn with_config(cfg: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx: zmq::Context::new(),
                cfg,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub(crate) fn driver(&self) -> Arc<dyn BroadcastDriver> {
        Arc::new(self.clone())
    }

    /// Register a subscription client on `locator`'s endpoint.
    ///
    /// The first subscription for a `(host, port)` pair starts the worker
    /// thread; later ones register into the same worker.
    pub fn subscribe(
        &self,
        locator: &ConnectionLocator,
        filter: TopicFilter,
        handler: BroadcastHandler,
        hook: Option<WireToUserHook>,
    ) -> Result<(), TransportError> {
        let subscription = self.get_or_start_subscription(locator)?;
        subscription.clients.lock().add(filter, handler, hook);
        Ok(())
    }

    /// Obtain a publisher bound to `tcp://*:<locator.port>`.
    pub fn publisher(
        &self,
        locator: &ConnectionLocator,
        hook: Option<UserToWireHook>,
    ) -> Result<Publisher, TransportError> {
        let sender = self.get_or_start_sender(locator.port())?;
        Ok(match hook {
            Some(hook) => Arc::new(move |data: ByteDataWithTopic| {
                // Hooks run in the caller's thread before enqueue.
                let content = hook(data.content);
                sender.publish(ByteDataWithTopic {
                    topic: data.topic,
                    content,
                });
            }),
            None => Arc::new(move |data| sender.publish(data)),
        })
    }

    fn get_or_start_subscription(
        &self,
        locator: &ConnectionLocator,
    ) -> Result<Arc<Subscription>, TransportError> {
        let key = (locator.host().to_string(), locator.port());
        let mut inner = self.shared.inner.lock();
        if let Some(existing) = inner.subscriptions.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let subscription = Subscription::start(
            self.shared.ctx.clone(),
            self.shared.cfg.clone(),
            key.0.clone(),
            key.1,
        )?;
        inner.subscriptions.insert(key, Arc::clone(&subscription));
        Ok(subscription)
    }

    fn get_or_start_sender(&self, port: u16) -> Result<Arc<Sender>, TransportError> {
        let mut inner = self.shared.inner.lock();
        if let Some(existing) = inner.senders.get(&port) {
            return Ok(Arc::clone(existing));
        }
        let sender = Sender::start(self.shared.ctx.clone(), port)?;
        inner.senders.insert(port, Arc::clone(&sender));
        Ok(sender)
    }
}

// ===== Subscription worker =====

struct Subscription {
    clients: Arc<Mutex<ClientSet>>,
    stop: Arc<StopFlag>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn start(
        ctx: zmq::Context,
        cfg: RuntimeConfig,
        host: String,
        port: u16,
    ) -> Result<Arc<Self>, TransportError> {
        let clients = Arc::new(Mutex::new(ClientSet::default()));
        let stop = Arc::new(StopFlag::new());

        let worker_clients = Arc::clone(&clients);
        let worker_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("bcast-zmq-sub-{}:{}", host, port))
            .spawn(move || run_subscription(&ctx, &cfg, &host, port, &worker_clients, &worker_stop))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        Ok(Arc::new(Self {
            clients,
            stop,
            thread: Mutex::new(Some(thread)),
        }))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_subscription(
    ctx: &zmq::Context,
    cfg: &RuntimeConfig,
    host: &str,
    port: u16,
    clients: &Mutex<ClientSet>,
    stop: &StopFlag,
) {
    let sock = match open_sub_socket(ctx, cfg, host, port) {
        Ok(sock) => sock,
        Err(e) => {
            log::error!("[zmq] subscriber setup failed for {}:{}: {}", host, port, e);
            return;
        }
    };

    let mut buf = vec![0u8; cfg.recv_buffer_size];
    while !stop.is_stopped() {
        let size = match sock.recv_into(&mut buf, 0) {
            Ok(size) => size,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                // Worker faults never propagate; keep looping.
                log::debug!("[zmq] recv error on {}:{}: {}", host, port, e);
                continue;
            }
        };
        if size > buf.len() {
            log::debug!(
                "[zmq] dropping truncated frame on {}:{} ({} > {} bytes)",
                host,
                port,
                size,
                buf.len()
            );
            continue;
        }
        match decode_frame(&buf[..size]) {
            Ok(data) => clients.lock().dispatch(&data),
            Err(e) => {
                log::debug!("[zmq] skipping bad frame on {}:{}: {}", host, port, e);
            }
        }
    }
}

fn open_sub_socket(
    ctx: &zmq::Context,
    cfg: &RuntimeConfig,
    host: &str,
    port: u16,
) -> Result<zmq::Socket, TransportError> {
    let sock = ctx.socket(zmq::SUB)?;
    sock.set_rcvtimeo(cfg.recv_timeout.as_millis() as i32)?;
    sock.connect(&format!("tcp://{}:{}", host, port))?;
    // Topic selection happens in our filter lists, not at the socket.
    sock.set_subscribe(b"")?;
    Ok(sock)
}

// ===== Publisher worker =====

struct Sender {
    state: Arc<SenderState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// Shared between the public publish path and the worker; the worker holds
// only this state, never the owning Sender, so Drop can run and join.
struct SenderState {
    queue: Mutex<VecDeque<ByteDataWithTopic>>,
    cond: Condvar,
    stop: StopFlag,
}

impl Sender {
    fn start(ctx: zmq::Context, port: u16) -> Result<Arc<Self>, TransportError> {
        let state = Arc::new(SenderState {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stop: StopFlag::new(),
        });

        let worker_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name(format!("bcast-zmq-pub-{}", port))
            .spawn(move || run_sender(&ctx, port, &worker_state))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        Ok(Arc::new(Self {
            state,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Enqueue and return immediately; the worker drains and sends.
    fn publish(&self, data: ByteDataWithTopic) {
        if self.state.stop.is_stopped() {
            return;
        }
        self.state.queue.lock().push_back(data);
        self.state.cond.notify_one();
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.state.stop.stop();
        self.state.cond.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_sender(ctx: &zmq::Context, port: u16, state: &SenderState) {
    let sock = match open_pub_socket(ctx, port) {
        Ok(sock) => sock,
        Err(e) => {
            log::error!("[zmq] publisher setup failed for port {}: {}", port, e);
            return;
        }
    };

    loop {
        let batch: Vec<ByteDataWithTopic> = {
            let mut queue = state.queue.lock();
            state.cond.wait_for(&mut queue, PUBLISH_WAIT);
            if state.stop.is_stopped() {
                break;
            }
            if queue.is_empty() {
                continue;
            }
            queue.drain(..).collect()
        };
        for item in batch {
            let frame = encode_frame(&item);
            if let Err(e) = sock.send(&frame[..], zmq::DONTWAIT) {
                log::debug!("[zmq] send error on port {}: {}", port, e);
            }
        }
    }
}

fn open_pub_socket(ctx: &zmq::Context, port: u16) -> Result<zmq::Socket, TransportError> {
    let sock = ctx.socket(zmq::PUB)?;
    sock.bind(&format!("tcp://*:{}", port))?;
    Ok(sock)
}

impl BroadcastDriver for ZeroMqComponent {
    fn subscribe(
        &self,
        locator: &ConnectionLocator,
        filter: TopicFilter,
        handler: BroadcastHandler,
        hook: Option<WireToUserHook>,
    ) -> Result<(), TransportError> {
        ZeroMqComponent::subscribe(self, locator, filter, handler, hook)
    }

    fn publisher(
        &self,
        locator: &ConnectionLocator,
        hook: Option<UserToWireHook>,
    ) -> Result<Publisher, TransportError> {
        ZeroMqComponent::publisher(self, locator, hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;
    use std::time::Duration;

    fn recv_all(
        rx: &flow::Source<ByteDataWithTopic>,
        wait: Duration,
    ) -> Vec<ByteDataWithTopic> {
        let mut out = Vec::new();
        while let Ok(item) = rx.recv_timeout(wait) {
            out.push(item);
        }
        out
    }

    #[test]
    fn pub_sub_exact_filter() {
        let component = ZeroMqComponent::new();
        let bind = ConnectionLocator::new("*", 5561);
        let connect = ConnectionLocator::new("localhost", 5561);

        let (tx, rx) = flow::edge();
        component
            .subscribe(
                &connect,
                TopicFilter::Exact("x".to_string()),
                Box::new(move |d| {
                    let _ = tx.send(d);
                }),
                None,
            )
            .expect("subscribe");

        let publish = component.publisher(&bind, None).expect("publisher");

        // PUB/SUB joins are asynchronous; give the SUB time to connect,
        // then publish until the first delivery lands.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while seen.is_empty() && std::time::Instant::now() < deadline {
            publish(ByteDataWithTopic::new("x", b"hello".to_vec()));
            publish(ByteDataWithTopic::new("y", b"world".to_vec()));
            seen = recv_all(&rx, Duration::from_millis(200));
        }

        assert!(!seen.is_empty(), "subscriber should observe a message");
        for item in &seen {
            assert_eq!(item.topic, "x", "exact filter must reject topic 'y'");
            assert_eq!(item.content, b"hello");
        }
    }

    #[test]
    fn shared_worker_serves_multiple_filters() {
        let component = ZeroMqComponent::new();
        let bind = ConnectionLocator::new("*", 5571);
        let connect = ConnectionLocator::new("localhost", 5571);

        let (any_tx, any_rx) = flow::edge();
        let (re_tx, re_rx) = flow::edge();
        component
            .subscribe(
                &connect,
                TopicFilter::Any,
                Box::new(move |d| {
                    let _ = any_tx.send(d);
                }),
                None,
            )
            .expect("subscribe any");
        component
            .subscribe(
                &connect,
                TopicFilter::regex("trades/.*").expect("regex"),
                Box::new(move |d| {
                    let _ = re_tx.send(d);
                }),
                None,
            )
            .expect("subscribe regex");

        let publish = component.publisher(&bind, None).expect("publisher");
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut any_seen = Vec::new();
        while any_seen.is_empty() && std::time::Instant::now() < deadline {
            publish(ByteDataWithTopic::new("trades/eurusd", b"1".to_vec()));
            publish(ByteDataWithTopic::new("quotes/eurusd", b"2".to_vec()));
            any_seen = recv_all(&any_rx, Duration::from_millis(200));
        }

        assert!(!any_seen.is_empty());
        let re_seen = recv_all(&re_rx, Duration::from_millis(500));
        assert!(re_seen.iter().all(|d| d.topic == "trades/eurusd"));
    }
}
