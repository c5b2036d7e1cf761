// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast broadcast component.
//!
//! Same worker shape as the ZeroMQ component: one receive thread per
//! `(group, port)`, one publish thread per group endpoint, CBOR framing
//! on every datagram. Sockets are configured through `socket2`
//! (reuse-address, group join on the unspecified interface) so several
//! processes on one host can share a group.

use crate::broadcast::{BroadcastDriver, BroadcastHandler, ClientSet, Publisher, TopicFilter};
use crate::config::{RuntimeConfig, DATAGRAM_BUFFER_SIZE, PUBLISH_WAIT};
use crate::error::TransportError;
use crate::flow::StopFlag;
use crate::framing::{decode_frame, encode_frame, ByteDataWithTopic, UserToWireHook, WireToUserHook};
use crate::locator::ConnectionLocator;
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// UDP multicast component with shared per-group workers.
#[derive(Clone)]
pub struct MulticastComponent {
    shared: Arc<Shared>,
}

struct Shared {
    cfg: RuntimeConfig,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<(Ipv4Addr, u16), Arc<Subscription>>,
    senders: HashMap<(Ipv4Addr, u16), Arc<Sender>>,
}

impl Default for MulticastComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl MulticastComponent {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::from_env())
    }

    pub fn with_config(cfg: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub(crate) fn driver(&self) -> Arc<dyn BroadcastDriver> {
        Arc::new(self.clone())
    }

    /// Register a subscription client on the multicast group in `locator`.
    pub fn subscribe(
        &self,
        locator: &ConnectionLocator,
        filter: TopicFilter,
        handler: BroadcastHandler,
        hook: Option<WireToUserHook>,
    ) -> Result<(), TransportError> {
        let group = parse_group(locator)?;
        let mut inner = self.shared.inner.lock();
        let subscription = match inner.subscriptions.get(&group) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = Subscription::start(self.shared.cfg.clone(), group)?;
                inner.subscriptions.insert(group, Arc::clone(&created));
                created
            }
        };
        subscription.clients.lock().add(filter, handler, hook);
        Ok(())
    }

    /// Obtain a publisher sending into the multicast group in `locator`.
    pub fn publisher(
        &self,
        locator: &ConnectionLocator,
        hook: Option<UserToWireHook>,
    ) -> Result<Publisher, TransportError> {
        let group = parse_group(locator)?;
        let mut inner = self.shared.inner.lock();
        let sender = match inner.senders.get(&group) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = Sender::start(group)?;
                inner.senders.insert(group, Arc::clone(&created));
                created
            }
        };
        drop(inner);
        Ok(match hook {
            Some(hook) => Arc::new(move |data: ByteDataWithTopic| {
                let content = hook(data.content);
                sender.publish(ByteDataWithTopic {
                    topic: data.topic,
                    content,
                });
            }),
            None => Arc::new(move |data| sender.publish(data)),
        })
    }
}

fn parse_group(locator: &ConnectionLocator) -> Result<(Ipv4Addr, u16), TransportError> {
    let addr: Ipv4Addr = locator.host().parse().map_err(|_| {
        TransportError::ConnectFailed(format!("'{}' is not an IPv4 group address", locator.host()))
    })?;
    if !addr.is_multicast() {
        return Err(TransportError::ConnectFailed(format!(
            "'{}' is not a multicast address",
            addr
        )));
    }
    Ok((addr, locator.port()))
}

/// Bind a reusable receive socket and join the group on all interfaces.
fn open_group_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

// ===== Subscription worker =====

struct Subscription {
    clients: Arc<Mutex<ClientSet>>,
    stop: Arc<StopFlag>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn start(cfg: RuntimeConfig, group: (Ipv4Addr, u16)) -> Result<Arc<Self>, TransportError> {
        let socket = open_group_socket(group.0, group.1)?;
        socket.set_read_timeout(Some(cfg.recv_timeout))?;

        let clients = Arc::new(Mutex::new(ClientSet::default()));
        let stop = Arc::new(StopFlag::new());

        let worker_clients = Arc::clone(&clients);
        let worker_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("bcast-mcast-sub-{}:{}", group.0, group.1))
            .spawn(move || run_subscription(&socket, group, &worker_clients, &worker_stop))
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
    socket: &UdpSocket,
    group: (Ipv4Addr, u16),
    clients: &Mutex<ClientSet>,
    stop: &StopFlag,
) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
    while !stop.is_stopped() {
        let size = match socket.recv_from(&mut buf) {
            Ok((size, _from)) => size,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[mcast] recv error on {}:{}: {}", group.0, group.1, e);
                continue;
            }
        };
        match decode_frame(&buf[..size]) {
            Ok(data) => clients.lock().dispatch(&data),
            Err(e) => {
                log::debug!("[mcast] skipping bad frame on {}:{}: {}", group.0, group.1, e);
            }
        }
    }
}

// ===== Publisher worker =====

struct Sender {
    state: Arc<SenderState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct SenderState {
    queue: Mutex<VecDeque<ByteDataWithTopic>>,
    cond: Condvar,
    stop: StopFlag,
}

impl Sender {
    fn start(group: (Ipv4Addr, u16)) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        // Intra-host pub/sub needs loopback of our own datagrams.
        socket.set_multicast_loop_v4(true)?;

        let state = Arc::new(SenderState {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stop: StopFlag::new(),
        });

        let worker_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name(format!("bcast-mcast-pub-{}:{}", group.0, group.1))
            .spawn(move || run_sender(&socket, group, &worker_state))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        Ok(Arc::new(Self {
            state,
            thread: Mutex::new(Some(thread)),
        }))
    }

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

fn run_sender(socket: &UdpSocket, group: (Ipv4Addr, u16), state: &SenderState) {
    let dest = SocketAddr::V4(SocketAddrV4::new(group.0, group.1));
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
            if frame.len() > DATAGRAM_BUFFER_SIZE {
                log::debug!(
                    "[mcast] dropping oversize frame for {} ({} bytes)",
                    dest,
                    frame.len()
                );
                continue;
            }
            if let Err(e) = socket.send_to(&frame, dest) {
                log::debug!("[mcast] send error to {}: {}", dest, e);
            }
        }
    }
}

impl BroadcastDriver for MulticastComponent {
    fn subscribe(
        &self,
        locator: &ConnectionLocator,
        filter: TopicFilter,
        handler: BroadcastHandler,
        hook: Option<WireToUserHook>,
    ) -> Result<(), TransportError> {
        MulticastComponent::subscribe(self, locator, filter, handler, hook)
    }

    fn publisher(
        &self,
        locator: &ConnectionLocator,
        hook: Option<UserToWireHook>,
    ) -> Result<Publisher, TransportError> {
        MulticastComponent::publisher(self, locator, hook)
    }
}
