// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast transport multiplexer.
//!
//! Carries `{topic, bytes}` messages in a fire-and-forget pub/sub fashion
//! over a heterogeneous set of transports. ZeroMQ and UDP multicast ship
//! as built-in components; Redis, RabbitMQ and NNG plug in through the
//! [`BroadcastDriver`] adapter contract without this crate binding their
//! client libraries.
//!
//! # Modules
//!
//! - `zeromq` - ZeroMQ pub/sub with CBOR framing and per-endpoint workers
//! - `multicast` - UDP multicast with the same framing and worker shape

pub mod multicast;
pub mod zeromq;

pub use multicast::MulticastComponent;
pub use zeromq::ZeroMqComponent;

use crate::error::{ConfigError, Error, TransportError};
use crate::flow::{self, Source};
use crate::framing::{ByteDataWithTopic, UserToWireHook, WireToUserHook};
use crate::locator::ConnectionLocator;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ===== Channel specification =====

/// Wire protocols a broadcast channel can ride on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BroadcastProtocol {
    Multicast,
    RabbitMq,
    Redis,
    ZeroMq,
    Nng,
}

impl BroadcastProtocol {
    /// Scheme string used in channel specs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Multicast => "multicast",
            Self::RabbitMq => "rabbitmq",
            Self::Redis => "redis",
            Self::ZeroMq => "zeromq",
            Self::Nng => "nng",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "multicast" => Some(Self::Multicast),
            "rabbitmq" => Some(Self::RabbitMq),
            "redis" => Some(Self::Redis),
            "zeromq" => Some(Self::ZeroMq),
            "nng" => Some(Self::Nng),
            _ => None,
        }
    }
}

impl fmt::Display for BroadcastProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed broadcast channel spec: protocol plus endpoint locator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BroadcastChannelSpec {
    pub protocol: BroadcastProtocol,
    pub locator: ConnectionLocator,
}

impl BroadcastChannelSpec {
    /// Parse `<protocol>://<host>:<port>[/<identifier>][?<k>=<v>&...]`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = text
            .split_once("://")
            .ok_or_else(|| ConfigError::MalformedChannelSpec(text.to_string()))?;
        let protocol = BroadcastProtocol::from_scheme(scheme)
            .ok_or_else(|| ConfigError::UnknownProtocol(scheme.to_string()))?;
        let locator = ConnectionLocator::parse(rest)?;
        Ok(Self { protocol, locator })
    }
}

impl fmt::Display for BroadcastChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.locator)
    }
}

// ===== Topic filters =====

/// Per-subscription topic admission rule.
#[derive(Clone, Debug)]
pub enum TopicFilter {
    /// Admit every topic.
    Any,
    /// Admit topics equal to the given string.
    Exact(String),
    /// Admit topics the pattern matches. Build through
    /// [`TopicFilter::regex`] for whole-topic semantics; a hand-built
    /// pattern is used as-is.
    Regex(regex::Regex),
}

impl TopicFilter {
    /// Build a regex filter anchored to match the whole topic.
    pub fn regex(pattern: &str) -> Result<Self, ConfigError> {
        regex::Regex::new(&format!("^(?:{})$", pattern))
            .map(Self::Regex)
            .map_err(|e| ConfigError::MalformedChannelSpec(e.to_string()))
    }

    /// Whether a topic passes this filter.
    pub fn admits(&self, topic: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(s) => topic == s,
            Self::Regex(re) => re.is_match(topic),
        }
    }
}

/// Recompile a pattern anchored to match its whole subject.
///
/// `find`-based boundary checks are not equivalent: the regex engine is
/// leftmost-first, so `cat|category` finds `cat` in `category` and a
/// start/end comparison wrongly rejects the topic. Wrapping the original
/// pattern keeps alternations intact; wrapping a valid pattern cannot
/// fail, with the original kept as a fallback.
pub(crate) fn anchor_whole(re: &regex::Regex) -> regex::Regex {
    regex::Regex::new(&format!("^(?:{})$", re.as_str())).unwrap_or_else(|_| re.clone())
}

// ===== Client plumbing shared by the built-in components =====

/// Per-message delivery callback registered by a subscriber.
pub type BroadcastHandler = Box<dyn FnMut(ByteDataWithTopic) + Send>;

/// Fire-and-forget publish callback; enqueues and returns immediately.
pub type Publisher = Arc<dyn Fn(ByteDataWithTopic) + Send + Sync>;

struct Client {
    handler: BroadcastHandler,
    hook: Option<WireToUserHook>,
}

impl Client {
    fn deliver(&mut self, data: &ByteDataWithTopic) {
        let content = match &self.hook {
            Some(hook) => match hook.as_ref()(data.content.clone()) {
                Some(bytes) => bytes,
                // Hook suppressed delivery to this client.
                None => return,
            },
            None => data.content.clone(),
        };
        (self.handler)(ByteDataWithTopic {
            topic: data.topic.clone(),
            content,
        });
    }
}

/// The three filter lists a receive worker walks, in order.
#[derive(Default)]
pub(crate) struct ClientSet {
    any: Vec<Client>,
    exact: Vec<(String, Client)>,
    regex: Vec<(regex::Regex, Client)>,
}

impl ClientSet {
    pub(crate) fn add(
        &mut self,
        filter: TopicFilter,
        handler: BroadcastHandler,
        hook: Option<WireToUserHook>,
    ) {
        let client = Client { handler, hook };
        match filter {
            TopicFilter::Any => self.any.push(client),
            TopicFilter::Exact(s) => self.exact.push((s, client)),
            TopicFilter::Regex(re) => self.regex.push((re, client)),
        }
    }

    /// Walk no-filter, exact-match, then regex-match clients in order.
    pub(crate) fn dispatch(&mut self, data: &ByteDataWithTopic) {
        for client in &mut self.any {
            client.deliver(data);
        }
        for (wanted, client) in &mut self.exact {
            if data.topic == *wanted {
                client.deliver(data);
            }
        }
        for (re, client) in &mut self.regex {
            if re.is_match(&data.topic) {
                client.deliver(data);
            }
        }
    }
}

// ===== Driver contract =====

/// Adapter contract for broadcast transports.
///
/// The built-in ZeroMQ and multicast components implement this; Redis,
/// RabbitMQ and NNG bindings live outside this crate and register through
/// [`BroadcastRouter::register_driver`].
pub trait BroadcastDriver: Send + Sync {
    /// Register a subscription client on the endpoint named by `locator`.
    fn subscribe(
        &self,
        locator: &ConnectionLocator,
        filter: TopicFilter,
        handler: BroadcastHandler,
        hook: Option<WireToUserHook>,
    ) -> Result<(), TransportError>;

    /// Obtain a fire-and-forget publisher for the endpoint.
    fn publisher(
        &self,
        locator: &ConnectionLocator,
        hook: Option<UserToWireHook>,
    ) -> Result<Publisher, TransportError>;
}

// ===== Router =====

/// Maps channel specs to concrete broadcast components.
pub struct BroadcastRouter {
    zeromq: ZeroMqComponent,
    multicast: MulticastComponent,
    drivers: Mutex<HashMap<BroadcastProtocol, Arc<dyn BroadcastDriver>>>,
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self {
            zeromq: ZeroMqComponent::new(),
            multicast: MulticastComponent::new(),
            drivers: Mutex::new(HashMap::new()),
        }
    }

    /// Install an adapter for a protocol.
    ///
    /// A registered driver takes precedence over a built-in component for
    /// the same protocol.
    pub fn register_driver(&self, protocol: BroadcastProtocol, driver: Arc<dyn BroadcastDriver>) {
        self.drivers.lock().insert(protocol, driver);
    }

    fn resolve(&self, protocol: BroadcastProtocol) -> Result<Arc<dyn BroadcastDriver>, ConfigError> {
        if let Some(driver) = self.drivers.lock().get(&protocol) {
            return Ok(Arc::clone(driver));
        }
        match protocol {
            BroadcastProtocol::ZeroMq => Ok(self.zeromq.driver()),
            BroadcastProtocol::Multicast => Ok(self.multicast.driver()),
            other => Err(ConfigError::UnsupportedTransport(other.as_str().to_string())),
        }
    }

    /// Subscribe a handler on the channel named by `spec`.
    pub fn subscribe(
        &self,
        spec: &BroadcastChannelSpec,
        filter: TopicFilter,
        handler: BroadcastHandler,
        hook: Option<WireToUserHook>,
    ) -> Result<(), Error> {
        let driver = self.resolve(spec.protocol)?;
        driver.subscribe(&spec.locator, filter, handler, hook)?;
        Ok(())
    }

    /// Obtain a publisher for the channel named by `spec`.
    pub fn publisher(
        &self,
        spec: &BroadcastChannelSpec,
        hook: Option<UserToWireHook>,
    ) -> Result<Publisher, Error> {
        let driver = self.resolve(spec.protocol)?;
        Ok(driver.publisher(&spec.locator, hook)?)
    }

    /// Subscribe and expose the messages as a flow source.
    pub fn importer(
        &self,
        spec: &BroadcastChannelSpec,
        filter: TopicFilter,
        hook: Option<WireToUserHook>,
    ) -> Result<Source<ByteDataWithTopic>, Error> {
        let (tx, rx) = flow::edge();
        self.subscribe(
            spec,
            filter,
            Box::new(move |data| {
                let _ = tx.send(data);
            }),
            hook,
        )?;
        Ok(rx)
    }

    /// Subscribe and decode each payload as CBOR into `T`.
    ///
    /// Undecodable payloads are dropped with a debug log, matching the
    /// frame-level policy.
    pub fn typed_importer<T>(
        &self,
        spec: &BroadcastChannelSpec,
        filter: TopicFilter,
        hook: Option<WireToUserHook>,
    ) -> Result<Source<TypedDataWithTopic<T>>, Error>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = flow::edge();
        self.subscribe(
            spec,
            filter,
            Box::new(move |data: ByteDataWithTopic| {
                match serde_cbor::from_slice::<T>(&data.content) {
                    Ok(content) => {
                        let _ = tx.send(TypedDataWithTopic {
                            topic: data.topic,
                            content,
                        });
                    }
                    Err(e) => {
                        log::debug!(
                            "[broadcast] dropping undecodable payload on topic '{}': {}",
                            data.topic,
                            e
                        );
                    }
                }
            }),
            hook,
        )?;
        Ok(rx)
    }

    /// Obtain a publisher that CBOR-encodes typed payloads.
    pub fn typed_publisher<T>(
        &self,
        spec: &BroadcastChannelSpec,
        hook: Option<UserToWireHook>,
    ) -> Result<Arc<dyn Fn(TypedDataWithTopic<T>) + Send + Sync>, Error>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let publisher = self.publisher(spec, hook)?;
        Ok(Arc::new(move |data: TypedDataWithTopic<T>| {
            match serde_cbor::to_vec(&data.content) {
                Ok(content) => publisher(ByteDataWithTopic {
                    topic: data.topic,
                    content,
                }),
                Err(e) => {
                    log::error!(
                        "[broadcast] failed to encode payload for topic '{}': {}",
                        data.topic,
                        e
                    );
                }
            }
        }))
    }
}

/// A decoded broadcast payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedDataWithTopic<T> {
    pub topic: String,
    pub content: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_spec_parsing() {
        let spec = BroadcastChannelSpec::parse("zeromq://host:5561?topic=x").expect("parse");
        assert_eq!(spec.protocol, BroadcastProtocol::ZeroMq);
        assert_eq!(spec.locator.host(), "host");
        assert_eq!(spec.locator.port(), 5561);
        assert_eq!(spec.locator.property("topic"), Some("x"));
    }

    #[test]
    fn channel_spec_rejects_unknown_protocol() {
        match BroadcastChannelSpec::parse("kafka://host:9092") {
            Err(ConfigError::UnknownProtocol(p)) => assert_eq!(p, "kafka"),
            other => panic!("expected UnknownProtocol, got {:?}", other),
        }
    }

    #[test]
    fn channel_spec_rejects_missing_scheme() {
        assert!(matches!(
            BroadcastChannelSpec::parse("host:9092"),
            Err(ConfigError::MalformedChannelSpec(_))
        ));
    }

    #[test]
    fn channel_spec_display_round_trips() {
        for text in ["redis://h:6379", "multicast://239.255.0.1:7400?iface=lo"] {
            let spec = BroadcastChannelSpec::parse(text).expect("parse");
            assert_eq!(spec.to_string(), text);
        }
    }

    #[test]
    fn topic_filter_soundness() {
        let any = TopicFilter::Any;
        let exact = TopicFilter::Exact("x".to_string());
        let re = TopicFilter::regex("x.*").expect("regex");

        assert!(any.admits("anything"));
        assert!(exact.admits("x"));
        assert!(!exact.admits("xy"));
        assert!(re.admits("x"));
        assert!(re.admits("xyz"));
        assert!(!re.admits("ax"), "regex must match the whole topic");
    }

    #[test]
    fn regex_filter_alternation_matches_longer_branch() {
        // Leftmost-first matching must not truncate the topic to the
        // first alternative.
        let re = TopicFilter::regex("cat|category").expect("regex");
        assert!(re.admits("cat"));
        assert!(re.admits("category"));
        assert!(!re.admits("cats"));

        let mut set = ClientSet::default();
        let seen = Arc::new(Mutex::new(0u32));
        let seen2 = Arc::clone(&seen);
        set.add(re, Box::new(move |_| *seen2.lock() += 1), None);
        set.dispatch(&ByteDataWithTopic::new("category", b"m".to_vec()));
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn client_set_walks_filters_in_order() {
        let mut set = ClientSet::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (label, filter) in [
            ("regex", TopicFilter::regex("x.*").expect("regex")),
            ("any", TopicFilter::Any),
            ("exact", TopicFilter::Exact("x".to_string())),
        ] {
            let seen = Arc::clone(&seen);
            set.add(
                filter,
                Box::new(move |_| seen.lock().push(label)),
                None,
            );
        }

        set.dispatch(&ByteDataWithTopic::new("x", b"m".to_vec()));
        // Delivery order is list order, not registration order.
        assert_eq!(*seen.lock(), vec!["any", "exact", "regex"]);
    }

    #[test]
    fn hook_can_suppress_delivery() {
        let mut set = ClientSet::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let hook: WireToUserHook = Arc::new(|bytes| if bytes == b"drop" { None } else { Some(bytes) });
        set.add(
            TopicFilter::Any,
            Box::new(move |d| seen2.lock().push(d.content)),
            Some(hook),
        );

        set.dispatch(&ByteDataWithTopic::new("t", b"drop".to_vec()));
        set.dispatch(&ByteDataWithTopic::new("t", b"keep".to_vec()));
        assert_eq!(*seen.lock(), vec![b"keep".to_vec()]);
    }

    #[test]
    fn router_rejects_unregistered_protocol() {
        let router = BroadcastRouter::new();
        let spec = BroadcastChannelSpec::parse("redis://h:6379").expect("parse");
        match router.publisher(&spec, None) {
            Err(Error::Config(ConfigError::UnsupportedTransport(p))) => assert_eq!(p, "redis"),
            other => panic!("expected UnsupportedTransport, got {:?}", other.err()),
        }
    }

    #[test]
    fn registered_driver_is_resolved() {
        struct NullDriver;
        impl BroadcastDriver for NullDriver {
            fn subscribe(
                &self,
                _locator: &ConnectionLocator,
                _filter: TopicFilter,
                _handler: BroadcastHandler,
                _hook: Option<WireToUserHook>,
            ) -> Result<(), TransportError> {
                Ok(())
            }
            fn publisher(
                &self,
                _locator: &ConnectionLocator,
                _hook: Option<UserToWireHook>,
            ) -> Result<Publisher, TransportError> {
                Ok(Arc::new(|_| {}))
            }
        }

        let router = BroadcastRouter::new();
        router.register_driver(BroadcastProtocol::Redis, Arc::new(NullDriver));
        let spec = BroadcastChannelSpec::parse("redis://h:6379").expect("parse");
        assert!(router.publisher(&spec, None).is_ok());
        assert!(router
            .subscribe(&spec, TopicFilter::Any, Box::new(|_| {}), None)
            .is_ok());
    }
}
