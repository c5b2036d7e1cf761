// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parsed endpoint addresses.
//!
//! A [`ConnectionLocator`] is the identity used for session lookup across
//! the whole fabric: two locators that compare equal name the same remote
//! endpoint. Equality and hashing are structural over every field.
//!
//! Textual form:
//!
//! ```text
//! [username[:password]@]host:port[/identifier][?key=value&...]
//! ```
//!
//! `Display` and [`ConnectionLocator::parse`] round-trip losslessly, which
//! the heartbeat status strings rely on.

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::fmt;

/// Parsed endpoint address with free-form per-connection properties.
///
/// `properties` is a `BTreeMap` so serialization and hashing are stable
/// regardless of insertion order. Adapters use it to carry per-connection
/// knobs (topic filters, HTTP headers, auth tokens).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionLocator {
    host: String,
    port: u16,
    identifier: String,
    username: String,
    password: String,
    properties: BTreeMap<String, String>,
}

impl ConnectionLocator {
    /// Create a locator from host and port only.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Builder-style identifier setter.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Builder-style credential setter.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Builder-style property setter.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Property lookup by key.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Reduce to the `(host, port)` pair that keys shared endpoint workers.
    #[must_use]
    pub fn host_and_port(&self) -> Self {
        Self::new(self.host.clone(), self.port)
    }

    /// Parse the textual form.
    ///
    /// Accepts `[user[:pass]@]host:port[/identifier][?k=v&...]`. The host
    /// must be non-empty and the port a valid `u16`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let malformed = || ConfigError::MalformedLocator(text.to_string());

        let (addr_part, query) = match text.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (text, None),
        };

        let (creds, host_part) = match addr_part.rsplit_once('@') {
            Some((c, h)) => (Some(c), h),
            None => (None, addr_part),
        };

        let (endpoint, identifier) = match host_part.split_once('/') {
            Some((e, id)) => (e, id.to_string()),
            None => (host_part, String::new()),
        };

        let (host, port_str) = endpoint.split_once(':').ok_or_else(malformed)?;
        if host.is_empty() {
            return Err(malformed());
        }
        let port: u16 = port_str.parse().map_err(|_| malformed())?;

        let (username, password) = match creds {
            Some(c) => match c.split_once(':') {
                Some((u, p)) => (u.to_string(), p.to_string()),
                None => (c.to_string(), String::new()),
            },
            None => (String::new(), String::new()),
        };

        let mut properties = BTreeMap::new();
        if let Some(q) = query {
            for pair in q.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = pair.split_once('=').ok_or_else(malformed)?;
                if k.is_empty() {
                    return Err(malformed());
                }
                properties.insert(k.to_string(), v.to_string());
            }
        }

        Ok(Self {
            host: host.to_string(),
            port,
            identifier,
            username,
            password,
            properties,
        })
    }
}

impl fmt::Display for ConnectionLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.username.is_empty() || !self.password.is_empty() {
            write!(f, "{}", self.username)?;
            if !self.password.is_empty() {
                write!(f, ":{}", self.password)?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}:{}", self.host, self.port)?;
        if !self.identifier.is_empty() {
            write!(f, "/{}", self.identifier)?;
        }
        let mut sep = '?';
        for (k, v) in &self.properties {
            write!(f, "{}{}={}", sep, k, v)?;
            sep = '&';
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_and_port() {
        let l = ConnectionLocator::parse("h:6379").expect("should parse");
        assert_eq!(l.host(), "h");
        assert_eq!(l.port(), 6379);
        assert_eq!(l.identifier(), "");
        assert!(l.properties().is_empty());
    }

    #[test]
    fn parse_full_form() {
        let l = ConnectionLocator::parse("alice:secret@broker:5672/orders?vhost=prod&tls=1")
            .expect("should parse");
        assert_eq!(l.username(), "alice");
        assert_eq!(l.password(), "secret");
        assert_eq!(l.host(), "broker");
        assert_eq!(l.port(), 5672);
        assert_eq!(l.identifier(), "orders");
        assert_eq!(l.property("vhost"), Some("prod"));
        assert_eq!(l.property("tls"), Some("1"));
    }

    #[test]
    fn display_round_trips() {
        for text in [
            "h:6379",
            "h:6379/queue",
            "h:6379?topic=x",
            "alice:secret@broker:5672/orders?vhost=prod",
            "bob@broker:5672",
        ] {
            let l = ConnectionLocator::parse(text).expect("should parse");
            let printed = l.to_string();
            let reparsed = ConnectionLocator::parse(&printed).expect("printed form should parse");
            assert_eq!(l, reparsed, "round trip failed for {}", text);
        }
    }

    #[test]
    fn rejects_malformed() {
        for text in ["", "h", "h:", "h:notaport", ":1234", "h:1?novalue"] {
            assert!(
                ConnectionLocator::parse(text).is_err(),
                "{:?} should be rejected",
                text
            );
        }
    }

    #[test]
    fn structural_equality_and_hash() {
        use std::collections::HashSet;

        let a = ConnectionLocator::new("h", 1).with_property("k", "v");
        let b = ConnectionLocator::new("h", 1).with_property("k", "v");
        let c = ConnectionLocator::new("h", 2);

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn host_and_port_strips_extras() {
        let l = ConnectionLocator::parse("u:p@h:9/id?x=1").expect("should parse");
        assert_eq!(l.host_and_port(), ConnectionLocator::new("h", 9));
    }
}
