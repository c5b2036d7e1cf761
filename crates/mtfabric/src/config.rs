// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration: wire constants and runtime tunables.
//!
//! Compile-time constants cover the fixed parts of the wire contract
//! (staging buffer size, poll periods). [`RuntimeConfig`] reads the
//! `MTFABRIC_*` environment knobs once at component construction.

use std::time::Duration;

/// Staging buffer for broadcast subscriber threads (16 MiB).
///
/// Frames larger than this are dropped, not partially delivered.
pub const RECV_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Staging buffer for multicast datagrams (64 KiB covers the UDP maximum).
pub const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// Receive timeout on broadcast subscriber sockets.
///
/// Worker threads observe the stop flag between receives, so this bounds
/// shutdown latency for the receive side.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Condition-variable wait used by publisher drain loops.
pub const PUBLISH_WAIT: Duration = Duration::from_millis(1);

/// Poll period for facility session workers between queue checks.
pub const SESSION_POLL: Duration = Duration::from_millis(10);

/// Default heartbeat TTL when the caller does not supply one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3);

/// Default liveness check period for the facility tick clock.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// Runtime tunables read from the environment.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Broadcast staging buffer size (`MTFABRIC_RECV_BUFFER`).
    pub recv_buffer_size: usize,
    /// Subscriber socket receive timeout in milliseconds (`MTFABRIC_RECV_TIMEOUT_MS`).
    pub recv_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: RECV_BUFFER_SIZE,
            recv_timeout: RECV_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from `MTFABRIC_*` environment variables.
    ///
    /// Unset or unparseable variables fall back to the compiled defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = read_env_usize("MTFABRIC_RECV_BUFFER") {
            cfg.recv_buffer_size = n;
        }
        if let Some(ms) = read_env_usize("MTFABRIC_RECV_TIMEOUT_MS") {
            cfg.recv_timeout = Duration::from_millis(ms as u64);
        }
        cfg
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    match std::env::var(key) {
        Ok(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                log::warn!("[config] ignoring {}={:?} (not a positive integer)", key, v);
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_constants() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.recv_buffer_size, RECV_BUFFER_SIZE);
        assert_eq!(cfg.recv_timeout, Duration::from_secs(1));
    }

    #[test]
    fn bad_env_value_falls_back() {
        std::env::set_var("MTFABRIC_RECV_BUFFER", "not-a-number");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.recv_buffer_size, RECV_BUFFER_SIZE);
        std::env::remove_var("MTFABRIC_RECV_BUFFER");
    }
}
