// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process RPC connector.
//!
//! Serves facilities from a handler inside the same process, without any
//! network transport. Used for local facilities and as the test double
//! for the session layer: the service receives the same correlated byte
//! payloads a remote server would, and pushes replies through the same
//! [`ReplySender`] path, including server-initiated streaming pushes.

use crate::error::TransportError;
use crate::locator::ConnectionLocator;
use std::sync::Arc;
use uuid::Uuid;

use super::session::{ReplySender, RpcChannel, RpcConnector};

/// Request handler backing a loopback facility.
pub trait LoopbackService: Send + Sync {
    /// Called once per session open; keep a clone of `replies` to push
    /// server-initiated messages later.
    fn on_open(&self, _locator: &ConnectionLocator, _replies: ReplySender) {}

    /// Handle one correlated request. Replies may be sent synchronously
    /// or at any later point through a kept [`ReplySender`].
    fn handle(
        &self,
        locator: &ConnectionLocator,
        correlation_id: Uuid,
        payload: &[u8],
        replies: &ReplySender,
    );
}

/// Connector that serves every locator from one in-process service.
pub struct LoopbackConnector {
    service: Arc<dyn LoopbackService>,
}

impl LoopbackConnector {
    pub fn new(service: Arc<dyn LoopbackService>) -> Self {
        Self { service }
    }
}

impl RpcConnector for LoopbackConnector {
    fn connect(
        &self,
        locator: &ConnectionLocator,
        replies: ReplySender,
    ) -> Result<Box<dyn RpcChannel>, TransportError> {
        self.service.on_open(locator, replies.clone());
        Ok(Box::new(LoopbackChannel {
            locator: locator.clone(),
            service: Arc::clone(&self.service),
            replies,
        }))
    }
}

struct LoopbackChannel {
    locator: ConnectionLocator,
    service: Arc<dyn LoopbackService>,
    replies: ReplySender,
}

impl RpcChannel for LoopbackChannel {
    fn send(&mut self, correlation_id: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        self.service
            .handle(&self.locator, correlation_id, payload, &self.replies);
        Ok(())
    }

    fn close(&mut self) {}
}

/// Connector that refuses every connection; register-failure test double.
pub struct RefusingConnector;

impl RpcConnector for RefusingConnector {
    fn connect(
        &self,
        locator: &ConnectionLocator,
        _replies: ReplySender,
    ) -> Result<Box<dyn RpcChannel>, TransportError> {
        Err(TransportError::ConnectFailed(format!(
            "loopback refused {}",
            locator
        )))
    }
}
