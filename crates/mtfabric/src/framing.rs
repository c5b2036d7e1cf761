// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast wire framing and user/wire byte hooks.
//!
//! Every broadcast frame is a single CBOR value encoding
//! `[topic: text-string, content: byte-string]`. Frames that fail to
//! decode, or that leave trailing bytes, are rejected and dropped by the
//! receiving worker.

use crate::error::DecodeError;
use serde_bytes::{ByteBuf, Bytes};
use std::sync::Arc;

/// The universal broadcast payload: a topic plus opaque content bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteDataWithTopic {
    pub topic: String,
    pub content: Vec<u8>,
}

impl ByteDataWithTopic {
    pub fn new(topic: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            content: content.into(),
        }
    }
}

/// Encode a frame as the canonical two-element CBOR array.
pub fn encode_frame(data: &ByteDataWithTopic) -> Vec<u8> {
    // (str, bytes) serializes as [text-string, byte-string]. Encoding an
    // in-memory pair cannot fail short of allocation failure.
    serde_cbor::to_vec(&(data.topic.as_str(), Bytes::new(&data.content)))
        .unwrap_or_default()
}

/// Decode a frame, rejecting trailing bytes.
pub fn decode_frame(raw: &[u8]) -> Result<ByteDataWithTopic, DecodeError> {
    // serde_cbor::from_slice drives the deserializer to end-of-input, so a
    // frame with trailing bytes comes back as an error rather than a value.
    let (topic, content): (String, ByteBuf) = serde_cbor::from_slice(raw)?;
    Ok(ByteDataWithTopic {
        topic,
        content: content.into_vec(),
    })
}

/// Transform applied to content bytes leaving the user (user -> wire).
pub type UserToWireHook = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Transform applied to content bytes arriving from the wire
/// (wire -> user). Returning `None` suppresses delivery to that client.
pub type WireToUserHook = Arc<dyn Fn(Vec<u8>) -> Option<Vec<u8>> + Send + Sync>;

/// Paired hooks for a bidirectional session.
#[derive(Clone)]
pub struct ByteDataHookPair {
    pub user_to_wire: UserToWireHook,
    pub wire_to_user: WireToUserHook,
}

/// Per-session hook source: `(facility_name, locator) -> Option<pair>`.
///
/// Called once per session open; `None` means raw bytes both directions.
pub type HookPairFactory =
    Arc<dyn Fn(&str, &crate::locator::ConnectionLocator) -> Option<ByteDataHookPair> + Send + Sync>;
