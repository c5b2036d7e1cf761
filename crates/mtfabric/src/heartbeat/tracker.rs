// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat-to-action controller.
//!
//! Consumes heartbeat messages plus periodic clock ticks and derives
//! per-connection lifecycle actions. An observed `(sender, facility)`
//! pair is alive while its last heartbeat is at most `ttl` old; crossing
//! that edge in either direction emits `Register` or `Deregister`, and
//! every tracked pair contributes exactly one action per tick so
//! downstream consumers see a stable per-tick array.

use crate::broadcast::anchor_whole;
use crate::facility::{
    parse_facility_channel, FacilityActionType, FacilityConnectionType, RemoteFacilityAction,
};
use crate::heartbeat::HeartbeatMessage;
use crate::locator::ConnectionLocator;
use regex::Regex;
use std::time::{Duration, Instant};

/// Input to one `process` call: a heartbeat observation or a clock tick,
/// each stamped with the observation time.
#[derive(Clone, Debug)]
pub enum HeartbeatInput {
    Heartbeat(Instant, HeartbeatMessage),
    Tick(Instant),
}

/// Tracks which `(sender, facility)` pairs are currently alive under a
/// TTL and emits lifecycle actions on every tick.
///
/// Externally single-threaded: callers serialize `process` invocations.
pub struct HeartbeatTracker {
    sender_re: Regex,
    facility_re: Regex,
    ttl: Duration,
    // Insertion-ordered; tick output order is the order pairs were first
    // observed.
    entries: Vec<TrackedEntry>,
}

struct TrackedEntry {
    sender: String,
    facility: String,
    connection_type: FacilityConnectionType,
    locator: ConnectionLocator,
    last_seen: Instant,
    registered: bool,
}

impl HeartbeatTracker {
    /// Both regexes match against the whole sender or facility name; they
    /// are anchored here, so an unanchored pattern cannot admit partial
    /// names.
    pub fn new(sender_re: Regex, facility_re: Regex, ttl: Duration) -> Self {
        Self {
            sender_re: anchor_whole(&sender_re),
            facility_re: anchor_whole(&facility_re),
            ttl,
            entries: Vec::new(),
        }
    }

    /// Number of `(sender, facility)` pairs currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Absorb one heartbeat or tick; returns the actions it produced.
    ///
    /// Heartbeats only update state. Ticks emit one action per tracked
    /// pair: `Register` on the dead-to-alive edge, `Deregister` on the
    /// alive-to-dead edge, `NoChange` otherwise.
    pub fn process(&mut self, input: HeartbeatInput) -> Vec<RemoteFacilityAction> {
        match input {
            HeartbeatInput::Heartbeat(observed, message) => {
                self.absorb_heartbeat(observed, &message);
                Vec::new()
            }
            HeartbeatInput::Tick(now) => self.tick(now),
        }
    }

    fn absorb_heartbeat(&mut self, observed: Instant, message: &HeartbeatMessage) {
        if !self.sender_re.is_match(&message.sender_name) {
            return;
        }
        for (facility, channel) in &message.facility_channels {
            if !self.facility_re.is_match(facility) {
                continue;
            }
            let (connection_type, locator) = match parse_facility_channel(channel) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::debug!(
                        "[heartbeat] ignoring channel '{}' for {}/{}: {}",
                        channel,
                        message.sender_name,
                        facility,
                        e
                    );
                    continue;
                }
            };
            match self
                .entries
                .iter_mut()
                .find(|e| e.sender == message.sender_name && e.facility == *facility)
            {
                Some(entry) => {
                    entry.connection_type = connection_type;
                    entry.locator = locator;
                    entry.last_seen = observed;
                }
                None => self.entries.push(TrackedEntry {
                    sender: message.sender_name.clone(),
                    facility: facility.clone(),
                    connection_type,
                    locator,
                    last_seen: observed,
                    registered: false,
                }),
            }
        }
    }

    fn tick(&mut self, now: Instant) -> Vec<RemoteFacilityAction> {
        let ttl = self.ttl;
        self.entries
            .iter_mut()
            .map(|entry| {
                let alive = now.saturating_duration_since(entry.last_seen) <= ttl;
                let action_type = match (alive, entry.registered) {
                    (true, false) => {
                        entry.registered = true;
                        FacilityActionType::Register
                    }
                    (false, true) => {
                        entry.registered = false;
                        FacilityActionType::Deregister
                    }
                    _ => FacilityActionType::NoChange,
                };
                RemoteFacilityAction::new(
                    action_type,
                    entry.connection_type,
                    entry.locator.clone(),
                    build_status_info(entry.connection_type, &entry.locator),
                )
            })
            .collect()
    }
}

/// Describe a connection as `"<connection-type>://<locator>"`.
pub fn build_status_info(
    connection_type: FacilityConnectionType,
    locator: &ConnectionLocator,
) -> String {
    format!("{}://{}", connection_type, locator)
}

/// Reverse of [`build_status_info`]; `None` if the string does not parse.
pub fn parse_status_info(
    action_type: FacilityActionType,
    status_info: &str,
) -> Option<RemoteFacilityAction> {
    let (connection_type, locator) = parse_facility_channel(status_info).ok()?;
    Some(RemoteFacilityAction::new(
        action_type,
        connection_type,
        locator,
        status_info,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(ttl_secs: u64) -> HeartbeatTracker {
        HeartbeatTracker::new(
            Regex::new("^svc.*").expect("regex"),
            Regex::new("^f$").expect("regex"),
            Duration::from_secs(ttl_secs),
        )
    }

    fn heartbeat(sender: &str, facility: &str, channel: &str) -> HeartbeatMessage {
        HeartbeatMessage::new(sender, "hostA").with_facility_channel(facility, channel)
    }

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn register_then_no_change() {
        // Heartbeats at t=0,1,2 from svc1 advertising facility f at
        // redis://h:6379; ticks at t=0.5,1.5,2.5 yield
        // [Register, NoChange, NoChange].
        let base = Instant::now();
        let mut tracker = tracker(3);

        let mut tick_actions = Vec::new();
        for (hb_ms, tick_ms) in [(0, 500), (1000, 1500), (2000, 2500)] {
            let produced = tracker.process(HeartbeatInput::Heartbeat(
                at(base, hb_ms),
                heartbeat("svc1", "f", "redis://h:6379"),
            ));
            assert!(produced.is_empty(), "heartbeats emit no actions");
            let actions = tracker.process(HeartbeatInput::Tick(at(base, tick_ms)));
            assert_eq!(actions.len(), 1);
            tick_actions.push(actions[0].action_type);
        }

        assert_eq!(
            tick_actions,
            vec![
                FacilityActionType::Register,
                FacilityActionType::NoChange,
                FacilityActionType::NoChange,
            ]
        );
    }

    #[test]
    fn deregister_strictly_after_ttl() {
        // Continue the register scenario with no heartbeats after t=2.
        // Expiry is at t=5; ticks at 3.5 and 4.5 are NoChange, 5.5 is the
        // first tick strictly after and yields Deregister.
        let base = Instant::now();
        let mut tracker = tracker(3);

        tracker.process(HeartbeatInput::Heartbeat(
            at(base, 2000),
            heartbeat("svc1", "f", "redis://h:6379"),
        ));
        tracker.process(HeartbeatInput::Tick(at(base, 2500)));

        let kinds: Vec<FacilityActionType> = [3500, 4500, 5500]
            .iter()
            .map(|&ms| {
                tracker.process(HeartbeatInput::Tick(at(base, ms)))[0].action_type
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                FacilityActionType::NoChange,
                FacilityActionType::NoChange,
                FacilityActionType::Deregister,
            ]
        );
    }

    #[test]
    fn boundary_tick_is_still_alive() {
        // now - last_seen == ttl is alive; deregistration is strictly after.
        let base = Instant::now();
        let mut tracker = tracker(3);
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "f", "redis://h:6379"),
        ));
        tracker.process(HeartbeatInput::Tick(base));

        let actions = tracker.process(HeartbeatInput::Tick(at(base, 3000)));
        assert_eq!(actions[0].action_type, FacilityActionType::NoChange);
    }

    #[test]
    fn reregisters_when_heartbeats_resume() {
        let base = Instant::now();
        let mut tracker = tracker(1);
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "f", "redis://h:6379"),
        ));
        assert_eq!(
            tracker.process(HeartbeatInput::Tick(at(base, 100)))[0].action_type,
            FacilityActionType::Register
        );
        assert_eq!(
            tracker.process(HeartbeatInput::Tick(at(base, 2000)))[0].action_type,
            FacilityActionType::Deregister
        );

        tracker.process(HeartbeatInput::Heartbeat(
            at(base, 3000),
            heartbeat("svc1", "f", "redis://h:6379"),
        ));
        assert_eq!(
            tracker.process(HeartbeatInput::Tick(at(base, 3100)))[0].action_type,
            FacilityActionType::Register
        );
    }

    #[test]
    fn sender_and_facility_regexes_filter() {
        let base = Instant::now();
        let mut tracker = tracker(3);

        // Wrong sender, wrong facility, and a facility that only
        // substring-matches must all be ignored.
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("other1", "f", "redis://h:6379"),
        ));
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "g", "redis://h:6379"),
        ));
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "ff", "redis://h:6379"),
        ));
        assert_eq!(tracker.tracked_count(), 0);

        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "f", "redis://h:6379"),
        ));
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[test]
    fn alternation_sender_regex_tracks_both_senders() {
        // Leftmost-first matching must not reject a sender whose name is
        // only matched by the longer alternative.
        let base = Instant::now();
        let mut tracker = HeartbeatTracker::new(
            Regex::new("^svc1|^svc-special").expect("regex"),
            Regex::new("^f$").expect("regex"),
            Duration::from_secs(3),
        );

        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "f", "redis://h1:6379"),
        ));
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc-special", "f", "redis://h2:6379"),
        ));
        assert_eq!(tracker.tracked_count(), 2);

        let actions = tracker.process(HeartbeatInput::Tick(at(base, 100)));
        assert!(actions
            .iter()
            .all(|a| a.action_type == FacilityActionType::Register));
    }

    #[test]
    fn malformed_channel_is_skipped() {
        let base = Instant::now();
        let mut tracker = tracker(3);
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "f", "not-a-spec"),
        ));
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn tick_order_is_insertion_order() {
        let base = Instant::now();
        let mut tracker = HeartbeatTracker::new(
            Regex::new("^svc.*").expect("regex"),
            Regex::new("^f$").expect("regex"),
            Duration::from_secs(3),
        );
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc2", "f", "redis://h2:6379"),
        ));
        tracker.process(HeartbeatInput::Heartbeat(
            base,
            heartbeat("svc1", "f", "redis://h1:6379"),
        ));

        let actions = tracker.process(HeartbeatInput::Tick(at(base, 100)));
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].locator.host(), "h2");
        assert_eq!(actions[1].locator.host(), "h1");
    }

    #[test]
    fn status_info_round_trips() {
        let locator = ConnectionLocator::parse("alice@h:6379/db?mode=fast").expect("locator");
        let info = build_status_info(FacilityConnectionType::Redis, &locator);
        assert_eq!(info, "redis://alice@h:6379/db?mode=fast");

        let action = parse_status_info(FacilityActionType::Register, &info)
            .expect("status info should parse");
        assert_eq!(action.action_type, FacilityActionType::Register);
        assert_eq!(action.connection_type, FacilityConnectionType::Redis);
        assert_eq!(action.locator, locator);
        assert_eq!(action.description, info);

        assert!(parse_status_info(FacilityActionType::Register, "garbage").is_none());
    }
}
