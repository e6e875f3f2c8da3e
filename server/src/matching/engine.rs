//! The matching engine: one lock around all shared matching state.
//!
//! Every mutation of the queue, pair map, device registry, ban registry and
//! report counters happens inside a single `Mutex<MatchState>` critical
//! section. Nothing awaits or sends on a socket while the lock is held:
//! operations collect [`Effect`]s and dispatch them after the guard drops.
//! A notification can therefore race with the peer's own disconnect, in which
//! case the send fails silently.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::category::{Category, Filter};
use super::pairs::PairMap;
use super::queue::{MatchQueue, QueueEntry};
use super::registry::{DeviceRegistry, PeerProfile, RemainingLimits};
use crate::clock::SharedClock;
use crate::config::MatchingConfig;
use crate::db::{PersistCommand, PersistSink};
use crate::error::MatchError;
use crate::moderation::{BanKind, BanRecord, BanRegistry, BanStatus, ReportCounter};
use crate::ws::broadcast::{force_close_device, send_event, send_to_device};
use crate::ws::protocol::ServerEvent;
use crate::ws::{ConnectionRegistry, ConnectionSender};

/// Close code sent to a device when it is banned.
pub const CLOSE_BANNED: u16 = 4003;

const MIN_DEVICE_ID_LEN: usize = 8;
const MAX_DEVICE_ID_LEN: usize = 128;

/// Successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Matched {
        peer: String,
        peer_profile: PeerProfile,
        limits: RemainingLimits,
    },
    Queued {
        filter: Filter,
        limits: RemainingLimits,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub target: String,
    pub report_count: u32,
    /// True when this report triggered a new ban.
    pub banned: bool,
}

/// Sizes of the tracked state, logged periodically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub queued: usize,
    pub paired: usize,
    pub devices: usize,
    pub bans: usize,
    pub connections: usize,
}

/// Side effect produced inside the critical section, run after it.
enum Effect {
    Notify(ConnectionSender, ServerEvent),
    NotifyDevice(String, ServerEvent),
    Close(String, u16, String),
    Persist(PersistCommand),
}

struct MatchState {
    registry: DeviceRegistry,
    queue: MatchQueue,
    pairs: PairMap,
    bans: BanRegistry,
    reports: ReportCounter,
}

pub struct MatchEngine {
    state: Mutex<MatchState>,
    connections: ConnectionRegistry,
    sink: PersistSink,
    clock: SharedClock,
    config: MatchingConfig,
}

/// Reject device ids that are too short, too long, or contain control characters.
pub fn validate_device_id(device_id: &str) -> Result<(), MatchError> {
    let len = device_id.chars().count();
    if len < MIN_DEVICE_ID_LEN || len > MAX_DEVICE_ID_LEN {
        return Err(MatchError::validation("Invalid device_id"));
    }
    if device_id.chars().any(char::is_control) {
        return Err(MatchError::validation("Invalid device_id"));
    }
    Ok(())
}

impl MatchEngine {
    pub fn new(
        config: MatchingConfig,
        clock: SharedClock,
        sink: PersistSink,
        connections: ConnectionRegistry,
    ) -> Self {
        let ban_ttl = config.ban_duration();
        Self {
            state: Mutex::new(MatchState {
                registry: DeviceRegistry::new(),
                queue: MatchQueue::new(),
                pairs: PairMap::new(),
                bans: BanRegistry::new(ban_ttl),
                reports: ReportCounter::new(config.report_threshold),
            }),
            connections,
            sink,
            clock,
            config,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Send a close frame to every live connection. Returns how many were asked to close.
    pub fn close_all_connections(&self, code: u16, reason: &str) -> usize {
        let device_ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for device_id in &device_ids {
            force_close_device(&self.connections, device_id, code, reason);
        }
        device_ids.len()
    }

    fn lock(&self) -> MutexGuard<'_, MatchState> {
        // No section panics between related writes, so poisoned state is consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Connection registry ---

    /// Register the live connection for a device.
    /// Returns false if another live connection already holds this device id.
    pub fn register_connection(&self, device_id: &str, tx: ConnectionSender) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.connections.entry(device_id.to_string()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_closed() {
                    return false;
                }
                existing.insert(tx);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    /// Remove the device's connection, but only if it is still `tx`.
    pub fn unregister_connection(&self, device_id: &str, tx: &ConnectionSender) {
        self.connections
            .remove_if(device_id, |_, current| current.same_channel(tx));
    }

    // --- Bans ---

    /// Authoritative ban check. Expires stale temporary bans as a side effect.
    pub fn ban_status(&self, device_id: &str) -> Option<BanRecord> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.check_ban(device_id, now)
    }

    pub fn is_banned(&self, device_id: &str) -> bool {
        self.ban_status(device_id).is_some()
    }

    pub fn report_count(&self, device_id: &str) -> u32 {
        self.lock().reports.count(device_id)
    }

    /// Administrative ban. The only way to issue a permanent ban.
    pub fn ban(&self, device_id: &str, reason: &str, kind: BanKind) -> BanRecord {
        let record = BanRecord {
            reason: reason.to_string(),
            issued_at: self.clock.now(),
            kind,
        };
        let mut effects = Vec::new();
        let stored = self.lock().issue_ban(device_id, record, &mut effects);
        tracing::info!(
            device_id = %device_id,
            kind = ?stored.kind,
            reason = %stored.reason,
            "Device banned"
        );
        self.run(effects);
        stored
    }

    /// Lift any ban and clear the report counter. Returns true if a ban existed.
    pub fn unban(&self, device_id: &str) -> bool {
        let mut state = self.lock();
        state.reports.reset(device_id);
        let lifted = state.bans.lift(device_id).is_some();
        if lifted {
            tracing::info!(device_id = %device_id, "Ban lifted");
        }
        lifted
    }

    // --- Device profile ---

    /// Remaining matches per category today.
    pub fn remaining_limits(&self, device_id: &str) -> RemainingLimits {
        let today = self.clock.today();
        let mut effects = Vec::new();
        let limits = {
            let mut state = self.lock();
            state.touch(device_id, today, &mut effects);
            state
                .registry
                .remaining(device_id, today, self.config.daily_quota)
        };
        self.run(effects);
        limits
    }

    /// Record the verified category for a device.
    pub fn set_category(&self, device_id: &str, category: Category) {
        let today = self.clock.today();
        let mut effects = Vec::new();
        {
            let mut state = self.lock();
            state.touch(device_id, today, &mut effects).category = Some(category);
        }
        effects.push(Effect::Persist(PersistCommand::UpsertDevice {
            device_id: device_id.to_string(),
            category: Some(category),
            nickname: None,
        }));
        self.run(effects);
    }

    pub fn category_of(&self, device_id: &str) -> Option<Category> {
        self.lock()
            .registry
            .get(device_id)
            .and_then(|p| p.category)
    }

    fn validate_nickname(&self, nickname: Option<String>) -> Result<Option<String>, MatchError> {
        let Some(nickname) = nickname else {
            return Ok(None);
        };
        let trimmed = nickname.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.chars().count() > self.config.max_nickname_chars
            || trimmed.chars().any(char::is_control)
        {
            return Err(MatchError::validation("Invalid nickname"));
        }
        Ok(Some(trimmed.to_string()))
    }

    // --- Matching ---

    /// Admit a device to matching: pair it with the first eligible waiting
    /// device, or queue it under its filter.
    pub fn join(
        &self,
        device_id: &str,
        filter: Filter,
        nickname: Option<String>,
        connection: &ConnectionSender,
    ) -> Result<JoinOutcome, MatchError> {
        validate_device_id(device_id)?;
        let nickname = self.validate_nickname(nickname)?;

        // Cheap short-circuit before contending for the critical section.
        if let Some(ban) = self.ban_status(device_id) {
            return Err(MatchError::Banned { reason: ban.reason });
        }

        let now = self.clock.now();
        let today = self.clock.today();
        let quota = self.config.daily_quota;
        let mut effects = Vec::new();

        let outcome = {
            let mut state = self.lock();
            state.join(
                device_id,
                filter,
                nickname,
                connection,
                now,
                today,
                quota,
                self.config.join_cooldown(),
                &mut effects,
            )
        };

        match &outcome {
            Ok(JoinOutcome::Matched { peer, .. }) => {
                tracing::info!(device_id = %device_id, peer = %peer, filter = %filter, "Matched");
            }
            Ok(JoinOutcome::Queued { .. }) => {
                tracing::debug!(device_id = %device_id, filter = %filter, "Queued");
            }
            Err(e) => {
                tracing::debug!(device_id = %device_id, filter = %filter, error = %e, "Join rejected");
            }
        }

        self.run(effects);
        outcome
    }

    /// Remove the device from every bucket and dissolve its pair.
    /// The former peer is told `peer_left`. Idempotent.
    pub fn leave(&self, device_id: &str) -> bool {
        let mut effects = Vec::new();
        let changed = {
            let mut state = self.lock();
            state.evict(device_id, &mut effects)
        };
        if changed {
            tracing::debug!(device_id = %device_id, "Left matching");
        }
        self.run(effects);
        changed
    }

    /// Leave, ending in a fresh unpaired and unqueued state.
    pub fn next(&self, device_id: &str) -> bool {
        self.leave(device_id)
    }

    // --- Relay ---

    /// Relay chat text to the sender's peer. Returns whether it was handed to
    /// a live peer connection. At most once; undelivered text is dropped.
    pub fn relay_text(&self, from: &str, text: &str) -> Result<bool, MatchError> {
        let text = text.trim();
        if text.is_empty() || text.chars().count() > self.config.max_message_chars {
            return Err(MatchError::validation("Invalid message"));
        }
        let Some(peer) = self.peer_of(from) else {
            return Ok(false);
        };
        Ok(send_to_device(
            &self.connections,
            &peer,
            &ServerEvent::Msg {
                from: from.to_string(),
                text: text.to_string(),
            },
        ))
    }

    pub fn relay_typing(&self, from: &str) -> bool {
        let Some(peer) = self.peer_of(from) else {
            return false;
        };
        send_to_device(
            &self.connections,
            &peer,
            &ServerEvent::Typing {
                from: from.to_string(),
            },
        )
    }

    pub fn peer_of(&self, device_id: &str) -> Option<String> {
        self.lock().pairs.peer_of(device_id).map(str::to_string)
    }

    pub fn queued_filter(&self, device_id: &str) -> Option<Filter> {
        self.lock().queue.filter_of(device_id)
    }

    // --- Reports ---

    /// Count a report against `target`; the threshold-th report issues a
    /// temporary ban unless one is already active.
    pub fn report(
        &self,
        reporter: &str,
        target: &str,
        reason: &str,
    ) -> Result<ReportOutcome, MatchError> {
        validate_device_id(target)?;
        if reporter == target {
            return Err(MatchError::validation("Cannot report yourself"));
        }

        let now = self.clock.now();
        let mut effects = vec![Effect::Persist(PersistCommand::AppendReport {
            reporter: reporter.to_string(),
            reported: target.to_string(),
            reason: reason.to_string(),
        })];

        let outcome = {
            let mut state = self.lock();
            let already_banned = state.check_ban(target, now).is_some();
            let report_count = state.reports.record(target);
            let banned = !already_banned && state.reports.reached_threshold(target);
            if banned {
                let record = BanRecord {
                    reason: format!("Auto-banned after {report_count} reports: {reason}"),
                    issued_at: now,
                    kind: BanKind::Temporary,
                };
                state.issue_ban(target, record, &mut effects);
            }
            ReportOutcome {
                target: target.to_string(),
                report_count,
                banned,
            }
        };

        tracing::info!(
            reporter = %reporter,
            target = %target,
            count = outcome.report_count,
            banned = outcome.banned,
            "Device reported"
        );
        self.run(effects);
        Ok(outcome)
    }

    // --- Introspection ---

    pub fn stats(&self) -> EngineStats {
        let state = self.lock();
        EngineStats {
            queued: state.queue.len(),
            paired: state.pairs.len(),
            devices: state.registry.len(),
            bans: state.bans.len(),
            connections: self.connections.len(),
        }
    }

    /// Check the structural invariants of the shared state.
    pub fn check_invariants(&self) -> Result<(), String> {
        let state = self.lock();
        if !state.pairs.is_symmetric() {
            return Err("pair map is not symmetric".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for id in state.queue.device_ids() {
            if !seen.insert(id) {
                return Err(format!("{id} queued more than once"));
            }
            if state.pairs.contains(id) {
                return Err(format!("{id} is both queued and paired"));
            }
        }
        for id in state.pairs.device_ids() {
            if state.pairs.peer_of(id) == Some(id) {
                return Err(format!("{id} is paired with itself"));
            }
            if state.bans.contains(id) {
                return Err(format!("{id} is banned but paired"));
            }
        }
        for id in state.queue.device_ids() {
            if state.bans.contains(id) {
                return Err(format!("{id} is banned but queued"));
            }
        }
        for (id, profile) in state.registry.iter() {
            for category in Category::ALL {
                if profile.daily.count(category) > self.config.daily_quota {
                    return Err(format!("{id} exceeded quota for {category}"));
                }
            }
        }
        Ok(())
    }

    /// Run side effects collected under the lock. Must not be called with it held.
    fn run(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(tx, event) => {
                    send_event(&tx, &event);
                }
                Effect::NotifyDevice(device_id, event) => {
                    send_to_device(&self.connections, &device_id, &event);
                }
                Effect::Close(device_id, code, reason) => {
                    force_close_device(&self.connections, &device_id, code, &reason);
                }
                Effect::Persist(command) => self.sink.submit(command),
            }
        }
    }
}

impl MatchState {
    /// Fetch a profile with day rollover applied; a rollover schedules a sync.
    fn touch(
        &mut self,
        device_id: &str,
        today: chrono::NaiveDate,
        effects: &mut Vec<Effect>,
    ) -> &mut super::registry::DeviceProfile {
        let (profile, rolled) = self.registry.touch(device_id, today);
        if rolled {
            effects.push(daily_sync(device_id, profile));
        }
        profile
    }

    fn check_ban(&mut self, device_id: &str, now: DateTime<Utc>) -> Option<BanRecord> {
        match self.bans.check(device_id, now) {
            BanStatus::Active(record) => Some(record),
            BanStatus::Expired => {
                self.reports.reset(device_id);
                tracing::info!(device_id = %device_id, "Temporary ban expired");
                None
            }
            BanStatus::Clean => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn join(
        &mut self,
        device_id: &str,
        filter: Filter,
        nickname: Option<String>,
        connection: &ConnectionSender,
        now: DateTime<Utc>,
        today: chrono::NaiveDate,
        quota: u32,
        cooldown: Duration,
        effects: &mut Vec<Effect>,
    ) -> Result<JoinOutcome, MatchError> {
        // A ban may have landed since the unlocked check.
        if let Some(ban) = self.check_ban(device_id, now) {
            return Err(MatchError::Banned { reason: ban.reason });
        }
        if self.queue.contains(device_id) || self.pairs.contains(device_id) {
            return Err(MatchError::AlreadyActive);
        }

        let profile = self.touch(device_id, today, effects);
        if let Some(last) = profile.last_join {
            if now - last < cooldown {
                return Err(MatchError::Cooldown);
            }
        }
        if let Some(wanted) = filter.category() {
            if profile.daily.count(wanted) >= quota {
                return Err(MatchError::QuotaExceeded(wanted));
            }
        }
        if let Some(nickname) = nickname {
            profile.nickname = Some(nickname.clone());
            effects.push(Effect::Persist(PersistCommand::UpsertDevice {
                device_id: device_id.to_string(),
                category: None,
                nickname: Some(nickname),
            }));
        }
        profile.last_join = Some(now);

        let Some(slot) = self.queue.find_candidate(device_id, filter, &self.registry) else {
            self.queue.enqueue(QueueEntry {
                device_id: device_id.to_string(),
                filter,
                connection: connection.clone(),
                enqueued_at: now,
            });
            let limits = self.registry.remaining(device_id, today, quota);
            return Ok(JoinOutcome::Queued { filter, limits });
        };

        let Some(candidate) = self.queue.take(slot) else {
            return Err(MatchError::validation("Queue changed during match"));
        };
        self.pairs.pair(device_id, &candidate.device_id);

        // Joiner consumes its specific filter; the pre-check above guarantees room.
        if let Some(wanted) = filter.category() {
            let (profile, _) = self.registry.touch(device_id, today);
            profile.daily.try_increment(wanted, quota);
            effects.push(daily_sync(device_id, profile));
        }

        // The candidate consumes the slot of its own verified category.
        let candidate_profile = self.touch(&candidate.device_id, today, effects);
        if let Some(own) = candidate_profile.category {
            if candidate_profile.daily.try_increment(own, quota) {
                effects.push(daily_sync(&candidate.device_id, candidate_profile));
            } else {
                tracing::warn!(
                    device_id = %candidate.device_id,
                    category = %own,
                    "Queued device had no quota left for its category at match time"
                );
            }
        }

        let joiner_view = self.registry.peer_profile(device_id);
        let candidate_view = self.registry.peer_profile(&candidate.device_id);
        let candidate_limits = self
            .registry
            .remaining(&candidate.device_id, today, quota);
        let joiner_limits = self.registry.remaining(device_id, today, quota);

        effects.push(Effect::Notify(
            candidate.connection,
            ServerEvent::Matched {
                peer: device_id.to_string(),
                peer_profile: joiner_view,
                limits: candidate_limits,
            },
        ));

        Ok(JoinOutcome::Matched {
            peer: candidate.device_id,
            peer_profile: candidate_view,
            limits: joiner_limits,
        })
    }

    /// Drop the device from the queue and its pair; tell the former peer.
    fn evict(&mut self, device_id: &str, effects: &mut Vec<Effect>) -> bool {
        let dequeued = self.queue.remove(device_id);
        let peer = self.pairs.dissolve(device_id);
        if let Some(peer) = &peer {
            effects.push(Effect::NotifyDevice(
                peer.clone(),
                ServerEvent::PeerLeft {
                    peer: device_id.to_string(),
                },
            ));
        }
        dequeued || peer.is_some()
    }

    /// Put a ban in force and eject the device. Returns the ban that is active
    /// afterwards, which is the existing one when a permanent ban is already held.
    fn issue_ban(
        &mut self,
        device_id: &str,
        record: BanRecord,
        effects: &mut Vec<Effect>,
    ) -> BanRecord {
        let record = self.bans.issue(device_id, record);
        let message = match record.kind {
            BanKind::Temporary => format!(
                "You have been temporarily banned due to multiple reports. Ban expires in {} hours.",
                self.bans.temporary_ttl().num_hours()
            ),
            BanKind::Permanent => "You have been permanently banned.".to_string(),
        };
        let close_reason = format!("Device banned: {}", record.reason);
        self.evict(device_id, effects);
        effects.push(Effect::NotifyDevice(
            device_id.to_string(),
            ServerEvent::error(message),
        ));
        effects.push(Effect::Close(device_id.to_string(), CLOSE_BANNED, close_reason));
        record
    }
}

fn daily_sync(device_id: &str, profile: &super::registry::DeviceProfile) -> Effect {
    Effect::Persist(PersistCommand::UpsertDailyLimit {
        device_id: device_id.to_string(),
        date: profile.daily.date(),
        counts: profile.daily.counts(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::extract::ws::Message;
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Harness {
        engine: MatchEngine,
        clock: Arc<ManualClock>,
        persisted: mpsc::Receiver<PersistCommand>,
    }

    struct Client {
        id: String,
        tx: ConnectionSender,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        fn events(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let Message::Text(text) = msg {
                    out.push(serde_json::from_str(text.as_str()).unwrap());
                }
            }
            out
        }

        fn close_code(&mut self) -> Option<u16> {
            while let Ok(msg) = self.rx.try_recv() {
                if let Message::Close(Some(frame)) = msg {
                    return Some(frame.code);
                }
            }
            None
        }
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap(),
        ));
        let (sink, persisted) = PersistSink::channel(256);
        let engine = MatchEngine::new(
            MatchingConfig::default(),
            clock.clone(),
            sink,
            crate::ws::new_connection_registry(),
        );
        Harness {
            engine,
            clock,
            persisted,
        }
    }

    impl Harness {
        fn connect(&self, id: &str) -> Client {
            let (tx, rx) = mpsc::unbounded_channel();
            assert!(self.engine.register_connection(id, tx.clone()));
            Client {
                id: id.to_string(),
                tx,
                rx,
            }
        }

        fn join(&self, client: &Client, filter: Filter) -> Result<JoinOutcome, MatchError> {
            self.engine.join(&client.id, filter, None, &client.tx)
        }

        fn drain_persisted(&mut self) -> Vec<PersistCommand> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.persisted.try_recv() {
                out.push(cmd);
            }
            out
        }
    }

    #[test]
    fn second_joiner_is_matched_with_waiting_device() {
        let h = harness();
        let mut a = h.connect("device-aaa");
        let b = h.connect("device-bbb");

        let queued = h.join(&a, Filter::Any).unwrap();
        assert!(matches!(queued, JoinOutcome::Queued { filter: Filter::Any, .. }));

        match h.join(&b, Filter::Any).unwrap() {
            JoinOutcome::Matched {
                peer, peer_profile, ..
            } => {
                assert_eq!(peer, "device-aaa");
                assert_eq!(peer_profile.nickname, "Anon");
                assert_eq!(peer_profile.gender, None);
            }
            other => panic!("expected match, got {other:?}"),
        }

        let events = a.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "matched");
        assert_eq!(events[0]["peer"], "device-bbb");

        assert_eq!(h.engine.peer_of("device-aaa").as_deref(), Some("device-bbb"));
        assert_eq!(h.engine.stats().queued, 0);
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn filters_are_checked_from_the_joiner_side_only() {
        let h = harness();
        let a = h.connect("device-aaa");
        let b = h.connect("device-bbb");
        let c = h.connect("device-ccc");
        h.engine.set_category("device-aaa", Category::Male);
        h.engine.set_category("device-bbb", Category::Female);
        h.engine.set_category("device-ccc", Category::Male);

        // A wants female; B wants female but A is male, so B waits too.
        assert!(matches!(
            h.join(&a, Filter::Only(Category::Female)).unwrap(),
            JoinOutcome::Queued { .. }
        ));
        assert!(matches!(
            h.join(&b, Filter::Only(Category::Female)).unwrap(),
            JoinOutcome::Queued { .. }
        ));

        // C (male, any) takes A even though A asked for female.
        match h.join(&c, Filter::Any).unwrap() {
            JoinOutcome::Matched { peer, .. } => assert_eq!(peer, "device-aaa"),
            other => panic!("expected match, got {other:?}"),
        }
        assert_eq!(
            h.engine.queued_filter("device-bbb"),
            Some(Filter::Only(Category::Female))
        );
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn unverified_devices_only_match_any() {
        let h = harness();
        let a = h.connect("device-aaa");
        let b = h.connect("device-bbb");

        h.join(&a, Filter::Any).unwrap();
        assert!(matches!(
            h.join(&b, Filter::Only(Category::Male)).unwrap(),
            JoinOutcome::Queued { .. }
        ));
        assert_eq!(h.engine.stats().queued, 2);
    }

    #[test]
    fn duplicate_join_is_rejected() {
        let h = harness();
        let a = h.connect("device-aaa");
        h.join(&a, Filter::Any).unwrap();
        h.clock.advance(Duration::seconds(10));
        assert_eq!(h.join(&a, Filter::Any), Err(MatchError::AlreadyActive));
    }

    #[test]
    fn rejoin_within_cooldown_is_rejected() {
        let h = harness();
        let a = h.connect("device-aaa");
        h.join(&a, Filter::Any).unwrap();
        assert!(h.engine.leave("device-aaa"));

        h.clock.advance(Duration::seconds(4));
        assert_eq!(h.join(&a, Filter::Any), Err(MatchError::Cooldown));

        h.clock.advance(Duration::seconds(1));
        assert!(h.join(&a, Filter::Any).is_ok());
    }

    #[test]
    fn specific_filter_quota_is_enforced_per_day() {
        let mut h = harness();
        let a = h.connect("device-aaa");
        h.engine.set_category("device-aaa", Category::Female);

        for n in 0..5 {
            let partner = h.connect(&format!("partner-{n:04}"));
            h.engine.set_category(&partner.id, Category::Male);
            h.join(&partner, Filter::Any).unwrap();

            match h.join(&a, Filter::Only(Category::Male)).unwrap() {
                JoinOutcome::Matched { limits, .. } => assert_eq!(limits.male, 4 - n),
                other => panic!("expected match, got {other:?}"),
            }
            h.engine.leave("device-aaa");
            h.clock.advance(Duration::seconds(6));
        }

        let spare = h.connect("partner-spare");
        h.engine.set_category(&spare.id, Category::Male);
        h.join(&spare, Filter::Any).unwrap();

        assert_eq!(
            h.join(&a, Filter::Only(Category::Male)),
            Err(MatchError::QuotaExceeded(Category::Male))
        );
        h.engine.check_invariants().unwrap();
        // Rejected joins neither queue nor start the cooldown.
        assert_eq!(h.engine.queued_filter("device-aaa"), None);
        assert!(matches!(
            h.join(&a, Filter::Any).unwrap(),
            JoinOutcome::Matched { .. }
        ));

        let limits = h.engine.remaining_limits("device-aaa");
        assert_eq!(limits.male, 0);
        assert_eq!(limits.female, 5);

        let synced = h
            .drain_persisted()
            .into_iter()
            .filter_map(|cmd| match cmd {
                PersistCommand::UpsertDailyLimit {
                    device_id, counts, ..
                } if device_id == "device-aaa" => Some(counts.male),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(synced, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn queued_candidate_spends_its_own_category() {
        let h = harness();
        let a = h.connect("device-aaa");
        let b = h.connect("device-bbb");
        h.engine.set_category("device-bbb", Category::NonBinary);

        h.join(&b, Filter::Any).unwrap();
        h.join(&a, Filter::Only(Category::NonBinary)).unwrap();

        assert_eq!(h.engine.remaining_limits("device-aaa").non_binary, 4);
        let b_limits = h.engine.remaining_limits("device-bbb");
        assert_eq!(b_limits.non_binary, 4);
        assert_eq!(b_limits.male, 5);
        assert_eq!(b_limits.female, 5);
    }

    #[test]
    fn queued_candidate_filter_is_not_charged() {
        let h = harness();
        let a = h.connect("device-aaa");
        let b = h.connect("device-bbb");
        h.engine.set_category("device-aaa", Category::Female);
        h.engine.set_category("device-bbb", Category::Male);

        h.join(&b, Filter::Only(Category::Female)).unwrap();
        h.join(&a, Filter::Any).unwrap();

        let b_limits = h.engine.remaining_limits("device-bbb");
        assert_eq!(b_limits.female, 5);
        assert_eq!(b_limits.male, 4);
        // The joiner used `any` and spends nothing.
        assert_eq!(
            h.engine.remaining_limits("device-aaa"),
            RemainingLimits {
                male: 5,
                female: 5,
                non_binary: 5,
                prefer_not_to_say: 5
            }
        );
    }

    #[test]
    fn unverified_candidate_is_not_charged() {
        let h = harness();
        let a = h.connect("device-aaa");
        let b = h.connect("device-bbb");

        h.join(&b, Filter::Any).unwrap();
        h.join(&a, Filter::Any).unwrap();

        let b_limits = h.engine.remaining_limits("device-bbb");
        assert_eq!(b_limits.male + b_limits.female + b_limits.non_binary, 15);
        assert_eq!(b_limits.prefer_not_to_say, 5);
    }

    #[test]
    fn candidate_with_spent_category_still_matches_within_quota() {
        let h = harness();
        h.engine.set_category("device-bbb", Category::Male);
        let b = h.connect("device-bbb");

        for n in 0..6u32 {
            let joiner = h.connect(&format!("joiner-{n:04}"));
            h.join(&b, Filter::Any).unwrap();
            assert!(matches!(
                h.join(&joiner, Filter::Any).unwrap(),
                JoinOutcome::Matched { .. }
            ));
            h.engine.leave("device-bbb");
            h.clock.advance(Duration::seconds(6));
        }

        assert_eq!(h.engine.remaining_limits("device-bbb").male, 0);
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn quota_resets_on_a_new_day() {
        let mut h = harness();
        let a = h.connect("device-aaa");
        let b = h.connect("device-bbb");
        h.engine.set_category("device-bbb", Category::Male);
        h.join(&b, Filter::Any).unwrap();
        h.join(&a, Filter::Only(Category::Male)).unwrap();
        assert_eq!(h.engine.remaining_limits("device-aaa").male, 4);
        h.drain_persisted();

        h.clock
            .set(Utc.with_ymd_and_hms(2026, 5, 5, 0, 0, 1).unwrap());
        assert_eq!(h.engine.remaining_limits("device-aaa").male, 5);

        let rolled = h.drain_persisted();
        assert_eq!(
            rolled,
            vec![PersistCommand::UpsertDailyLimit {
                device_id: "device-aaa".to_string(),
                date: chrono::NaiveDate::from_ymd_opt(2026, 5, 5).unwrap(),
                counts: Default::default(),
            }]
        );
    }

    #[test]
    fn leave_notifies_peer_and_is_idempotent() {
        let h = harness();
        let a = h.connect("device-aaa");
        let mut b = h.connect("device-bbb");
        h.join(&b, Filter::Any).unwrap();
        h.join(&a, Filter::Any).unwrap();
        b.events();

        assert!(h.engine.next("device-aaa"));
        let events = b.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "peer_left");
        assert_eq!(events[0]["peer"], "device-aaa");

        assert!(!h.engine.leave("device-aaa"));
        assert!(!h.engine.leave("device-bbb"));
        assert_eq!(h.engine.peer_of("device-bbb"), None);
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn relay_reaches_only_the_peer() {
        let h = harness();
        let a = h.connect("device-aaa");
        let mut b = h.connect("device-bbb");
        let mut c = h.connect("device-ccc");

        assert_eq!(h.engine.relay_text("device-aaa", "hello"), Ok(false));

        h.join(&a, Filter::Any).unwrap();
        h.join(&b, Filter::Any).unwrap();
        b.events();

        assert_eq!(h.engine.relay_text("device-aaa", "  hi there  "), Ok(true));
        assert!(h.engine.relay_typing("device-aaa"));
        let events = b.events();
        assert_eq!(events[0]["type"], "msg");
        assert_eq!(events[0]["from"], "device-aaa");
        assert_eq!(events[0]["text"], "hi there");
        assert_eq!(events[1]["type"], "typing");
        assert!(c.events().is_empty());

        assert!(h.engine.relay_text("device-aaa", "   ").is_err());
        assert!(h.engine.relay_text("device-aaa", &"x".repeat(501)).is_err());
        assert_eq!(h.engine.relay_text("device-aaa", &"é".repeat(500)), Ok(true));
    }

    #[test]
    fn third_report_bans_and_ejects_target() {
        let mut h = harness();
        let mut target = h.connect("device-bad");
        let mut peer = h.connect("device-peer");
        h.join(&target, Filter::Any).unwrap();
        h.join(&peer, Filter::Any).unwrap();
        target.events();

        for n in 1..=2 {
            let outcome = h
                .engine
                .report(&format!("reporter-{n}"), "device-bad", "spam")
                .unwrap();
            assert_eq!(outcome.report_count, n);
            assert!(!outcome.banned);
        }
        assert!(!h.engine.is_banned("device-bad"));

        let outcome = h.engine.report("reporter-3", "device-bad", "spam").unwrap();
        assert!(outcome.banned);
        assert!(h.engine.is_banned("device-bad"));

        let events = peer.events();
        assert_eq!(events.last().unwrap()["type"], "peer_left");
        let events = target.events();
        assert!(events
            .iter()
            .any(|e| e["type"] == "error" && e["message"].as_str().unwrap().contains("24 hours")));

        let mut target_again = h.connect_replacing("device-bad", &mut target);
        assert!(matches!(
            h.join(&target_again, Filter::Any),
            Err(MatchError::Banned { .. })
        ));
        assert!(target_again.events().is_empty());
        h.engine.check_invariants().unwrap();

        let reports = h
            .drain_persisted()
            .into_iter()
            .filter(|c| matches!(c, PersistCommand::AppendReport { .. }))
            .count();
        assert_eq!(reports, 3);
    }

    impl Harness {
        /// Simulate a reconnect after the old socket's writer went away.
        fn connect_replacing(&self, id: &str, old: &mut Client) -> Client {
            old.rx.close();
            self.connect(id)
        }
    }

    #[test]
    fn banned_target_receives_close_frame() {
        let h = harness();
        let mut target = h.connect("device-bad");
        h.engine.ban("device-bad", "abuse", BanKind::Temporary);
        assert_eq!(target.close_code(), Some(CLOSE_BANNED));
    }

    #[test]
    fn temporary_ban_expires_lazily_and_resets_reports() {
        let h = harness();
        for n in 1..=3 {
            h.engine
                .report(&format!("reporter-{n}"), "device-bad", "spam")
                .unwrap();
        }
        assert_eq!(h.engine.report_count("device-bad"), 3);

        h.clock.advance(Duration::seconds(86399));
        assert!(h.engine.is_banned("device-bad"));

        h.clock.advance(Duration::seconds(2));
        assert!(!h.engine.is_banned("device-bad"));
        assert_eq!(h.engine.report_count("device-bad"), 0);

        let outcome = h.engine.report("reporter-1", "device-bad", "again").unwrap();
        assert_eq!(outcome.report_count, 1);
        assert!(!outcome.banned);
    }

    #[test]
    fn reports_during_active_ban_do_not_reissue() {
        let h = harness();
        for n in 1..=3 {
            h.engine
                .report(&format!("reporter-{n}"), "device-bad", "spam")
                .unwrap();
        }
        let outcome = h.engine.report("reporter-4", "device-bad", "spam").unwrap();
        assert_eq!(outcome.report_count, 4);
        assert!(!outcome.banned);
    }

    #[test]
    fn self_reports_are_rejected() {
        let h = harness();
        assert!(matches!(
            h.engine.report("device-aaa", "device-aaa", "x"),
            Err(MatchError::Validation(_))
        ));
        assert!(matches!(
            h.engine.report("device-aaa", "short", "x"),
            Err(MatchError::Validation(_))
        ));
        assert_eq!(h.engine.report_count("device-aaa"), 0);
    }

    #[test]
    fn permanent_ban_outlives_ttl_until_unban() {
        let h = harness();
        h.engine.ban("device-bad", "admin", BanKind::Permanent);
        h.clock.advance(Duration::days(30));
        assert!(h.engine.is_banned("device-bad"));

        assert!(h.engine.unban("device-bad"));
        assert!(!h.engine.is_banned("device-bad"));
        assert!(!h.engine.unban("device-bad"));
    }

    #[test]
    fn temporary_ban_does_not_replace_permanent_ban() {
        let h = harness();
        let permanent = h.engine.ban("device-bad", "admin", BanKind::Permanent);
        h.clock.advance(Duration::minutes(1));

        let stored = h.engine.ban("device-bad", "later", BanKind::Temporary);
        assert_eq!(stored, permanent);
        assert_eq!(stored.kind, BanKind::Permanent);

        h.clock.advance(Duration::days(2));
        assert_eq!(h.engine.ban_status("device-bad"), Some(permanent));
    }

    #[test]
    fn banning_a_queued_device_removes_it_from_the_queue() {
        let h = harness();
        let mut waiting = h.connect("device-yyy");
        assert!(matches!(
            h.join(&waiting, Filter::Any).unwrap(),
            JoinOutcome::Queued { .. }
        ));
        assert_eq!(h.engine.stats().queued, 1);

        for n in 1..=3 {
            h.engine
                .report(&format!("reporter-{n}"), "device-yyy", "spam")
                .unwrap();
        }

        assert!(h.engine.is_banned("device-yyy"));
        assert_eq!(h.engine.stats().queued, 0);
        assert_eq!(h.engine.queued_filter("device-yyy"), None);
        assert_eq!(h.engine.peer_of("device-yyy"), None);
        assert_eq!(waiting.close_code(), Some(CLOSE_BANNED));
        h.engine.check_invariants().unwrap();

        let next = h.connect("device-zzz");
        assert!(matches!(
            h.join(&next, Filter::Any).unwrap(),
            JoinOutcome::Queued { .. }
        ));
    }

    #[test]
    fn close_all_connections_reaches_every_live_socket() {
        let h = harness();
        let mut a = h.connect("device-aaa");
        let mut b = h.connect("device-bbb");
        h.join(&a, Filter::Any).unwrap();

        assert_eq!(h.engine.close_all_connections(1001, "Server shutting down"), 2);
        assert_eq!(a.close_code(), Some(1001));
        assert_eq!(b.close_code(), Some(1001));
    }

    #[test]
    fn concurrent_operations_keep_state_consistent() {
        const DEVICES: usize = 16;
        const THREADS: u64 = 8;
        const STEPS: usize = 400;

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap(),
        ));
        let config = MatchingConfig {
            join_cooldown_secs: 0,
            report_threshold: 6,
            ..MatchingConfig::default()
        };
        let engine = Arc::new(MatchEngine::new(
            config,
            clock.clone(),
            PersistSink::disabled(),
            crate::ws::new_connection_registry(),
        ));

        let ids: Vec<String> = (0..DEVICES).map(|n| format!("device-{n:03}")).collect();
        let mut receivers = Vec::new();
        let mut senders = Vec::new();
        for (n, id) in ids.iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            assert!(engine.register_connection(id, tx.clone()));
            if n % 2 == 0 {
                engine.set_category(id, Category::ALL[n / 2 % Category::ALL.len()]);
            }
            senders.push(tx);
            receivers.push(rx);
        }
        let filters = [
            Filter::Any,
            Filter::Only(Category::Male),
            Filter::Only(Category::Female),
        ];

        std::thread::scope(|scope| {
            for seed in 0..THREADS {
                let engine = engine.clone();
                let clock = clock.clone();
                let (ids, senders, filters) = (&ids, &senders, &filters);
                scope.spawn(move || {
                    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                    for _ in 0..STEPS {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        let pick = (state % DEVICES as u64) as usize;
                        let id = &ids[pick];
                        match (state >> 32) % 8 {
                            0..=2 => {
                                let filter = filters[(state >> 40) as usize % filters.len()];
                                let _ = engine.join(id, filter, None, &senders[pick]);
                            }
                            3 => {
                                engine.leave(id);
                            }
                            4 => {
                                engine.next(id);
                            }
                            5 => {
                                let _ = engine.relay_text(id, "hello");
                            }
                            6 => {
                                let reporter = &ids[(pick + 1) % DEVICES];
                                let _ = engine.report(reporter, id, "spam");
                            }
                            _ => clock.advance(Duration::hours(3)),
                        }
                        engine.check_invariants().unwrap();
                    }
                });
            }
        });

        engine.check_invariants().unwrap();
        let stats = engine.stats();
        assert!(stats.queued <= DEVICES);
        assert_eq!(stats.paired % 2, 0);
        drop(receivers);
    }

    #[test]
    fn nickname_is_validated_and_shown_to_peer() {
        let h = harness();
        let a = h.connect("device-aaa");
        let b = h.connect("device-bbb");

        assert!(matches!(
            h.engine
                .join("device-aaa", Filter::Any, Some("n".repeat(33)), &a.tx),
            Err(MatchError::Validation(_))
        ));
        h.engine
            .join("device-aaa", Filter::Any, Some("  otter ".to_string()), &a.tx)
            .unwrap();
        match h.engine.join("device-bbb", Filter::Any, None, &b.tx).unwrap() {
            JoinOutcome::Matched { peer_profile, .. } => assert_eq!(peer_profile.nickname, "otter"),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn second_live_connection_is_refused() {
        let h = harness();
        let first = h.connect("device-aaa");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!h.engine.register_connection("device-aaa", tx.clone()));

        // Unregistering a stale sender leaves the live one in place.
        h.engine.unregister_connection("device-aaa", &tx);
        assert!(h.engine.connections().contains_key("device-aaa"));
        h.engine.unregister_connection("device-aaa", &first.tx);
        assert!(!h.engine.connections().contains_key("device-aaa"));
    }

    #[test]
    fn device_id_validation() {
        assert!(validate_device_id("device-0001").is_ok());
        assert!(validate_device_id("short").is_err());
        assert!(validate_device_id(&"x".repeat(129)).is_err());
        assert!(validate_device_id("device\n0001").is_err());
    }
}
