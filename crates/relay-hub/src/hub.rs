use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_core::events::Event;
use relay_core::ids::{AnalysisId, SessionId, TeamId, UserId};
use relay_core::model::{
    MetricsReport, ProcessState, ProcessStateUpdate, Role, UNCATEGORIZED_TEAM,
};
use relay_core::providers::{
    AnalysisDirectory, AuthorizationProvider, MetricsSource, TeamDirectory, UserStore,
};
use relay_telemetry::HubCounters;

use crate::channel::{Channel, ChannelName, CleanupPolicy};
use crate::error::HubError;
use crate::gate::PermissionGate;
use crate::session::{PushOutcome, SessionEntry, SessionHandle};

/// Engine configuration. Intervals gate the background timers; the stale
/// threshold must exceed the heartbeat interval.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub heartbeat_interval: Duration,
    pub metrics_interval: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub send_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(90),
            send_queue: 256,
        }
    }
}

/// Result of a batch subscribe. Partial success is the expected outcome;
/// `denied` is always present, empty when nothing was refused.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub subscribed: Vec<AnalysisId>,
    pub denied: Vec<AnalysisId>,
}

/// Result of a batch unsubscribe. Contains only topics actually removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    pub unsubscribed: Vec<AnalysisId>,
}

pub(crate) struct HubState {
    pub sessions: HashMap<SessionId, SessionEntry>,
    pub channels: HashMap<ChannelName, Channel>,
}

impl HubState {
    fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            ChannelName::Global,
            Channel::new(ChannelName::Global, CleanupPolicy::Permanent),
        );
        Self {
            sessions: HashMap::new(),
            channels,
        }
    }
}

struct TimerSet {
    cancel: CancellationToken,
    _tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// The event-distribution engine: session registry, channel pool,
/// permission gate, and the connection-count-gated background timers.
/// Constructed once at process start and injected into HTTP handlers.
pub struct EventHub {
    pub(crate) state: RwLock<HubState>,
    pub(crate) gate: PermissionGate,
    pub(crate) users: Arc<dyn UserStore>,
    pub(crate) teams: Arc<dyn TeamDirectory>,
    pub(crate) analyses: Arc<dyn AnalysisDirectory>,
    metrics_source: Arc<dyn MetricsSource>,
    process_state: RwLock<ProcessState>,
    timers: Mutex<Option<TimerSet>>,
    config: HubConfig,
    counters: HubCounters,
}

impl EventHub {
    pub fn new(
        config: HubConfig,
        auth: Arc<dyn AuthorizationProvider>,
        analyses: Arc<dyn AnalysisDirectory>,
        teams: Arc<dyn TeamDirectory>,
        users: Arc<dyn UserStore>,
        metrics_source: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            state: RwLock::new(HubState::new()),
            gate: PermissionGate::new(auth, Arc::clone(&analyses)),
            users,
            teams,
            analyses,
            metrics_source,
            process_state: RwLock::new(ProcessState::new(Utc::now())),
            timers: Mutex::new(None),
            config,
            counters: HubCounters::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn counters(&self) -> &HubCounters {
        &self.counters
    }

    // ── Session registry ──

    /// Create a session for a connection and register it to the global
    /// channel. The role snapshot starts at the handshake value and is
    /// refreshed by the initial-data sync. Returns the frame receiver the
    /// connection writer drains.
    pub fn add_session(
        self: &Arc<Self>,
        user_id: UserId,
        role: Role,
    ) -> (SessionId, mpsc::Receiver<String>) {
        let session_id = SessionId::new();
        let (tx, rx) = mpsc::channel(self.config.send_queue);
        let handle = SessionHandle::new(tx);
        {
            let mut guard = self.state.write();
            guard.sessions.insert(
                session_id.clone(),
                SessionEntry::new(user_id.clone(), role, handle),
            );
            guard
                .channels
                .entry(ChannelName::Global)
                .or_insert_with(|| Channel::new(ChannelName::Global, CleanupPolicy::Permanent))
                .register(&session_id);
        }
        self.counters.gauge_add("sessions_connected", 1);
        tracing::info!(session_id = %session_id, user_id = %user_id, "session connected");
        self.start_if_needed();
        (session_id, rx)
    }

    /// Deregister a session from the global channel and every subscribed
    /// channel, deleting emptied topic channels, then drop the entry.
    /// Unknown ids are a no-op.
    pub fn remove_session(&self, session_id: &SessionId) {
        {
            let mut guard = self.state.write();
            let Some(entry) = guard.sessions.remove(session_id) else {
                return;
            };
            entry.handle.mark_disconnected();

            let mut names: Vec<ChannelName> = entry
                .topics
                .iter()
                .cloned()
                .map(ChannelName::Analysis)
                .collect();
            names.push(ChannelName::Global);
            for name in names {
                if let Some(ch) = guard.channels.get_mut(&name) {
                    ch.deregister(session_id);
                    if ch.is_removable() {
                        guard.channels.remove(&name);
                    }
                }
            }
        }
        self.counters.gauge_add("sessions_connected", -1);
        tracing::info!(session_id = %session_id, "session removed");
        self.stop_if_idle();
    }

    pub fn session_count(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn channel_count(&self) -> usize {
        self.state.read().channels.len()
    }

    pub fn channel_member_count(&self, name: &ChannelName) -> Option<usize> {
        self.state
            .read()
            .channels
            .get(name)
            .map(Channel::member_count)
    }

    pub fn session_topics(&self, session_id: &SessionId) -> Option<HashSet<AnalysisId>> {
        self.state
            .read()
            .sessions
            .get(session_id)
            .map(|entry| entry.topics.clone())
    }

    // ── Channel pool ──

    /// Subscribe a session to a batch of topics. Authorization is evaluated
    /// independently per topic; denials come back as data. Rejects only on
    /// structural errors: an unknown session id or an empty topic name.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
        topics: &[AnalysisId],
    ) -> Result<SubscribeOutcome, HubError> {
        if topics.iter().any(|t| t.as_str().is_empty()) {
            return Err(HubError::InvalidTopic);
        }
        let (user_id, role) = {
            let guard = self.state.read();
            let entry = guard
                .sessions
                .get(session_id)
                .ok_or_else(|| HubError::UnknownSession(session_id.clone()))?;
            (entry.user_id.clone(), entry.role)
        };

        let mut outcome = SubscribeOutcome::default();
        for topic in topics {
            // Suspension point: the session may disconnect while this is
            // in flight, so existence is re-validated below.
            let allowed = match self.gate.is_authorized(&user_id, role, topic).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    tracing::warn!(
                        analysis_id = %topic,
                        user_id = %user_id,
                        error = %e,
                        "authorization check failed, denying topic"
                    );
                    false
                }
            };
            if !allowed {
                outcome.denied.push(topic.clone());
                continue;
            }
            {
                let mut guard = self.state.write();
                let state = &mut *guard;
                let Some(entry) = state.sessions.get_mut(session_id) else {
                    // Disconnected mid-call; the cascade already cleaned up
                    // whatever this loop had added.
                    return Err(HubError::UnknownSession(session_id.clone()));
                };
                entry.topics.insert(topic.clone());
                state
                    .channels
                    .entry(ChannelName::Analysis(topic.clone()))
                    .or_insert_with(|| {
                        Channel::new(ChannelName::Analysis(topic.clone()), CleanupPolicy::OnEmpty)
                    })
                    .register(session_id);
            }
            outcome.subscribed.push(topic.clone());
        }
        self.counters.add("topics_subscribed", outcome.subscribed.len() as u64);
        Ok(outcome)
    }

    /// Remove a session's membership in a batch of topics, deleting any
    /// channel whose member count reaches zero. Unknown sessions succeed
    /// with an empty result.
    pub fn unsubscribe(&self, session_id: &SessionId, topics: &[AnalysisId]) -> UnsubscribeOutcome {
        let mut outcome = UnsubscribeOutcome::default();
        let mut guard = self.state.write();
        let HubState { sessions, channels } = &mut *guard;
        let Some(entry) = sessions.get_mut(session_id) else {
            return outcome;
        };
        for topic in topics {
            if !entry.topics.remove(topic) {
                continue;
            }
            let name = ChannelName::Analysis(topic.clone());
            if let Some(ch) = channels.get_mut(&name) {
                ch.deregister(session_id);
                if ch.is_removable() {
                    channels.remove(&name);
                }
            }
            outcome.unsubscribed.push(topic.clone());
        }
        outcome
    }

    // ── Fan-out ──

    /// Push an event to every member of a channel. A missing channel is a
    /// silent no-op. Per-recipient failures are isolated: a closed queue
    /// removes that session only, a full queue drops the frame.
    pub fn broadcast(&self, channel: &ChannelName, event: &Event) {
        let frame = event.to_frame();
        let targets: Vec<(SessionId, SessionHandle)> = {
            let guard = self.state.read();
            let Some(ch) = guard.channels.get(channel) else {
                return;
            };
            ch.members()
                .filter_map(|id| {
                    guard
                        .sessions
                        .get(id)
                        .map(|entry| (id.clone(), entry.handle.clone()))
                })
                .collect()
        };
        self.counters.increment("broadcasts");
        let mut dead = Vec::new();
        for (session_id, handle) in targets {
            match handle.push(&frame) {
                PushOutcome::Sent => self.counters.increment("events_pushed"),
                PushOutcome::Dropped => {
                    self.counters.increment("events_dropped");
                    tracing::warn!(
                        session_id = %session_id,
                        event = event.event_type(),
                        "send queue full, dropping event"
                    );
                }
                PushOutcome::Closed => dead.push(session_id),
            }
        }
        for session_id in dead {
            tracing::info!(session_id = %session_id, "push failed, removing session");
            self.remove_session(&session_id);
        }
    }

    /// Push an event to a single session. Returns false if the session is
    /// unknown or its connection is gone (in which case it is removed).
    pub fn push_to_session(&self, session_id: &SessionId, event: &Event) -> bool {
        let Some(handle) = self
            .state
            .read()
            .sessions
            .get(session_id)
            .map(|entry| entry.handle.clone())
        else {
            return false;
        };
        match handle.push(&event.to_frame()) {
            PushOutcome::Sent => {
                self.counters.increment("events_pushed");
                true
            }
            PushOutcome::Dropped => {
                self.counters.increment("events_dropped");
                tracing::warn!(
                    session_id = %session_id,
                    event = event.event_type(),
                    "send queue full, dropping event"
                );
                false
            }
            PushOutcome::Closed => {
                self.remove_session(session_id);
                false
            }
        }
    }

    // ── Process state ──

    pub fn state_snapshot(&self) -> ProcessState {
        self.process_state.read().clone()
    }

    /// Merge a partial update into the singleton process state.
    pub fn set_state(&self, update: ProcessStateUpdate) -> ProcessState {
        let mut guard = self.process_state.write();
        guard.apply(update);
        guard.clone()
    }

    /// Merge and push the resulting state to every connected session
    /// individually.
    pub fn update_state(&self, update: ProcessStateUpdate) {
        let state = self.set_state(update);
        let event = Event::StatusUpdate { state };
        let targets: Vec<SessionId> = self.state.read().sessions.keys().cloned().collect();
        for session_id in targets {
            self.push_to_session(&session_id, &event);
        }
    }

    // ── Timers ──

    /// Start the heartbeat, stale-sweep, and metrics timers if they are not
    /// already running and at least one session exists. Re-entrant no-op.
    pub fn start_if_needed(self: &Arc<Self>) {
        let mut timers = self.timers.lock();
        if timers.is_some() || self.session_count() == 0 {
            return;
        }
        let cancel = CancellationToken::new();
        let tasks = vec![
            self.spawn_heartbeat(cancel.clone()),
            self.spawn_sweep(cancel.clone()),
            self.spawn_metrics(cancel.clone()),
        ];
        *timers = Some(TimerSet {
            cancel,
            _tasks: tasks,
        });
        tracing::debug!("hub timers started");
    }

    /// Stop the timers once the last session is gone. Re-entrant no-op.
    pub fn stop_if_idle(&self) {
        let mut timers = self.timers.lock();
        if self.session_count() > 0 {
            return;
        }
        if let Some(set) = timers.take() {
            set.cancel.cancel();
            tracing::debug!(counters = %self.counters.snapshot(), "hub timers stopped");
        }
    }

    pub fn timers_running(&self) -> bool {
        self.timers.lock().is_some()
    }

    fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume first immediate tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => hub.heartbeat_tick(),
                }
            }
        })
    }

    fn spawn_sweep(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => hub.sweep_tick(),
                }
            }
        })
    }

    fn spawn_metrics(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let interval = self.config.metrics_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => hub.metrics_tick().await,
                }
            }
        })
    }

    /// One heartbeat cycle: push to every global member; a successful push
    /// refreshes that session's liveness, a closed queue removes it.
    pub(crate) fn heartbeat_tick(&self) {
        let frame = Event::Heartbeat.to_frame();
        let targets: Vec<(SessionId, SessionHandle)> = {
            let guard = self.state.read();
            let Some(global) = guard.channels.get(&ChannelName::Global) else {
                return;
            };
            global
                .members()
                .filter_map(|id| {
                    guard
                        .sessions
                        .get(id)
                        .map(|entry| (id.clone(), entry.handle.clone()))
                })
                .collect()
        };
        let mut dead = Vec::new();
        for (session_id, handle) in targets {
            match handle.push(&frame) {
                PushOutcome::Sent => handle.record_heartbeat(),
                PushOutcome::Dropped => {
                    // No liveness refresh; the sweep reaps it if this keeps up.
                    self.counters.increment("events_dropped");
                }
                PushOutcome::Closed => dead.push(session_id),
            }
        }
        for session_id in dead {
            tracing::info!(session_id = %session_id, "heartbeat push failed, removing session");
            self.remove_session(&session_id);
        }
    }

    /// One sweep cycle: remove every session whose last heartbeat is older
    /// than the stale threshold, even if its queue still accepts frames.
    pub(crate) fn sweep_tick(&self) {
        let threshold = self.config.stale_after.as_secs();
        let stale: Vec<SessionId> = {
            let guard = self.state.read();
            guard
                .sessions
                .iter()
                .filter(|(_, entry)| entry.handle.heartbeat_age_secs() > threshold)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for session_id in stale {
            tracing::info!(session_id = %session_id, "removing stale session");
            self.counters.increment("sessions_reaped");
            self.remove_session(&session_id);
        }
    }

    /// One metrics cycle: fetch the snapshot and push a per-session view.
    /// A failed fetch skips the cycle; it never stops the timer or removes
    /// a session.
    pub(crate) async fn metrics_tick(&self) {
        let report = match self.metrics_source.all_metrics().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "metrics fetch failed, skipping cycle");
                return;
            }
        };

        let targets: Vec<(SessionId, UserId, Role, SessionHandle)> = {
            let guard = self.state.read();
            guard
                .sessions
                .iter()
                .map(|(id, entry)| {
                    (
                        id.clone(),
                        entry.user_id.clone(),
                        entry.role,
                        entry.handle.clone(),
                    )
                })
                .collect()
        };

        let mut team_cache: HashMap<UserId, HashSet<TeamId>> = HashMap::new();
        let mut dead = Vec::new();
        for (session_id, user_id, role, handle) in targets {
            let view = if role.is_admin() {
                report.clone()
            } else {
                let teams = if let Some(cached) = team_cache.get(&user_id) {
                    cached.clone()
                } else {
                    match self.gate.accessible_team_ids(&user_id).await {
                        Ok(teams) => {
                            team_cache.insert(user_id.clone(), teams.clone());
                            teams
                        }
                        Err(e) => {
                            tracing::warn!(
                                user_id = %user_id,
                                error = %e,
                                "team resolution failed, skipping session this cycle"
                            );
                            continue;
                        }
                    }
                };
                filter_report(&report, &teams)
            };
            let event = Event::MetricsUpdate { metrics: view };
            match handle.push(&event.to_frame()) {
                PushOutcome::Sent => self.counters.increment("events_pushed"),
                PushOutcome::Dropped => self.counters.increment("events_dropped"),
                PushOutcome::Closed => dead.push(session_id),
            }
        }
        for session_id in dead {
            self.remove_session(&session_id);
        }
    }
}

/// Retain only processes belonging to teams the recipient can access.
/// The aggregate section is visible to everyone.
fn filter_report(report: &MetricsReport, teams: &HashSet<TeamId>) -> MetricsReport {
    MetricsReport {
        aggregate: report.aggregate.clone(),
        processes: report
            .processes
            .iter()
            .filter(|p| p.team_id.as_str() == UNCATEGORIZED_TEAM || teams.contains(&p.team_id))
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use relay_core::memory::MemoryProviders;
    use relay_core::model::{AggregateMetrics, AnalysisRecord, ProcessMetrics, ProcessStatus};
    use relay_core::providers::{Permission, ProviderError};
    use serde_json::Value;

    fn test_config() -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(90),
            send_queue: 32,
        }
    }

    fn test_hub() -> (Arc<EventHub>, MemoryProviders) {
        test_hub_with(test_config())
    }

    fn test_hub_with(config: HubConfig) -> (Arc<EventHub>, MemoryProviders) {
        let providers = MemoryProviders::new();
        let hub = Arc::new(EventHub::new(
            config,
            providers.auth.clone(),
            providers.analyses.clone(),
            providers.teams.clone(),
            providers.users.clone(),
            providers.metrics.clone(),
        ));
        (hub, providers)
    }

    fn analysis(id: &str, team: &str) -> AnalysisRecord {
        AnalysisRecord {
            id: AnalysisId::from_raw(id),
            name: id.to_uppercase(),
            team_id: TeamId::from_raw(team),
        }
    }

    fn topic(id: &str) -> AnalysisId {
        AnalysisId::from_raw(id)
    }

    fn chan(id: &str) -> ChannelName {
        ChannelName::Analysis(topic(id))
    }

    fn drain_types(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let value: Value = serde_json::from_str(&frame).unwrap();
            types.push(value["type"].as_str().unwrap_or_default().to_string());
        }
        types
    }

    #[tokio::test]
    async fn subscribe_maintains_bijection() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", UNCATEGORIZED_TEAM));

        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let outcome = hub.subscribe(&sid, &[topic("a1")]).await.unwrap();
        assert_eq!(outcome.subscribed, vec![topic("a1")]);
        assert!(outcome.denied.is_empty());

        assert!(hub.session_topics(&sid).unwrap().contains(&topic("a1")));
        assert_eq!(hub.channel_member_count(&chan("a1")), Some(1));
    }

    #[tokio::test]
    async fn subscribe_unknown_session_rejects() {
        let (hub, _providers) = test_hub();
        let err = hub
            .subscribe(&SessionId::from_raw("ghost"), &[topic("a1")])
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn subscribe_empty_topic_rejects() {
        let (hub, _providers) = test_hub();
        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let err = hub.subscribe(&sid, &[topic("")]).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidTopic));
    }

    #[tokio::test]
    async fn double_subscribe_adds_exactly_one_member() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", UNCATEGORIZED_TEAM));

        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        hub.subscribe(&sid, &[topic("a1")]).await.unwrap();
        hub.subscribe(&sid, &[topic("a1")]).await.unwrap();
        assert_eq!(hub.channel_member_count(&chan("a1")), Some(1));
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_roundtrip_restores_state() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", UNCATEGORIZED_TEAM));

        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let channels_before = hub.channel_count();

        hub.subscribe(&sid, &[topic("a1")]).await.unwrap();
        let outcome = hub.unsubscribe(&sid, &[topic("a1")]);
        assert_eq!(outcome.unsubscribed, vec![topic("a1")]);

        assert!(hub.session_topics(&sid).unwrap().is_empty());
        assert_eq!(hub.channel_member_count(&chan("a1")), None);
        assert_eq!(hub.channel_count(), channels_before);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_session_is_empty_success() {
        let (hub, _providers) = test_hub();
        let outcome = hub.unsubscribe(&SessionId::from_raw("ghost"), &[topic("a1")]);
        assert!(outcome.unsubscribed.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_skips_never_subscribed_topics() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", UNCATEGORIZED_TEAM));

        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        hub.subscribe(&sid, &[topic("a1")]).await.unwrap();

        let outcome = hub.unsubscribe(&sid, &[topic("a1"), topic("other")]);
        assert_eq!(outcome.unsubscribed, vec![topic("a1")]);
    }

    #[tokio::test]
    async fn partial_authorization_denies_per_topic() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("analysisA", "t1"));
        providers.analyses.insert(analysis("analysisB", "t2"));
        let user = UserId::from_raw("u1");
        providers.auth.grant(&user, TeamId::from_raw("t1"));

        let (sid, _rx) = hub.add_session(user, Role::User);
        let outcome = hub
            .subscribe(&sid, &[topic("analysisA"), topic("analysisB")])
            .await
            .unwrap();
        assert_eq!(outcome.subscribed, vec![topic("analysisA")]);
        assert_eq!(outcome.denied, vec![topic("analysisB")]);

        assert_eq!(hub.channel_member_count(&chan("analysisA")), Some(1));
        assert_eq!(hub.channel_member_count(&chan("analysisB")), None);
    }

    #[tokio::test]
    async fn admin_subscribes_without_grants() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", "t-private"));

        let (sid, _rx) = hub.add_session(UserId::from_raw("root"), Role::Admin);
        let outcome = hub.subscribe(&sid, &[topic("a1")]).await.unwrap();
        assert_eq!(outcome.subscribed, vec![topic("a1")]);
    }

    #[tokio::test]
    async fn remove_session_cascades_everywhere() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", UNCATEGORIZED_TEAM));
        providers.analyses.insert(analysis("a2", UNCATEGORIZED_TEAM));

        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        hub.subscribe(&sid, &[topic("a1"), topic("a2")]).await.unwrap();

        hub.remove_session(&sid);
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.channel_member_count(&chan("a1")), None);
        assert_eq!(hub.channel_member_count(&chan("a2")), None);
        assert_eq!(hub.channel_member_count(&ChannelName::Global), Some(0));
    }

    #[tokio::test]
    async fn remove_unknown_session_is_noop() {
        let (hub, _providers) = test_hub();
        hub.remove_session(&SessionId::from_raw("ghost"));
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn global_channel_survives_everything() {
        let (hub, _providers) = test_hub();
        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        hub.remove_session(&sid);
        assert_eq!(hub.channel_member_count(&ChannelName::Global), Some(0));
    }

    #[tokio::test]
    async fn staggered_disconnects_delete_channel_with_last_member() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", UNCATEGORIZED_TEAM));

        let (sid1, _rx1) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let (sid2, _rx2) = hub.add_session(UserId::from_raw("u2"), Role::User);
        hub.subscribe(&sid1, &[topic("a1")]).await.unwrap();
        hub.subscribe(&sid2, &[topic("a1")]).await.unwrap();
        assert_eq!(hub.channel_member_count(&chan("a1")), Some(2));

        hub.remove_session(&sid1);
        assert_eq!(hub.channel_member_count(&chan("a1")), Some(1));

        hub.remove_session(&sid2);
        assert_eq!(hub.channel_member_count(&chan("a1")), None);
    }

    #[tokio::test]
    async fn broadcast_to_absent_topic_is_noop() {
        let (hub, _providers) = test_hub();
        let (_sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        hub.broadcast(
            &chan("nobody-listening"),
            &Event::Log {
                analysis_id: topic("nobody-listening"),
                line: "hello".into(),
            },
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_members_only() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(analysis("a1", UNCATEGORIZED_TEAM));

        let (sid1, mut rx1) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let (_sid2, mut rx2) = hub.add_session(UserId::from_raw("u2"), Role::User);
        hub.subscribe(&sid1, &[topic("a1")]).await.unwrap();

        hub.broadcast(
            &chan("a1"),
            &Event::Log {
                analysis_id: topic("a1"),
                line: "line 1".into(),
            },
        );

        assert!(drain_types(&mut rx1).contains(&"log".to_string()));
        assert!(!drain_types(&mut rx2).contains(&"log".to_string()));
    }

    #[tokio::test]
    async fn broadcast_removes_closed_sessions_and_spares_others() {
        let (hub, _providers) = test_hub();
        let (sid1, rx1) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let (sid2, mut rx2) = hub.add_session(UserId::from_raw("u2"), Role::User);
        drop(rx1);

        hub.broadcast(&ChannelName::Global, &Event::Heartbeat);

        assert_eq!(hub.session_count(), 1);
        assert!(hub.session_topics(&sid1).is_none());
        assert!(hub.session_topics(&sid2).is_some());
        assert!(drain_types(&mut rx2).contains(&"heartbeat".to_string()));
    }

    #[tokio::test]
    async fn heartbeat_tick_refreshes_liveness_and_reaps_dead() {
        let (hub, _providers) = test_hub();
        let (sid1, mut rx1) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let (sid2, rx2) = hub.add_session(UserId::from_raw("u2"), Role::User);
        drop(rx2);

        let handle = {
            let guard = hub.state.read();
            guard.sessions.get(&sid1).unwrap().handle.clone()
        };
        handle.set_last_heartbeat(0);

        hub.heartbeat_tick();

        assert!(hub.session_topics(&sid2).is_none(), "dead session reaped");
        assert!(handle.heartbeat_age_secs() < 5, "liveness refreshed");
        assert!(drain_types(&mut rx1).contains(&"heartbeat".to_string()));
    }

    #[tokio::test]
    async fn sweep_removes_stale_sessions() {
        let (hub, _providers) = test_hub();
        let (sid1, _rx1) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let (sid2, _rx2) = hub.add_session(UserId::from_raw("u2"), Role::User);

        {
            let guard = hub.state.read();
            guard.sessions.get(&sid1).unwrap().handle.set_last_heartbeat(0);
        }

        hub.sweep_tick();
        assert!(hub.session_topics(&sid1).is_none());
        assert!(hub.session_topics(&sid2).is_some());
        assert_eq!(hub.counters().counter("sessions_reaped"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_start_once_and_stop_once() {
        let (hub, _providers) = test_hub();
        assert!(!hub.timers_running());

        let (sid1, mut rx1) = hub.add_session(UserId::from_raw("u1"), Role::User);
        assert!(hub.timers_running());
        let (sid2, mut rx2) = hub.add_session(UserId::from_raw("u2"), Role::User);
        assert!(hub.timers_running());

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let beats1 = drain_types(&mut rx1)
            .iter()
            .filter(|t| *t == "heartbeat")
            .count();
        let beats2 = drain_types(&mut rx2)
            .iter()
            .filter(|t| *t == "heartbeat")
            .count();
        assert_eq!(beats1, 1, "one timer, one beat per interval");
        assert_eq!(beats2, 1);

        hub.remove_session(&sid1);
        assert!(hub.timers_running(), "still one session left");

        hub.remove_session(&sid2);
        assert!(!hub.timers_running(), "stopped at zero sessions");

        // Restart on the next 0→1 transition.
        let (_sid3, _rx3) = hub.add_session(UserId::from_raw("u3"), Role::User);
        assert!(hub.timers_running());
    }

    #[tokio::test]
    async fn metrics_tick_filters_per_role() {
        let (hub, providers) = test_hub();
        let admin = UserId::from_raw("root");
        let user = UserId::from_raw("u1");
        providers.auth.grant(&user, TeamId::from_raw("t1"));
        providers.metrics.set_report(MetricsReport {
            aggregate: AggregateMetrics::default(),
            processes: vec![
                ProcessMetrics {
                    analysis_id: topic("a1"),
                    team_id: TeamId::from_raw("t1"),
                    pid: 1,
                    cpu_percent: 1.0,
                    memory_bytes: 10,
                    status: "running".into(),
                },
                ProcessMetrics {
                    analysis_id: topic("a2"),
                    team_id: TeamId::from_raw("t2"),
                    pid: 2,
                    cpu_percent: 2.0,
                    memory_bytes: 20,
                    status: "running".into(),
                },
            ],
        });

        let (_sid1, mut rx1) = hub.add_session(admin, Role::Admin);
        let (_sid2, mut rx2) = hub.add_session(user, Role::User);

        hub.metrics_tick().await;

        let admin_frame: Value = serde_json::from_str(&rx1.try_recv().unwrap()).unwrap();
        assert_eq!(admin_frame["type"], "metricsUpdate");
        assert_eq!(admin_frame["processes"].as_array().unwrap().len(), 2);

        let user_frame: Value = serde_json::from_str(&rx2.try_recv().unwrap()).unwrap();
        assert_eq!(user_frame["processes"].as_array().unwrap().len(), 1);
        assert_eq!(user_frame["processes"][0]["pid"], 1);
    }

    #[tokio::test]
    async fn metrics_fetch_failure_skips_cycle() {
        let (hub, providers) = test_hub();
        let (sid, mut rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        providers.metrics.set_failing(true);

        hub.metrics_tick().await;

        assert!(rx.try_recv().is_err(), "no frame pushed");
        assert!(hub.session_topics(&sid).is_some(), "session untouched");
        assert!(hub.timers_running());
    }

    #[tokio::test]
    async fn update_state_pushes_merged_state_to_everyone() {
        let (hub, _providers) = test_hub();
        let (_sid1, mut rx1) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let (_sid2, mut rx2) = hub.add_session(UserId::from_raw("u2"), Role::User);

        hub.set_state(ProcessStateUpdate {
            message: Some("warming up".into()),
            ..Default::default()
        });
        hub.update_state(ProcessStateUpdate {
            status: Some(ProcessStatus::Running),
            ..Default::default()
        });

        for rx in [&mut rx1, &mut rx2] {
            let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(frame["type"], "statusUpdate");
            assert_eq!(frame["status"], "running");
            assert_eq!(frame["message"], "warming up");
        }
    }

    #[tokio::test]
    async fn set_state_merges_without_push() {
        let (hub, _providers) = test_hub();
        let (_sid, mut rx) = hub.add_session(UserId::from_raw("u1"), Role::User);

        let state = hub.set_state(ProcessStateUpdate {
            status: Some(ProcessStatus::Error),
            ..Default::default()
        });
        assert_eq!(state.status, ProcessStatus::Error);
        assert!(rx.try_recv().is_err());
    }

    /// Authorization provider that parks until released, letting a test
    /// interleave a disconnect with an in-flight permission check.
    struct BlockingAuth {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl AuthorizationProvider for BlockingAuth {
        async fn user_team_ids(
            &self,
            _user_id: &UserId,
            _permission: Permission,
        ) -> Result<HashSet<TeamId>, ProviderError> {
            self.release.notified().await;
            Ok(HashSet::from([TeamId::from_raw("t1")]))
        }

        async fn users_with_team_access(
            &self,
            _team_id: &TeamId,
            _permission: Permission,
        ) -> Result<HashSet<UserId>, ProviderError> {
            Ok(HashSet::new())
        }
    }

    #[tokio::test]
    async fn disconnect_during_authorization_discards_result() {
        let providers = MemoryProviders::new();
        providers.analyses.insert(analysis("a1", "t1"));
        let blocking = Arc::new(BlockingAuth {
            release: tokio::sync::Notify::new(),
        });
        let hub = Arc::new(EventHub::new(
            test_config(),
            blocking.clone(),
            providers.analyses.clone(),
            providers.teams.clone(),
            providers.users.clone(),
            providers.metrics.clone(),
        ));

        let (sid, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);

        let hub2 = Arc::clone(&hub);
        let sid2 = sid.clone();
        let pending =
            tokio::spawn(async move { hub2.subscribe(&sid2, &[topic("a1")]).await });

        // Let the subscribe task reach the awaited permission check.
        tokio::task::yield_now().await;
        hub.remove_session(&sid);
        blocking.release.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HubError::UnknownSession(_))));
        assert_eq!(hub.channel_member_count(&chan("a1")), None, "nothing re-added");
    }
}
