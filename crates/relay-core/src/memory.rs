//! In-memory collaborator implementations.
//!
//! These back the dev binary (optionally seeded from JSON) and serve as
//! deterministic test doubles for the engine. Production deployments wire
//! real directory/store implementations behind the same traits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::ids::{AnalysisId, TeamId, UserId};
use crate::model::{AnalysisRecord, MetricsReport, Team, TeamConfig, UserRecord};
use crate::providers::{
    AnalysisDirectory, AuthorizationProvider, MetricsSource, Permission, ProviderError, TeamDirectory,
    UserStore,
};

/// Team grants per user. Permission level is ignored: the in-memory model
/// has a single grant set per user.
#[derive(Default)]
pub struct InMemoryAuthorization {
    grants: RwLock<HashMap<UserId, HashSet<TeamId>>>,
}

impl InMemoryAuthorization {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: &UserId, team_id: TeamId) {
        self.grants
            .write()
            .entry(user_id.clone())
            .or_default()
            .insert(team_id);
    }

    pub fn revoke_all(&self, user_id: &UserId) {
        self.grants.write().remove(user_id);
    }
}

#[async_trait]
impl AuthorizationProvider for InMemoryAuthorization {
    async fn user_team_ids(
        &self,
        user_id: &UserId,
        _permission: Permission,
    ) -> Result<HashSet<TeamId>, ProviderError> {
        Ok(self.grants.read().get(user_id).cloned().unwrap_or_default())
    }

    async fn users_with_team_access(
        &self,
        team_id: &TeamId,
        _permission: Permission,
    ) -> Result<HashSet<UserId>, ProviderError> {
        Ok(self
            .grants
            .read()
            .iter()
            .filter(|(_, teams)| teams.contains(team_id))
            .map(|(user, _)| user.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryAnalyses {
    analyses: RwLock<HashMap<AnalysisId, AnalysisRecord>>,
}

impl InMemoryAnalyses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, analysis: AnalysisRecord) {
        self.analyses.write().insert(analysis.id.clone(), analysis);
    }

    pub fn remove(&self, id: &AnalysisId) {
        self.analyses.write().remove(id);
    }
}

#[async_trait]
impl AnalysisDirectory for InMemoryAnalyses {
    async fn all_analyses(&self) -> Result<Vec<AnalysisRecord>, ProviderError> {
        Ok(self.analyses.read().values().cloned().collect())
    }

    async fn analysis_by_id(
        &self,
        id: &AnalysisId,
    ) -> Result<Option<AnalysisRecord>, ProviderError> {
        Ok(self.analyses.read().get(id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryTeams {
    teams: RwLock<Vec<Team>>,
    config: RwLock<TeamConfig>,
}

impl InMemoryTeams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, team: Team) {
        self.teams.write().push(team);
    }

    pub fn set_config(&self, config: TeamConfig) {
        *self.config.write() = config;
    }
}

#[async_trait]
impl TeamDirectory for InMemoryTeams {
    async fn all_teams(&self) -> Result<Vec<Team>, ProviderError> {
        Ok(self.teams.read().clone())
    }

    async fn config(&self) -> Result<TeamConfig, ProviderError> {
        Ok(self.config.read().clone())
    }
}

#[derive(Default)]
pub struct InMemoryUsers {
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl InMemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserRecord) {
        self.users.write().insert(user.id.clone(), user);
    }

    pub fn remove(&self, id: &UserId) {
        self.users.write().remove(id);
    }
}

#[async_trait]
impl UserStore for InMemoryUsers {
    async fn user_by_id(&self, id: &UserId) -> Result<Option<UserRecord>, ProviderError> {
        Ok(self.users.read().get(id).cloned())
    }
}

/// Metrics source returning a settable report. Can be flipped into a
/// failing state to exercise the degraded path.
#[derive(Default)]
pub struct InMemoryMetrics {
    report: RwLock<MetricsReport>,
    failing: AtomicBool,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_report(&self, report: MetricsReport) {
        *self.report.write() = report;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl MetricsSource for InMemoryMetrics {
    async fn all_metrics(&self) -> Result<MetricsReport, ProviderError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ProviderError::Unavailable("metrics source offline".into()));
        }
        Ok(self.report.read().clone())
    }
}

/// JSON seed for wiring the in-memory providers from a file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub analyses: Vec<AnalysisRecord>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
    #[serde(default)]
    pub team_structure: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: UserId,
    pub team_ids: Vec<TeamId>,
}

/// The full collaborator set, shared-ownership so tests can keep mutating
/// the concrete providers after handing trait objects to the engine.
#[derive(Clone)]
pub struct MemoryProviders {
    pub auth: Arc<InMemoryAuthorization>,
    pub analyses: Arc<InMemoryAnalyses>,
    pub teams: Arc<InMemoryTeams>,
    pub users: Arc<InMemoryUsers>,
    pub metrics: Arc<InMemoryMetrics>,
}

impl Default for MemoryProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProviders {
    pub fn new() -> Self {
        Self {
            auth: Arc::new(InMemoryAuthorization::new()),
            analyses: Arc::new(InMemoryAnalyses::new()),
            teams: Arc::new(InMemoryTeams::new()),
            users: Arc::new(InMemoryUsers::new()),
            metrics: Arc::new(InMemoryMetrics::new()),
        }
    }

    pub fn from_seed(seed: Seed) -> Self {
        let providers = Self::new();
        for user in seed.users {
            providers.users.insert(user);
        }
        for team in seed.teams {
            providers.teams.insert(team);
        }
        for analysis in seed.analyses {
            providers.analyses.insert(analysis);
        }
        for membership in seed.memberships {
            for team_id in membership.team_ids {
                providers.auth.grant(&membership.user_id, team_id);
            }
        }
        providers.teams.set_config(TeamConfig {
            team_structure: seed.team_structure,
        });
        providers
    }
}
