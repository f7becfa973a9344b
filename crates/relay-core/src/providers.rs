//! Interfaces to the external collaborators the engine consults.
//!
//! The engine never owns this data; it awaits these calls and treats any
//! failure as a transient upstream outage to degrade around, never to
//! propagate across sessions.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::ids::{AnalysisId, TeamId, UserId};
use crate::model::{AnalysisRecord, MetricsReport, Team, TeamConfig, UserRecord};

/// Access level being checked against a team.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    View,
    Edit,
}

/// Failure of a collaborator call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream returned malformed data: {0}")]
    Malformed(String),
}

/// Resolves which teams a user can act on, and the inverse.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn user_team_ids(
        &self,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<HashSet<TeamId>, ProviderError>;

    async fn users_with_team_access(
        &self,
        team_id: &TeamId,
        permission: Permission,
    ) -> Result<HashSet<UserId>, ProviderError>;
}

/// Catalog of analyses and their owning teams.
#[async_trait]
pub trait AnalysisDirectory: Send + Sync {
    async fn all_analyses(&self) -> Result<Vec<AnalysisRecord>, ProviderError>;

    async fn analysis_by_id(
        &self,
        id: &AnalysisId,
    ) -> Result<Option<AnalysisRecord>, ProviderError>;
}

/// Catalog of teams and team-level configuration.
#[async_trait]
pub trait TeamDirectory: Send + Sync {
    async fn all_teams(&self) -> Result<Vec<Team>, ProviderError>;

    async fn config(&self) -> Result<TeamConfig, ProviderError>;
}

/// Source of truth for user identity. Always queried fresh.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_by_id(&self, id: &UserId) -> Result<Option<UserRecord>, ProviderError>;
}

/// Source of the aggregate + per-process metrics snapshot.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn all_metrics(&self) -> Result<MetricsReport, ProviderError>;
}
