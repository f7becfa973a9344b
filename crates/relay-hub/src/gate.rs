use std::collections::HashSet;
use std::sync::Arc;

use relay_core::ids::{AnalysisId, TeamId, UserId};
use relay_core::model::{Role, UNCATEGORIZED_TEAM};
use relay_core::providers::{AnalysisDirectory, AuthorizationProvider, Permission, ProviderError};

/// Decides, per (user, analysis), whether a subscription is allowed.
///
/// Admins pass unconditionally. Everyone else must hold view access to the
/// analysis's owning team, with `uncategorized` analyses open to all.
pub struct PermissionGate {
    auth: Arc<dyn AuthorizationProvider>,
    analyses: Arc<dyn AnalysisDirectory>,
}

impl PermissionGate {
    pub fn new(auth: Arc<dyn AuthorizationProvider>, analyses: Arc<dyn AnalysisDirectory>) -> Self {
        Self { auth, analyses }
    }

    pub async fn is_authorized(
        &self,
        user_id: &UserId,
        role: Role,
        analysis_id: &AnalysisId,
    ) -> Result<bool, ProviderError> {
        if role.is_admin() {
            return Ok(true);
        }
        let Some(analysis) = self.analyses.analysis_by_id(analysis_id).await? else {
            // The directory cannot resolve an owning team; deny rather than
            // leak events for deleted analyses.
            return Ok(false);
        };
        if analysis.is_uncategorized() {
            return Ok(true);
        }
        let teams = self.auth.user_team_ids(user_id, Permission::View).await?;
        Ok(teams.contains(&analysis.team_id))
    }

    /// Team ids the user can view, including the uncategorized sentinel.
    /// Shared by the metrics filter and the initial-data filter.
    pub async fn accessible_team_ids(
        &self,
        user_id: &UserId,
    ) -> Result<HashSet<TeamId>, ProviderError> {
        let mut teams = self.auth.user_team_ids(user_id, Permission::View).await?;
        teams.insert(TeamId::from_raw(UNCATEGORIZED_TEAM));
        Ok(teams)
    }
}
