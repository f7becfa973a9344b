//! Initial-data synchronization.
//!
//! On connect, and whenever a user's access may have changed, the user's
//! identity is re-fetched fresh from the user store and a consistent
//! snapshot is pushed: unfiltered for admins, team-filtered for everyone
//! else. A user that no longer exists aborts silently.

use relay_core::events::{Event, InitPayload};
use relay_core::ids::{SessionId, UserId};

use crate::hub::EventHub;

impl EventHub {
    /// Push a fresh `init` snapshot to one session. Used on connect.
    pub async fn sync_session(&self, session_id: &SessionId) {
        let Some(user_id) = self
            .state
            .read()
            .sessions
            .get(session_id)
            .map(|entry| entry.user_id.clone())
        else {
            return;
        };
        let Some(payload) = self.build_init_payload(&user_id).await else {
            return;
        };
        // The session may have disconnected while collaborators were
        // consulted; refresh the role snapshot only if it is still there.
        {
            let mut guard = self.state.write();
            let Some(entry) = guard.sessions.get_mut(session_id) else {
                return;
            };
            entry.role = payload.user.role;
        }
        self.push_to_session(session_id, &Event::Init { payload });
    }

    /// Re-resolve a user's identity and push a `refresh` snapshot to every
    /// session they own. This is how an external role change becomes
    /// visible without reconnecting.
    pub async fn refresh_user(&self, user_id: &UserId) {
        let Some(payload) = self.build_init_payload(user_id).await else {
            return;
        };
        let targets: Vec<SessionId> = {
            let mut guard = self.state.write();
            guard
                .sessions
                .iter_mut()
                .filter(|(_, entry)| &entry.user_id == user_id)
                .map(|(id, entry)| {
                    entry.role = payload.user.role;
                    id.clone()
                })
                .collect()
        };
        for session_id in targets {
            self.push_to_session(
                &session_id,
                &Event::Refresh {
                    payload: payload.clone(),
                },
            );
        }
    }

    /// Build the snapshot for a user, or None when the user is gone or a
    /// collaborator is unavailable. Never raises.
    async fn build_init_payload(&self, user_id: &UserId) -> Option<InitPayload> {
        let user = match self.users.user_by_id(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::debug!(user_id = %user_id, "user no longer exists, skipping snapshot");
                return None;
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "user store unavailable, skipping snapshot");
                return None;
            }
        };

        let analyses = match self.analyses.all_analyses().await {
            Ok(analyses) => analyses,
            Err(e) => {
                tracing::warn!(error = %e, "analysis directory unavailable, skipping snapshot");
                return None;
            }
        };
        let teams = match self.teams.all_teams().await {
            Ok(teams) => teams,
            Err(e) => {
                tracing::warn!(error = %e, "team directory unavailable, skipping snapshot");
                return None;
            }
        };
        let config = match self.teams.config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "team config unavailable, skipping snapshot");
                return None;
            }
        };

        if user.role.is_admin() {
            return Some(InitPayload {
                user,
                analyses,
                teams,
                team_structure: config.team_structure,
            });
        }

        let accessible = match self.gate.accessible_team_ids(user_id).await {
            Ok(teams) => teams,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "team resolution failed, skipping snapshot");
                return None;
            }
        };
        Some(InitPayload {
            user,
            analyses: analyses
                .into_iter()
                .filter(|a| a.is_uncategorized() || accessible.contains(&a.team_id))
                .collect(),
            teams: teams
                .into_iter()
                .filter(|t| accessible.contains(&t.id))
                .collect(),
            team_structure: config.team_structure,
        })
    }
}
