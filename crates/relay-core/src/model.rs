use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AnalysisId, TeamId, UserId};

/// Team id reserved for analyses that have not been assigned to any team.
/// Such analyses are visible to every authenticated user.
pub const UNCATEGORIZED_TEAM: &str = "uncategorized";

/// User role as recorded in the user store.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::User => write!(f, "user"),
        }
    }
}

/// A user as returned by the user store. Always fetched fresh; the role
/// cached on a connection at handshake time is never trusted afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub role: Role,
    pub email: String,
    pub name: String,
}

/// An analysis as known to the analysis directory. Its id doubles as the
/// topic name for the per-analysis log channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: AnalysisId,
    pub name: String,
    pub team_id: TeamId,
}

impl AnalysisRecord {
    pub fn is_uncategorized(&self) -> bool {
        self.team_id.as_str() == UNCATEGORIZED_TEAM
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

/// Team-level configuration, including the folder structure the UI renders.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    #[serde(default)]
    pub team_structure: serde_json::Value,
}

/// System-wide resource usage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub load_average: f64,
}

/// Resource usage of a single running analysis process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub analysis_id: AnalysisId,
    pub team_id: TeamId,
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub status: String,
}

/// Snapshot from the metrics source: aggregate plus per-process breakdown.
/// The per-session view pushed to clients is this same shape with the
/// process list filtered to what the recipient may see.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    pub aggregate: AggregateMetrics,
    pub processes: Vec<ProcessMetrics>,
}

/// Process lifecycle status broadcast to clients on change.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    #[default]
    Idle,
    Running,
    Error,
}

/// Singleton process state, mutated by external triggers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    pub status: ProcessStatus,
    pub message: String,
    pub start_time: DateTime<Utc>,
}

impl ProcessState {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            status: ProcessStatus::Idle,
            message: String::new(),
            start_time,
        }
    }

    /// Merge a partial update, leaving unset fields untouched.
    pub fn apply(&mut self, update: ProcessStateUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(message) = update.message {
            self.message = message;
        }
        if let Some(start_time) = update.start_time {
            self.start_time = start_time;
        }
    }
}

/// Partial update for [`ProcessState`]. All fields optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStateUpdate {
    pub status: Option<ProcessStatus>,
    pub message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}
