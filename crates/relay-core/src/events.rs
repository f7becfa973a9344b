use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::{AnalysisId, SessionId};
use crate::model::{AnalysisRecord, MetricsReport, ProcessState, Team, UserRecord};

/// Snapshot pushed on connect and on explicit refresh. Unfiltered for
/// admins, team-filtered for regular users.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub user: UserRecord,
    pub analyses: Vec<AnalysisRecord>,
    pub teams: Vec<Team>,
    pub team_structure: Value,
}

/// Events pushed to connected clients, one JSON document per frame.
/// Serialization goes through [`Event::to_payload`], which injects the
/// `timestamp` field at push time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "connection")]
    Connection {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },

    #[serde(rename = "init")]
    Init {
        #[serde(flatten)]
        payload: InitPayload,
    },

    #[serde(rename = "statusUpdate")]
    StatusUpdate {
        #[serde(flatten)]
        state: ProcessState,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(rename = "metricsUpdate")]
    MetricsUpdate {
        #[serde(flatten)]
        metrics: MetricsReport,
    },

    #[serde(rename = "log")]
    Log {
        #[serde(rename = "analysisId")]
        analysis_id: AnalysisId,
        line: String,
    },

    #[serde(rename = "refresh")]
    Refresh {
        #[serde(flatten)]
        payload: InitPayload,
    },

    /// Escape hatch for ad hoc broadcast types originated by external
    /// triggers. `data` is merged into the payload object as-is.
    #[serde(rename = "custom")]
    Custom { name: String, data: Value },
}

impl Event {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Init { .. } => "init",
            Self::StatusUpdate { .. } => "statusUpdate",
            Self::Heartbeat => "heartbeat",
            Self::MetricsUpdate { .. } => "metricsUpdate",
            Self::Log { .. } => "log",
            Self::Refresh { .. } => "refresh",
            Self::Custom { name, .. } => name,
        }
    }

    /// Wire form: the tagged payload object with a `timestamp` injected.
    pub fn to_payload(&self) -> Value {
        let mut value = match self {
            Self::Custom { name, data } => {
                let mut obj = match data {
                    Value::Object(map) => Value::Object(map.clone()),
                    other => json!({ "data": other }),
                };
                obj["type"] = json!(name);
                obj
            }
            other => serde_json::to_value(other).unwrap_or_else(|_| json!({})),
        };
        value["timestamp"] = json!(Utc::now().to_rfc3339());
        value
    }

    /// Wire form as a string, ready to hand to a session's send queue.
    pub fn to_frame(&self) -> String {
        self.to_payload().to_string()
    }
}
