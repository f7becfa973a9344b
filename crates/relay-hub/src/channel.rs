use std::collections::HashSet;
use std::fmt;

use relay_core::ids::{AnalysisId, SessionId};

/// Name of a broadcast group. `Global` is the permanent channel every
/// session joins on connect; analysis channels come and go with their
/// subscribers.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum ChannelName {
    Global,
    Analysis(AnalysisId),
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Analysis(id) => f.write_str(id.as_str()),
        }
    }
}

/// What happens to a channel when its last member leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupPolicy {
    Permanent,
    OnEmpty,
}

/// A named broadcast group of sessions. One concrete type for both the
/// global channel and per-analysis channels; the policy decides lifecycle.
#[derive(Debug)]
pub struct Channel {
    name: ChannelName,
    policy: CleanupPolicy,
    members: HashSet<SessionId>,
}

impl Channel {
    pub fn new(name: ChannelName, policy: CleanupPolicy) -> Self {
        Self {
            name,
            policy,
            members: HashSet::new(),
        }
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    pub fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    /// Add a member. Idempotent; returns true if the session was new.
    pub fn register(&mut self, session_id: &SessionId) -> bool {
        self.members.insert(session_id.clone())
    }

    /// Remove a member. Returns true if the session was present.
    pub fn deregister(&mut self, session_id: &SessionId) -> bool {
        self.members.remove(session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.contains(session_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &SessionId> {
        self.members.iter()
    }

    /// True once the channel is empty and its policy allows deletion.
    pub fn is_removable(&self) -> bool {
        self.policy == CleanupPolicy::OnEmpty && self.members.is_empty()
    }
}
