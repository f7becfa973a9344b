use relay_core::ids::SessionId;

/// Structural failures of subscription operations. Authorization denials
/// are not errors; they come back as data in the `denied` list.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("invalid topic name")]
    InvalidTopic,
}
