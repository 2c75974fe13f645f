/// Server-assigned item identifiers (`_id`) are opaque strings.
pub type ItemId = String;

/// Identifier of an authenticated user.
pub type UserId = String;

/// Identifier of a single client session of a user.
pub type SessionId = String;

/// Optimistic-concurrency token returned by the server on every write.
pub type Etag = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// JSON object carrying the payload fields of an item or draft.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Prefix the client gives to items that have not been persisted yet.
pub const TEMP_ID_PREFIX: &str = "tempId-";

/// Returns `true` if the id belongs to an item the server has never seen.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// The user and session this client acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user: UserId,
    pub session: SessionId,
}

impl SessionIdentity {
    pub fn new(user: impl Into<UserId>, session: impl Into<SessionId>) -> Self {
        Self {
            user: user.into(),
            session: session.into(),
        }
    }
}
