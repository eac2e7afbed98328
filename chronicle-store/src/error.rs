use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sequence {sequence} already taken or out of order for {aggregate_type}#{aggregate_id}")]
    SequenceConflict {
        aggregate_type: String,
        aggregate_id: String,
        sequence: i32,
    },

    #[error("append to {aggregate_type}#{aggregate_id} failed after {attempts} attempts")]
    AppendFailed {
        aggregate_type: String,
        aggregate_id: String,
        attempts: u8,
    },

    #[error("invalid actor type `{0}`")]
    InvalidActor(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("metadata must be an object")]
    MetadataInvalidObjectType,

    #[error("validation `{0}`")]
    Validation(#[from] validator::ValidationErrors),

    #[error("event {event_id} is immutable")]
    ImmutableRecord { event_id: Uuid },

    #[error("event {0} not found")]
    EventNotFound(Uuid),

    #[error("invalid erasure request: {0}")]
    InvalidErasure(String),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_sequence_conflict(&self) -> bool {
        matches!(self, StoreError::SequenceConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
