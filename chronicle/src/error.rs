use chronicle_store::StoreError;

use crate::{checkpoint::CheckpointStatus, snapshot::Difference};

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("projector {projector} failed at position {position}: {detail}")]
    ProjectorApplyError {
        projector: String,
        position: i64,
        detail: String,
    },

    #[error("rebuild of {projector} does not match live tables ({} differences)", .differences.len())]
    RebuildVerificationMismatch {
        projector: String,
        differences: Vec<Difference>,
    },

    #[error("projector {0} not found")]
    ProjectorNotFound(String),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("projector {projector} cannot move from {from} to {to}")]
    InvalidTransition {
        projector: String,
        from: CheckpointStatus,
        to: CheckpointStatus,
    },

    #[error("projector {projector} does not own table {table}")]
    UnownedTable { projector: String, table: String },

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("rebuild of {projector} cancelled at cursor {cursor}")]
    Cancelled { projector: String, cursor: i64 },

    #[error("projector {projector} is leased by another instance")]
    Leased { projector: String },

    #[error("table {table} is owned by {owner}, {claimant} cannot claim it")]
    TableClaimed {
        table: String,
        owner: String,
        claimant: String,
    },

    #[error("projector {projector} is {status}, only active projectors can be verified")]
    Inactive {
        projector: String,
        status: CheckpointStatus,
    },

    #[error("store `{0}`")]
    Store(#[from] StoreError),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[cfg(feature = "pg")]
    #[error("migrate `{0}`")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
