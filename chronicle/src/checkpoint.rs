use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "pg",
    derive(sqlx::Type),
    sqlx(type_name = "checkpoint_status", rename_all = "snake_case")
)]
pub enum CheckpointStatus {
    Active,
    Paused,
    Error,
}

impl CheckpointStatus {
    /// Edges of the checkpoint state machine.
    ///
    /// `active -> error` is taken by the dispatcher on a failed apply,
    /// `error -> active` by an operator reset, and `active <-> paused` by
    /// operators or a cancelled rebuild.
    pub fn can_become(self, to: CheckpointStatus) -> bool {
        use CheckpointStatus::*;

        matches!(
            (self, to),
            (Active, Error) | (Error, Active) | (Active, Paused) | (Paused, Active)
        )
    }
}

/// Progress of one projector through the global event order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct Checkpoint {
    pub projector_name: String,
    /// Position of the last event applied, 0 when nothing was applied yet.
    pub cursor: i64,
    pub status: CheckpointStatus,
    pub last_error: Option<String>,
    pub error_position: Option<i64>,
    pub updated_at: DateTime<Utc>,
    /// Instance holding the projector, see [`crate::Engine::acquire`].
    pub leased_by: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(projector_name: impl Into<String>) -> Self {
        Self {
            projector_name: projector_name.into(),
            cursor: 0,
            status: CheckpointStatus::Active,
            last_error: None,
            error_position: None,
            updated_at: Utc::now(),
            leased_by: None,
            lease_expires_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CheckpointStatus::Active
    }

    /// Whether an owner other than `owner` holds an unexpired lease.
    pub fn is_leased_to_other(&self, owner: Uuid) -> bool {
        match (self.leased_by, self.lease_expires_at) {
            (Some(holder), Some(expires_at)) => holder != owner && expires_at > Utc::now(),
            _ => false,
        }
    }
}
