use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

use crate::error::{Result, StoreError};

/// Who caused an event. Closed set; anything else is rejected at append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    feature = "pg",
    derive(sqlx::Type),
    sqlx(type_name = "actor_type", rename_all = "snake_case")
)]
pub enum ActorType {
    System,
    User,
    Ai,
    External,
}

/// A stored, immutable fact about an aggregate.
///
/// `sequence_number` orders events inside one aggregate stream, `position`
/// orders every event of the store and is what projector cursors point at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct Event {
    pub id: Uuid,
    pub position: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub sequence_number: i32,
    pub event_type: String,
    pub event_data: Value,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn to_data<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.event_data.clone())?)
    }

    pub fn to_metadata<D: DeserializeOwned>(&self) -> Result<Option<D>> {
        if let Some(metadata) = self.metadata.clone() {
            Ok(Some(serde_json::from_value(metadata)?))
        } else {
            Ok(None)
        }
    }

    /// `aggregate_type/event_type`, the name subscription filters match against.
    pub fn topic(&self) -> String {
        format!("{}/{}", self.aggregate_type, self.event_type)
    }

    pub fn is_erased(&self) -> bool {
        self.event_data.get(ERASED_MARKER) == Some(&Value::Bool(true))
    }
}

pub(crate) const ERASED_MARKER: &str = "_erased";

/// Input of the append interface, as handed over by collaborators.
///
/// `actor_type` stays a raw string until [`AppendRequest::prepare`] so that a
/// bad value is reported as [`StoreError::InvalidActor`] rather than failing
/// deserialization somewhere upstream.
#[derive(Debug, Clone, Validate)]
pub struct AppendRequest {
    #[validate(length(min = 1, max = 50))]
    pub aggregate_type: String,
    #[validate(length(min = 1, max = 100))]
    pub aggregate_id: String,
    #[validate(length(min = 1, max = 100))]
    pub event_type: String,
    pub event_data: Value,
    pub actor_type: String,
    #[validate(length(min = 1, max = 100))]
    pub actor_id: Option<String>,
    pub metadata: Option<Value>,
}

impl AppendRequest {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            event_data: Value::Object(Map::new()),
            actor_type: ActorType::System.to_string(),
            actor_id: None,
            metadata: None,
        }
    }

    pub fn data<D: Serialize>(mut self, value: D) -> Result<Self> {
        self.event_data = serde_json::to_value(&value)?;

        Ok(self)
    }

    pub fn actor(mut self, actor_type: impl Into<String>, actor_id: Option<&str>) -> Self {
        self.actor_type = actor_type.into();
        self.actor_id = actor_id.map(ToOwned::to_owned);

        self
    }

    pub fn metadata<M: Serialize>(mut self, value: M) -> Result<Self> {
        let metadata = serde_json::to_value(&value)?;

        if !metadata.is_object() {
            return Err(StoreError::MetadataInvalidObjectType);
        }

        self.metadata = Some(metadata);

        Ok(self)
    }

    /// Validates the request without touching storage.
    pub fn prepare(self) -> Result<PendingEvent> {
        self.validate()?;

        let actor_type = self
            .actor_type
            .parse::<ActorType>()
            .map_err(|_| StoreError::InvalidActor(self.actor_type.to_owned()))?;

        if !self.event_data.is_object() {
            return Err(StoreError::InvalidPayload(
                "event_data must be an object".to_owned(),
            ));
        }

        if self
            .event_data
            .as_object()
            .is_some_and(|data| data.contains_key(ERASED_MARKER))
        {
            return Err(StoreError::InvalidPayload(format!(
                "`{ERASED_MARKER}` is reserved"
            )));
        }

        if self.metadata.as_ref().is_some_and(|m| !m.is_object()) {
            return Err(StoreError::MetadataInvalidObjectType);
        }

        Ok(PendingEvent {
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            event_data: self.event_data,
            actor_type,
            actor_id: self.actor_id,
            metadata: self.metadata,
        })
    }
}

/// A validated event waiting for its sequence number and position.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub metadata: Option<Value>,
}

impl PendingEvent {
    pub(crate) fn to_event(&self, position: i64, sequence_number: i32) -> Event {
        Event {
            id: Uuid::new_v4(),
            position,
            aggregate_type: self.aggregate_type.to_owned(),
            aggregate_id: self.aggregate_id.to_owned(),
            sequence_number,
            event_type: self.event_type.to_owned(),
            event_data: self.event_data.clone(),
            actor_type: self.actor_type,
            actor_id: self.actor_id.clone(),
            metadata: self.metadata.clone(),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn conflict(&self, sequence: i32) -> StoreError {
        StoreError::SequenceConflict {
            aggregate_type: self.aggregate_type.to_owned(),
            aggregate_id: self.aggregate_id.to_owned(),
            sequence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErasureRequest {
    pub reason: String,
    pub requested_by: String,
}

impl ErasureRequest {
    pub fn new(reason: impl Into<String>, requested_by: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            requested_by: requested_by.into(),
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.reason.trim().is_empty() {
            return Err(StoreError::InvalidErasure("reason is required".to_owned()));
        }

        if self.requested_by.trim().is_empty() {
            return Err(StoreError::InvalidErasure(
                "requested_by is required".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Audit entry written whenever an event payload is redacted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct Erasure {
    pub event_id: Uuid,
    pub position: i64,
    pub reason: String,
    pub requested_by: String,
    pub erased_at: DateTime<Utc>,
}

pub(crate) fn erased_data() -> Value {
    let mut data = Map::new();
    data.insert(ERASED_MARKER.to_owned(), Value::Bool(true));

    Value::Object(data)
}
