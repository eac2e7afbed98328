use serde_json::Value;
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    event::{AppendRequest, Erasure, ErasureRequest, Event},
};

/// How many times [`Store::append`] re-reads the sequence after a conflict.
pub const DEFAULT_MAX_APPEND_RETRIES: u8 = 3;

#[derive(Clone)]
pub struct Store {
    pub(crate) engine: Box<dyn Engine>,
    max_retries: u8,
}

impl Store {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
            max_retries: DEFAULT_MAX_APPEND_RETRIES,
        }
    }

    pub fn max_retries(mut self, value: u8) -> Self {
        self.max_retries = value;

        self
    }

    pub async fn next_sequence(
        &self,
        aggregate_type: impl AsRef<str>,
        aggregate_id: impl AsRef<str>,
    ) -> Result<i32> {
        self.engine
            .next_sequence(aggregate_type.as_ref(), aggregate_id.as_ref())
            .await
    }

    /// Appends one event, letting the engine allocate the sequence number.
    ///
    /// A `SequenceConflict` is retried with a freshly read sequence until
    /// `max_retries` is exhausted, then reported as `AppendFailed`. Validation
    /// errors are returned before anything is written and never retried.
    pub async fn append(&self, request: AppendRequest) -> Result<Event> {
        let pending = request.prepare()?;
        let attempts = self.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            match self.engine.append(pending.clone(), None).await {
                Ok(event) => {
                    tracing::debug!(
                        "appended id='{}' position='{}' stream='{}#{}' sequence='{}' type='{}'",
                        event.id,
                        event.position,
                        event.aggregate_type,
                        event.aggregate_id,
                        event.sequence_number,
                        event.event_type
                    );

                    return Ok(event);
                }
                Err(err) if err.is_sequence_conflict() => {
                    tracing::warn!("append attempt {attempt}/{attempts} conflicted: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::AppendFailed {
            aggregate_type: pending.aggregate_type,
            aggregate_id: pending.aggregate_id,
            attempts,
        })
    }

    /// Appends one event at an explicit sequence number.
    ///
    /// Fails with `SequenceConflict` unless `sequence` is exactly the next
    /// free one of the stream; the caller decides whether to re-read and retry.
    pub async fn append_at(&self, request: AppendRequest, sequence: i32) -> Result<Event> {
        let pending = request.prepare()?;

        self.engine.append(pending, Some(sequence)).await
    }

    pub async fn read(
        &self,
        after: i64,
        first: u16,
        aggregate_types: Option<Vec<String>>,
    ) -> Result<Vec<Event>> {
        self.engine.read(after, first, aggregate_types).await
    }

    pub async fn read_stream(
        &self,
        aggregate_type: impl AsRef<str>,
        aggregate_id: impl AsRef<str>,
    ) -> Result<Vec<Event>> {
        self.engine
            .read_stream(aggregate_type.as_ref(), aggregate_id.as_ref())
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        self.engine.get(id).await
    }

    pub async fn last_position(&self) -> Result<i64> {
        self.engine.last_position().await
    }

    pub async fn update_event(&self, id: Uuid, event_data: Value) -> Result<()> {
        self.engine.update_event(id, event_data).await
    }

    pub async fn delete_event(&self, id: Uuid) -> Result<()> {
        self.engine.delete_event(id).await
    }

    pub async fn erase(&self, id: Uuid, request: ErasureRequest) -> Result<Erasure> {
        self.engine.erase(id, request).await
    }

    pub async fn erasures(&self) -> Result<Vec<Erasure>> {
        self.engine.erasures().await
    }
}
