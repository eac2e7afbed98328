use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    event::{erased_data, Erasure, ErasureRequest, Event, PendingEvent},
    store::Store,
};

pub struct MemoryStore;

impl MemoryStore {
    pub fn create() -> Store {
        Store::new(Memory::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Memory(Arc<RwLock<EventLog>>);

/// Append-only log. `events[n]` holds position `n + 1`; there is no accessor
/// handing out a mutable event, only `push` and the audited `redact`.
#[derive(Debug, Default)]
struct EventLog {
    events: Vec<Event>,
    streams: HashMap<(String, String), Vec<usize>>,
    erasures: Vec<Erasure>,
}

impl EventLog {
    fn next_sequence(&self, aggregate_type: &str, aggregate_id: &str) -> i32 {
        self.streams
            .get(&(aggregate_type.to_owned(), aggregate_id.to_owned()))
            .and_then(|stream| stream.last())
            .map(|index| self.events[*index].sequence_number + 1)
            .unwrap_or(1)
    }

    fn push(&mut self, pending: PendingEvent, sequence: Option<i32>) -> Result<Event> {
        let next = self.next_sequence(&pending.aggregate_type, &pending.aggregate_id);
        let sequence = sequence.unwrap_or(next);

        if sequence != next {
            return Err(pending.conflict(sequence));
        }

        let position = i64::try_from(self.events.len()).map_err(anyhow::Error::from)? + 1;
        let event = pending.to_event(position, sequence);

        self.streams
            .entry((pending.aggregate_type, pending.aggregate_id))
            .or_default()
            .push(self.events.len());
        self.events.push(event.clone());

        Ok(event)
    }

    fn index_of(&self, id: Uuid) -> Option<usize> {
        self.events.iter().position(|event| event.id == id)
    }

    fn refuse(&self, id: Uuid, operation: &str) -> Result<()> {
        if self.index_of(id).is_none() {
            return Err(StoreError::EventNotFound(id));
        }

        tracing::error!("refused {operation} of immutable event id='{id}'");

        Err(StoreError::ImmutableRecord { event_id: id })
    }

    fn redact(&mut self, id: Uuid, request: ErasureRequest) -> Result<Erasure> {
        request.check()?;

        let index = self.index_of(id).ok_or(StoreError::EventNotFound(id))?;
        let event = &mut self.events[index];
        event.event_data = erased_data();
        event.metadata = None;

        let erasure = Erasure {
            event_id: id,
            position: event.position,
            reason: request.reason,
            requested_by: request.requested_by,
            erased_at: Utc::now(),
        };

        self.erasures.push(erasure.clone());

        Ok(erasure)
    }
}

#[async_trait]
impl Engine for Memory {
    async fn next_sequence(&self, aggregate_type: &'_ str, aggregate_id: &'_ str) -> Result<i32> {
        Ok(self.0.read().next_sequence(aggregate_type, aggregate_id))
    }

    async fn append(&self, event: PendingEvent, sequence: Option<i32>) -> Result<Event> {
        self.0.write().push(event, sequence)
    }

    async fn read(
        &self,
        after: i64,
        first: u16,
        aggregate_types: Option<Vec<String>>,
    ) -> Result<Vec<Event>> {
        let log = self.0.read();
        let start = usize::try_from(after.max(0))
            .unwrap_or(usize::MAX)
            .min(log.events.len());

        let events = log.events[start..]
            .iter()
            .filter(|event| match &aggregate_types {
                Some(types) => types.contains(&event.aggregate_type),
                None => true,
            })
            .take(usize::from(first))
            .cloned()
            .collect();

        Ok(events)
    }

    async fn read_stream(
        &self,
        aggregate_type: &'_ str,
        aggregate_id: &'_ str,
    ) -> Result<Vec<Event>> {
        let log = self.0.read();
        let Some(stream) = log
            .streams
            .get(&(aggregate_type.to_owned(), aggregate_id.to_owned()))
        else {
            return Ok(vec![]);
        };

        Ok(stream
            .iter()
            .map(|index| log.events[*index].clone())
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        let log = self.0.read();

        Ok(log.index_of(id).map(|index| log.events[index].clone()))
    }

    async fn last_position(&self) -> Result<i64> {
        Ok(self.0.read().events.last().map(|e| e.position).unwrap_or(0))
    }

    async fn update_event(&self, id: Uuid, _event_data: Value) -> Result<()> {
        self.0.read().refuse(id, "update")
    }

    async fn delete_event(&self, id: Uuid) -> Result<()> {
        self.0.read().refuse(id, "delete")
    }

    async fn erase(&self, id: Uuid, request: ErasureRequest) -> Result<Erasure> {
        let erasure = self.0.write().redact(id, request)?;

        tracing::warn!(
            "erased event id='{}' position='{}' requested_by='{}' reason='{}'",
            erasure.event_id,
            erasure.position,
            erasure.requested_by,
            erasure.reason
        );

        Ok(erasure)
    }

    async fn erasures(&self) -> Result<Vec<Erasure>> {
        Ok(self.0.read().erasures.clone())
    }
}
