use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::Result,
    event::{Erasure, ErasureRequest, Event, PendingEvent},
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

/// Storage backend of the event log.
///
/// There is no way to change or remove an event through this trait:
/// `update_event` and `delete_event` exist only so the storage layer can refuse
/// them itself, and always fail with `StoreError::ImmutableRecord` for an
/// existing event.
#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    /// Next free sequence number of a stream, read from the durable log.
    async fn next_sequence(&self, aggregate_type: &'_ str, aggregate_id: &'_ str) -> Result<i32>;

    /// Allocates a sequence number (or checks the one given) and writes the
    /// event in a single atomic unit.
    async fn append(&self, event: PendingEvent, sequence: Option<i32>) -> Result<Event>;

    /// Events with `position > after`, in position order.
    async fn read(
        &self,
        after: i64,
        first: u16,
        aggregate_types: Option<Vec<String>>,
    ) -> Result<Vec<Event>>;

    async fn read_stream(
        &self,
        aggregate_type: &'_ str,
        aggregate_id: &'_ str,
    ) -> Result<Vec<Event>>;

    async fn get(&self, id: Uuid) -> Result<Option<Event>>;

    async fn last_position(&self) -> Result<i64>;

    async fn update_event(&self, id: Uuid, event_data: Value) -> Result<()>;

    async fn delete_event(&self, id: Uuid) -> Result<()>;

    /// Audited redaction: the only sanctioned way to alter a stored event.
    async fn erase(&self, id: Uuid, request: ErasureRequest) -> Result<Erasure>;

    async fn erasures(&self) -> Result<Vec<Erasure>>;
}

dyn_clone::clone_trait_object!(Engine);
