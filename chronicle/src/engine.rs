#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "memory")]
pub use memory::*;

#[cfg(feature = "pg")]
mod pg;
#[cfg(feature = "pg")]
pub use pg::*;

use async_trait::async_trait;
use dyn_clone::DynClone;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    checkpoint::{Checkpoint, CheckpointStatus},
    error::Result,
    read_model::{Mutation, Row},
};

/// Storage of checkpoints and projected tables.
#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    /// Creates the checkpoint at cursor 0 / active, or returns the existing
    /// one unchanged.
    async fn register(&self, projector: &'_ str) -> Result<Checkpoint>;

    async fn checkpoint(&self, projector: &'_ str) -> Result<Option<Checkpoint>>;

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>>;

    /// Takes or renews the lease of `projector` for `owner`, valid for `ttl`.
    ///
    /// Returns `false` while another owner holds a lease that has not
    /// expired. The lease is stored with the checkpoint, so every process
    /// sharing the engine sees it.
    async fn acquire(&self, projector: &'_ str, owner: Uuid, ttl: Duration) -> Result<bool>;

    /// Drops the lease if `owner` holds it.
    async fn release(&self, projector: &'_ str, owner: Uuid) -> Result<()>;

    /// Applies the mutations of the event at `position` and moves the cursor
    /// to it, all or nothing. Fails with `Leased` when a lease of another
    /// owner is running.
    async fn commit(
        &self,
        projector: &'_ str,
        owner: Uuid,
        position: i64,
        mutations: Vec<Mutation>,
    ) -> Result<()>;

    /// Marks the checkpoint as failed at `position`, leaving the cursor alone.
    async fn fail(
        &self,
        projector: &'_ str,
        owner: Uuid,
        position: i64,
        error: &'_ str,
    ) -> Result<()>;

    /// Moves the status from `from` to `to`, failing with
    /// `InvalidTransition` when the stored status is not `from`.
    async fn transition(
        &self,
        projector: &'_ str,
        from: CheckpointStatus,
        to: CheckpointStatus,
    ) -> Result<Checkpoint>;

    /// Cursor back to 0, status active, error cleared.
    async fn reset(&self, projector: &'_ str) -> Result<Checkpoint>;

    async fn clear(&self, tables: Vec<String>) -> Result<()>;

    async fn row(&self, table: &'_ str, key: &'_ str) -> Result<Option<Row>>;

    /// Every row of a table ordered by key.
    async fn rows(&self, table: &'_ str) -> Result<Vec<Row>>;
}

dyn_clone::clone_trait_object!(Engine);
