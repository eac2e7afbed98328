use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use chronicle_store::Store;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use uuid::Uuid;

use crate::{
    checkpoint::{Checkpoint, CheckpointStatus},
    dispatcher::Projections,
    engine::Engine,
    error::{ProjectionError, Result},
    read_model::{plan, Mutation, Row},
};

pub struct MemoryProjections;

impl MemoryProjections {
    pub fn create(store: &Store) -> Projections {
        Projections::new(store, Memory::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Memory(Arc<RwLock<State>>);

#[derive(Debug, Default)]
struct State {
    checkpoints: BTreeMap<String, Checkpoint>,
    tables: HashMap<String, BTreeMap<String, Row>>,
}

impl State {
    fn checkpoint_mut(&mut self, projector: &str) -> Result<&mut Checkpoint> {
        self.checkpoints
            .get_mut(projector)
            .ok_or_else(|| ProjectionError::CheckpointNotFound(projector.to_owned()))
    }

    /// The checkpoint, unless another owner holds its lease.
    fn leased_mut(&mut self, projector: &str, owner: Uuid) -> Result<&mut Checkpoint> {
        let checkpoint = self.checkpoint_mut(projector)?;

        if checkpoint.is_leased_to_other(owner) {
            return Err(ProjectionError::Leased {
                projector: projector.to_owned(),
            });
        }

        Ok(checkpoint)
    }

    fn row(&self, table: &str, key: &str) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(key))
    }
}

#[async_trait]
impl Engine for Memory {
    async fn register(&self, projector: &'_ str) -> Result<Checkpoint> {
        let mut state = self.0.write();
        let checkpoint = state
            .checkpoints
            .entry(projector.to_owned())
            .or_insert_with(|| Checkpoint::new(projector));

        Ok(checkpoint.clone())
    }

    async fn checkpoint(&self, projector: &'_ str) -> Result<Option<Checkpoint>> {
        Ok(self.0.read().checkpoints.get(projector).cloned())
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.0.read().checkpoints.values().cloned().collect())
    }

    async fn acquire(&self, projector: &'_ str, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut state = self.0.write();
        let checkpoint = state.checkpoint_mut(projector)?;

        if checkpoint.is_leased_to_other(owner) {
            return Ok(false);
        }

        let ttl = TimeDelta::from_std(ttl).map_err(|err| ProjectionError::Any(err.into()))?;
        checkpoint.leased_by = Some(owner);
        checkpoint.lease_expires_at = Some(Utc::now() + ttl);

        Ok(true)
    }

    async fn release(&self, projector: &'_ str, owner: Uuid) -> Result<()> {
        let mut state = self.0.write();
        let checkpoint = state.checkpoint_mut(projector)?;

        if checkpoint.leased_by == Some(owner) {
            checkpoint.leased_by = None;
            checkpoint.lease_expires_at = None;
        }

        Ok(())
    }

    async fn commit(
        &self,
        projector: &'_ str,
        owner: Uuid,
        position: i64,
        mutations: Vec<Mutation>,
    ) -> Result<()> {
        let mut state = self.0.write();
        state.leased_mut(projector, owner)?;

        let existing = mutations
            .iter()
            .filter_map(|m| state.row(m.table(), m.key()))
            .map(|row| ((row.table_name.to_owned(), row.key.to_owned()), row.clone()))
            .collect::<HashMap<_, _>>();

        let changes = plan(existing, position, mutations)?;

        for ((table, key), row) in changes {
            match row {
                Some(row) => {
                    state.tables.entry(table).or_default().insert(key, row);
                }
                None => {
                    if let Some(rows) = state.tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }

        let checkpoint = state.checkpoint_mut(projector)?;
        checkpoint.cursor = position;
        checkpoint.updated_at = Utc::now();

        Ok(())
    }

    async fn fail(
        &self,
        projector: &'_ str,
        owner: Uuid,
        position: i64,
        error: &'_ str,
    ) -> Result<()> {
        let mut state = self.0.write();
        let checkpoint = state.leased_mut(projector, owner)?;
        checkpoint.status = CheckpointStatus::Error;
        checkpoint.last_error = Some(error.to_owned());
        checkpoint.error_position = Some(position);
        checkpoint.updated_at = Utc::now();

        Ok(())
    }

    async fn transition(
        &self,
        projector: &'_ str,
        from: CheckpointStatus,
        to: CheckpointStatus,
    ) -> Result<Checkpoint> {
        let mut state = self.0.write();
        let checkpoint = state.checkpoint_mut(projector)?;

        if checkpoint.status != from {
            return Err(ProjectionError::InvalidTransition {
                projector: projector.to_owned(),
                from: checkpoint.status,
                to,
            });
        }

        checkpoint.status = to;
        checkpoint.updated_at = Utc::now();

        Ok(checkpoint.clone())
    }

    async fn reset(&self, projector: &'_ str) -> Result<Checkpoint> {
        let mut state = self.0.write();
        let checkpoint = state.checkpoint_mut(projector)?;
        checkpoint.cursor = 0;
        checkpoint.status = CheckpointStatus::Active;
        checkpoint.last_error = None;
        checkpoint.error_position = None;
        checkpoint.updated_at = Utc::now();

        Ok(checkpoint.clone())
    }

    async fn clear(&self, tables: Vec<String>) -> Result<()> {
        let mut state = self.0.write();

        for table in tables {
            state.tables.remove(&table);
        }

        Ok(())
    }

    async fn row(&self, table: &'_ str, key: &'_ str) -> Result<Option<Row>> {
        Ok(self.0.read().row(table, key).cloned())
    }

    async fn rows(&self, table: &'_ str) -> Result<Vec<Row>> {
        Ok(self
            .0
            .read()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}
