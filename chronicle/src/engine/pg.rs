use async_trait::async_trait;
use chronicle_store::PgStore;
use sqlx::{PgPool, Postgres, Transaction};
use std::{collections::HashMap, time::Duration};
use uuid::Uuid;

use crate::{
    checkpoint::{Checkpoint, CheckpointStatus},
    dispatcher::Projections,
    engine::Engine,
    error::{ProjectionError, Result},
    read_model::{plan, Mutation, Row},
};

const CHECKPOINT_COLUMNS: &str = "projector_name, cursor, status, last_error, error_position, \
     updated_at, leased_by, lease_expires_at";

const ROW_COLUMNS: &str = "table_name, row_key, data, last_position";

pub struct PgProjections;

impl PgProjections {
    pub fn new(pool: &PgPool) -> Projections {
        Projections::new(&PgStore::new(pool), Pg::new(pool))
    }
}

#[derive(Debug, Clone)]
pub struct Pg {
    pool: PgPool,
}

impl Pg {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    async fn locked_row(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        key: &str,
    ) -> Result<Option<Row>> {
        let row = sqlx::query_as::<_, Row>(
            format!(
                r#"
                SELECT {ROW_COLUMNS} FROM chronicle_read_model
                WHERE table_name = $1 AND row_key = $2
                FOR UPDATE
                "#
            )
            .as_str(),
        )
        .bind(table)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row)
    }

    /// Tells a missing checkpoint apart from one leased by another owner
    /// after a guarded update touched no row.
    async fn untouched(&self, projector: &str) -> ProjectionError {
        match self.checkpoint(projector).await {
            Ok(Some(_)) => ProjectionError::Leased {
                projector: projector.to_owned(),
            },
            Ok(None) => ProjectionError::CheckpointNotFound(projector.to_owned()),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl Engine for Pg {
    async fn register(&self, projector: &'_ str) -> Result<Checkpoint> {
        sqlx::query(
            r#"
            INSERT INTO chronicle_checkpoint (projector_name) VALUES ($1)
            ON CONFLICT (projector_name) DO NOTHING
            "#,
        )
        .bind(projector)
        .execute(&self.pool)
        .await?;

        self.checkpoint(projector)
            .await?
            .ok_or_else(|| ProjectionError::CheckpointNotFound(projector.to_owned()))
    }

    async fn checkpoint(&self, projector: &'_ str) -> Result<Option<Checkpoint>> {
        let checkpoint = sqlx::query_as::<_, Checkpoint>(
            format!("SELECT {CHECKPOINT_COLUMNS} FROM chronicle_checkpoint WHERE projector_name = $1")
                .as_str(),
        )
        .bind(projector)
        .fetch_optional(&self.pool)
        .await?;

        Ok(checkpoint)
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let checkpoints = sqlx::query_as::<_, Checkpoint>(
            format!("SELECT {CHECKPOINT_COLUMNS} FROM chronicle_checkpoint ORDER BY projector_name")
                .as_str(),
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(checkpoints)
    }

    async fn acquire(&self, projector: &'_ str, owner: Uuid, ttl: Duration) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE chronicle_checkpoint
            SET leased_by = $2, lease_expires_at = now() + make_interval(secs => $3)
            WHERE projector_name = $1
                AND (leased_by IS NULL OR leased_by = $2 OR lease_expires_at <= now())
            "#,
        )
        .bind(projector)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            return Ok(true);
        }

        match self.untouched(projector).await {
            ProjectionError::Leased { .. } => Ok(false),
            err => Err(err),
        }
    }

    async fn release(&self, projector: &'_ str, owner: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE chronicle_checkpoint SET leased_by = NULL, lease_expires_at = NULL
            WHERE projector_name = $1 AND leased_by = $2
            "#,
        )
        .bind(projector)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn commit(
        &self,
        projector: &'_ str,
        owner: Uuid,
        position: i64,
        mutations: Vec<Mutation>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let leased = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT leased_by IS NOT NULL AND leased_by <> $2 AND lease_expires_at > now()
            FROM chronicle_checkpoint WHERE projector_name = $1
            FOR UPDATE
            "#,
        )
        .bind(projector)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;

        match leased {
            None => return Err(ProjectionError::CheckpointNotFound(projector.to_owned())),
            Some(true) => {
                return Err(ProjectionError::Leased {
                    projector: projector.to_owned(),
                })
            }
            Some(false) => {}
        }

        let mut existing = HashMap::new();

        for mutation in &mutations {
            let slot = (mutation.table().to_owned(), mutation.key().to_owned());

            if existing.contains_key(&slot) {
                continue;
            }

            if let Some(row) = Self::locked_row(&mut tx, &slot.0, &slot.1).await? {
                existing.insert(slot, row);
            }
        }

        for ((table, key), row) in plan(existing, position, mutations)? {
            match row {
                Some(row) => {
                    sqlx::query(
                        r#"
                        INSERT INTO chronicle_read_model (table_name, row_key, data, last_position)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (table_name, row_key)
                        DO UPDATE SET data = EXCLUDED.data,
                            last_position = EXCLUDED.last_position,
                            updated_at = now()
                        "#,
                    )
                    .bind(&table)
                    .bind(&key)
                    .bind(&row.data)
                    .bind(row.last_position)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "DELETE FROM chronicle_read_model WHERE table_name = $1 AND row_key = $2",
                    )
                    .bind(&table)
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE chronicle_checkpoint SET cursor = $2, updated_at = now()
            WHERE projector_name = $1
            "#,
        )
        .bind(projector)
        .bind(position)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn fail(
        &self,
        projector: &'_ str,
        owner: Uuid,
        position: i64,
        error: &'_ str,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE chronicle_checkpoint
            SET status = $2, last_error = $3, error_position = $4, updated_at = now()
            WHERE projector_name = $1
                AND (leased_by IS NULL OR leased_by = $5 OR lease_expires_at <= now())
            "#,
        )
        .bind(projector)
        .bind(CheckpointStatus::Error)
        .bind(error)
        .bind(position)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.untouched(projector).await);
        }

        Ok(())
    }

    async fn transition(
        &self,
        projector: &'_ str,
        from: CheckpointStatus,
        to: CheckpointStatus,
    ) -> Result<Checkpoint> {
        let moved = sqlx::query_as::<_, Checkpoint>(
            format!(
                r#"
                UPDATE chronicle_checkpoint SET status = $3, updated_at = now()
                WHERE projector_name = $1 AND status = $2
                RETURNING {CHECKPOINT_COLUMNS}
                "#
            )
            .as_str(),
        )
        .bind(projector)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(checkpoint) = moved {
            return Ok(checkpoint);
        }

        match self.checkpoint(projector).await? {
            Some(current) => Err(ProjectionError::InvalidTransition {
                projector: projector.to_owned(),
                from: current.status,
                to,
            }),
            None => Err(ProjectionError::CheckpointNotFound(projector.to_owned())),
        }
    }

    async fn reset(&self, projector: &'_ str) -> Result<Checkpoint> {
        let checkpoint = sqlx::query_as::<_, Checkpoint>(
            format!(
                r#"
                UPDATE chronicle_checkpoint
                SET cursor = 0, status = $2, last_error = NULL, error_position = NULL,
                    updated_at = now()
                WHERE projector_name = $1
                RETURNING {CHECKPOINT_COLUMNS}
                "#
            )
            .as_str(),
        )
        .bind(projector)
        .bind(CheckpointStatus::Active)
        .fetch_optional(&self.pool)
        .await?;

        checkpoint.ok_or_else(|| ProjectionError::CheckpointNotFound(projector.to_owned()))
    }

    async fn clear(&self, tables: Vec<String>) -> Result<()> {
        sqlx::query("DELETE FROM chronicle_read_model WHERE table_name = ANY($1)")
            .bind(tables)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn row(&self, table: &'_ str, key: &'_ str) -> Result<Option<Row>> {
        let row = sqlx::query_as::<_, Row>(
            format!(
                "SELECT {ROW_COLUMNS} FROM chronicle_read_model WHERE table_name = $1 AND row_key = $2"
            )
            .as_str(),
        )
        .bind(table)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn rows(&self, table: &'_ str) -> Result<Vec<Row>> {
        let rows = sqlx::query_as::<_, Row>(
            format!(
                r#"
                SELECT {ROW_COLUMNS} FROM chronicle_read_model
                WHERE table_name = $1
                ORDER BY row_key COLLATE "C"
                "#
            )
            .as_str(),
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
