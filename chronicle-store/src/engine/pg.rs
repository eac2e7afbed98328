use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    event::{erased_data, Erasure, ErasureRequest, Event, PendingEvent},
    store::Store,
};

/// SQLSTATE raised by the `chronicle_event_immutable` trigger.
pub const IMMUTABLE_SQLSTATE: &str = "CH001";

const EVENT_COLUMNS: &str = "position, id, aggregate_type, aggregate_id, sequence_number, \
     event_type, event_data, actor_type, actor_id, metadata, created_at";

pub struct PgStore;

impl PgStore {
    pub fn new(pool: &PgPool) -> Store {
        Store::new(Pg::new(pool))
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

    fn refused(err: sqlx::Error, id: Uuid, operation: &str) -> StoreError {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(IMMUTABLE_SQLSTATE) => {
                tracing::error!("refused {operation} of immutable event id='{id}'");

                StoreError::ImmutableRecord { event_id: id }
            }
            _ => err.into(),
        }
    }
}

#[async_trait]
impl Engine for Pg {
    async fn next_sequence(&self, aggregate_type: &'_ str, aggregate_id: &'_ str) -> Result<i32> {
        let next = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM chronicle_event
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(next)
    }

    async fn append(&self, event: PendingEvent, sequence: Option<i32>) -> Result<Event> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}#{}", event.aggregate_type, event.aggregate_id))
            .execute(&mut *tx)
            .await?;

        let next = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM chronicle_event
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .fetch_one(&mut *tx)
        .await?;

        let sequence = sequence.unwrap_or(next);

        if sequence != next {
            tx.rollback().await?;

            return Err(event.conflict(sequence));
        }

        let pending = event.to_event(0, sequence);
        let inserted = sqlx::query_as::<_, Event>(
            format!(
                r#"
                INSERT INTO chronicle_event
                    (id, aggregate_type, aggregate_id, sequence_number, event_type,
                     event_data, actor_type, actor_id, metadata, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING {EVENT_COLUMNS}
                "#
            )
            .as_str(),
        )
        .bind(pending.id)
        .bind(&pending.aggregate_type)
        .bind(&pending.aggregate_id)
        .bind(pending.sequence_number)
        .bind(&pending.event_type)
        .bind(&pending.event_data)
        .bind(pending.actor_type)
        .bind(&pending.actor_id)
        .bind(&pending.metadata)
        .bind(pending.created_at)
        .fetch_one(&mut *tx)
        .await;

        let inserted = match inserted {
            Ok(inserted) => inserted,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tx.rollback().await?;

                return Err(event.conflict(sequence));
            }
            Err(err) => return Err(err.into()),
        };

        tx.commit().await?;

        Ok(inserted)
    }

    async fn read(
        &self,
        after: i64,
        first: u16,
        aggregate_types: Option<Vec<String>>,
    ) -> Result<Vec<Event>> {
        // Only rows whose transaction is older than every in-flight one: a
        // late commit can never show up behind a cursor that already passed it.
        let events = sqlx::query_as::<_, Event>(
            format!(
                r#"
                SELECT {EVENT_COLUMNS} FROM chronicle_event
                WHERE position > $1
                    AND transaction_id < pg_snapshot_xmin(pg_current_snapshot())
                    AND ($3::text[] IS NULL OR aggregate_type = ANY($3))
                ORDER BY position ASC
                LIMIT $2
                "#
            )
            .as_str(),
        )
        .bind(after)
        .bind(i64::from(first))
        .bind(aggregate_types)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn read_stream(
        &self,
        aggregate_type: &'_ str,
        aggregate_id: &'_ str,
    ) -> Result<Vec<Event>> {
        let events = sqlx::query_as::<_, Event>(
            format!(
                r#"
                SELECT {EVENT_COLUMNS} FROM chronicle_event
                WHERE aggregate_type = $1 AND aggregate_id = $2
                ORDER BY sequence_number ASC
                "#
            )
            .as_str(),
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            format!("SELECT {EVENT_COLUMNS} FROM chronicle_event WHERE id = $1").as_str(),
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn last_position(&self) -> Result<i64> {
        let position =
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(position), 0) FROM chronicle_event")
                .fetch_one(&self.pool)
                .await?;

        Ok(position)
    }

    async fn update_event(&self, id: Uuid, event_data: Value) -> Result<()> {
        let res = sqlx::query("UPDATE chronicle_event SET event_data = $2 WHERE id = $1")
            .bind(id)
            .bind(event_data)
            .execute(&self.pool)
            .await
            .map_err(|err| Self::refused(err, id, "update"))?;

        if res.rows_affected() == 0 {
            return Err(StoreError::EventNotFound(id));
        }

        // Reaching this point means the trigger is missing.
        Err(StoreError::Any(anyhow::anyhow!(
            "chronicle_event accepted an update of {id}, immutability trigger is not installed"
        )))
    }

    async fn delete_event(&self, id: Uuid) -> Result<()> {
        let res = sqlx::query("DELETE FROM chronicle_event WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| Self::refused(err, id, "delete"))?;

        if res.rows_affected() == 0 {
            return Err(StoreError::EventNotFound(id));
        }

        Err(StoreError::Any(anyhow::anyhow!(
            "chronicle_event accepted a delete of {id}, immutability trigger is not installed"
        )))
    }

    async fn erase(&self, id: Uuid, request: ErasureRequest) -> Result<Erasure> {
        request.check()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('chronicle.erasure', 'on', true)")
            .execute(&mut *tx)
            .await?;

        let position = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE chronicle_event SET event_data = $2, metadata = NULL
            WHERE id = $1
            RETURNING position
            "#,
        )
        .bind(id)
        .bind(erased_data())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::EventNotFound(id))?;

        let erasure = sqlx::query_as::<_, Erasure>(
            r#"
            INSERT INTO chronicle_erasure (event_id, position, reason, requested_by)
            VALUES ($1, $2, $3, $4)
            RETURNING event_id, position, reason, requested_by, erased_at
            "#,
        )
        .bind(id)
        .bind(position)
        .bind(&request.reason)
        .bind(&request.requested_by)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

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
        let erasures = sqlx::query_as::<_, Erasure>(
            r#"
            SELECT event_id, position, reason, requested_by, erased_at
            FROM chronicle_erasure
            ORDER BY erased_at ASC, position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(erasures)
    }
}
