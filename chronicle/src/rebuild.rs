use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointStatus},
    dispatcher::{Batch, Projections, Registered},
    error::{ProjectionError, Result},
    projector::Projector,
    snapshot::{compare, Comparison, ProjectionSnapshot, TableSnapshot},
};

/// Report of [`Projections::verify`].
#[derive(Debug, Clone)]
pub struct Verification {
    pub projector: String,
    pub before: ProjectionSnapshot,
    pub after: ProjectionSnapshot,
    pub comparison: Comparison,
}

impl Verification {
    pub fn is_equal(&self) -> bool {
        self.comparison.equal
    }

    /// Turns a mismatch into `RebuildVerificationMismatch`.
    pub fn into_result(self) -> Result<Self> {
        if self.comparison.equal {
            return Ok(self);
        }

        Err(ProjectionError::RebuildVerificationMismatch {
            projector: self.projector,
            differences: self.comparison.differences,
        })
    }
}

impl Projections {
    /// Replays the whole log into freshly cleared tables.
    ///
    /// Holds the projector's lock and its lease for the whole run, so
    /// dispatchers of every instance report `Busy` meanwhile. `token` is
    /// checked between batches; on cancellation the checkpoint keeps the
    /// replayed cursor, is set to `paused` and [`Projections::resume_rebuild`]
    /// picks it up. A projector paused before the rebuild is paused again
    /// once it finishes.
    pub async fn rebuild(&self, name: &str, token: CancellationToken) -> Result<Checkpoint> {
        let registered = self.registered(name)?;
        let _guard = registered.lock.lock().await;

        self.engine.register(name).await?;
        self.wait_lease(name, &token).await?;

        let rebuilt = self.rebuild_leased(registered, &token, None).await;
        self.released(name, rebuilt).await
    }

    /// Continues a cancelled rebuild from its cursor without clearing tables.
    pub async fn resume_rebuild(&self, name: &str, token: CancellationToken) -> Result<Checkpoint> {
        let registered = self.registered(name)?;
        let _guard = registered.lock.lock().await;

        self.wait_lease(name, &token).await?;

        let resumed = async {
            let checkpoint = self
                .engine
                .transition(name, CheckpointStatus::Paused, CheckpointStatus::Active)
                .await?;

            info!("rebuild of {name} resumed at cursor='{}'", checkpoint.cursor);

            let checkpoint = self
                .replay(registered.projector.as_ref(), &token, None)
                .await?;

            info!("rebuild of {name} finished at cursor='{}'", checkpoint.cursor);

            Ok::<_, ProjectionError>(checkpoint)
        }
        .await;

        self.released(name, resumed).await
    }

    /// Rebuilds every projector one after the other. Stops starting new
    /// rebuilds once `token` is cancelled.
    pub async fn rebuild_all(
        &self,
        token: CancellationToken,
    ) -> Vec<(&'static str, Result<Checkpoint>)> {
        let mut outcomes = Vec::new();

        for name in self.names() {
            if token.is_cancelled() {
                break;
            }

            outcomes.push((name, self.rebuild(name, token.clone()).await));
        }

        outcomes
    }

    /// Drops the lease taken for `outcome` and reloads the checkpoint.
    async fn released(&self, name: &str, outcome: Result<Checkpoint>) -> Result<Checkpoint> {
        let released = self.engine.release(name, self.id).await;
        outcome?;
        released?;

        self.load_checkpoint(name).await
    }

    async fn rebuild_leased(
        &self,
        registered: &Registered,
        token: &CancellationToken,
        until: Option<i64>,
    ) -> Result<Checkpoint> {
        let projector = registered.projector.as_ref();
        let name = projector.name();
        let before = self.load_checkpoint(name).await?;

        self.engine.reset(name).await?;
        self.engine
            .clear(projector.tables().into_iter().map(ToOwned::to_owned).collect())
            .await?;

        info!("rebuild of {name} started");

        let checkpoint = self.replay(projector, token, until).await?;

        info!("rebuild of {name} finished at cursor='{}'", checkpoint.cursor);

        if before.status != CheckpointStatus::Paused {
            return Ok(checkpoint);
        }

        warn!("projector {name} was paused before the rebuild and stays paused");

        self.engine
            .transition(name, CheckpointStatus::Active, CheckpointStatus::Paused)
            .await
    }

    /// Applies batches from the stored cursor until the log, or `until`, is
    /// reached, renewing the lease before each batch.
    async fn replay(
        &self,
        projector: &dyn Projector,
        token: &CancellationToken,
        until: Option<i64>,
    ) -> Result<Checkpoint> {
        let name = projector.name();
        let mut cursor = self.load_checkpoint(name).await?.cursor;

        loop {
            if token.is_cancelled() {
                match self
                    .engine
                    .transition(name, CheckpointStatus::Active, CheckpointStatus::Paused)
                    .await
                {
                    Ok(_)
                    | Err(ProjectionError::InvalidTransition {
                        from: CheckpointStatus::Paused,
                        ..
                    }) => {}
                    Err(err) => return Err(err),
                }

                warn!("rebuild of {name} cancelled at cursor='{cursor}'");

                return Err(ProjectionError::Cancelled {
                    projector: name.to_owned(),
                    cursor,
                });
            }

            if !self
                .engine
                .acquire(name, self.id, self.config.lease_ttl)
                .await?
            {
                return Err(ProjectionError::Leased {
                    projector: name.to_owned(),
                });
            }

            match self.run_batch(projector, cursor, until).await? {
                Batch::Done { events: 0, .. } => break,
                Batch::Done { events, cursor: next } => {
                    debug!("replay of {name} applied events='{events}' cursor='{next}'");
                    cursor = next;
                }
                Batch::Failed { position, error } => {
                    return Err(ProjectionError::ProjectorApplyError {
                        projector: name.to_owned(),
                        position,
                        detail: error,
                    });
                }
            }
        }

        self.load_checkpoint(name).await
    }

    pub async fn snapshot<T: AsRef<str> + Sync>(
        &self,
        tables: &[T],
        sample_size: Option<usize>,
    ) -> Result<ProjectionSnapshot> {
        let mut snapshots = Vec::new();

        for table in tables {
            let table = table.as_ref();
            let rows = self.engine.rows(table).await?;

            snapshots.push(TableSnapshot::from_rows(table, &rows, sample_size));
        }

        Ok(ProjectionSnapshot::new(snapshots))
    }

    /// Catch-up to the current end of the log, snapshot, full rebuild up to
    /// the same position, second snapshot, diff.
    ///
    /// Only active projectors are verified. Nothing is reconciled; a
    /// mismatch is only reported. Use [`Verification::into_result`] to treat
    /// it as an error.
    pub async fn verify(&self, name: &str) -> Result<Verification> {
        let registered = self.registered(name)?;
        let _guard = registered.lock.lock().await;
        let token = CancellationToken::new();

        self.engine.register(name).await?;
        self.wait_lease(name, &token).await?;

        let verification = self.verify_leased(registered, &token).await;
        let released = self.engine.release(name, self.id).await;
        let verification = verification?;
        released?;

        if verification.is_equal() {
            info!("verification of {name} passed");
        } else {
            for difference in verification.comparison.differences.iter() {
                warn!("verification of {name} mismatch: {difference}");
            }
        }

        Ok(verification)
    }

    async fn verify_leased(
        &self,
        registered: &Registered,
        token: &CancellationToken,
    ) -> Result<Verification> {
        let projector = registered.projector.as_ref();
        let name = projector.name();
        let checkpoint = self.load_checkpoint(name).await?;

        if !checkpoint.is_active() {
            return Err(ProjectionError::Inactive {
                projector: name.to_owned(),
                status: checkpoint.status,
            });
        }

        let last = self.store.last_position().await?;
        let caught_up = self.replay(projector, token, Some(last)).await?;

        debug!("verification of {name} caught up to cursor='{}'", caught_up.cursor);

        let tables = projector.tables();
        let sample_size = Some(self.config.sample_size);

        let before = self.snapshot(&tables, sample_size).await?;
        self.rebuild_leased(registered, token, Some(caught_up.cursor))
            .await?;
        let after = self.snapshot(&tables, sample_size).await?;

        let comparison = compare(&before, &after);

        Ok(Verification {
            projector: name.to_owned(),
            before,
            after,
            comparison,
        })
    }
}
