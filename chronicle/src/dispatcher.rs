use chronicle_store::{Event, Store};
use futures_util::future::join_all;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval_at, sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    checkpoint::{Checkpoint, CheckpointStatus},
    config::ProjectionConfig,
    engine::Engine,
    error::{ProjectionError, Result},
    projector::{accepts, ApplyContext, Projector},
    read_model::Row,
};

/// What one call to [`Projections::dispatch`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// `events` were read, the checkpoint now sits at `cursor`.
    Processed { events: usize, cursor: i64 },
    /// The checkpoint is paused or in error.
    Skipped(CheckpointStatus),
    /// A rebuild, a reset or another instance holds the projector.
    Busy,
    /// `apply` failed on the event at `position`; the checkpoint is in error.
    Failed { position: i64, error: String },
}

pub(crate) enum Batch {
    Done { events: usize, cursor: i64 },
    Failed { position: i64, error: String },
}

#[derive(Clone)]
pub(crate) struct Registered {
    pub(crate) projector: Arc<dyn Projector>,
    pub(crate) lock: Arc<Mutex<()>>,
}

/// The set of projectors fed from one store, with their checkpoints and tables.
///
/// Every instance owns a random id under which it leases checkpoints, so
/// instances in other processes sharing the engine keep out of each other's
/// way. Clones share the id.
#[derive(Clone)]
pub struct Projections {
    pub(crate) id: Uuid,
    pub(crate) store: Store,
    pub(crate) engine: Box<dyn Engine>,
    pub(crate) projectors: BTreeMap<&'static str, Registered>,
    pub(crate) config: ProjectionConfig,
}

impl Projections {
    pub fn new<E: Engine + 'static>(store: &Store, engine: E) -> Self {
        Self {
            id: Uuid::new_v4(),
            store: store.clone(),
            engine: Box::new(engine),
            projectors: BTreeMap::new(),
            config: ProjectionConfig::default(),
        }
    }

    pub fn config(mut self, config: ProjectionConfig) -> Self {
        self.config = config;

        self
    }

    /// Registers a projector. A table may only be owned by one projector,
    /// so claiming a table of another registered projector fails with
    /// `TableClaimed`. A projector with the same name is replaced.
    pub fn projector<P: Projector + 'static>(mut self, projector: P) -> Result<Self> {
        let name = projector.name();

        for table in projector.tables() {
            let owner = self.projectors.iter().find(|(other, registered)| {
                **other != name && registered.projector.tables().contains(&table)
            });

            if let Some((owner, _)) = owner {
                return Err(ProjectionError::TableClaimed {
                    table: table.to_owned(),
                    owner: (*owner).to_owned(),
                    claimant: name.to_owned(),
                });
            }
        }

        if self.projectors.contains_key(name) {
            warn!("projector {name} registered twice, keeping the last one");
        }

        self.projectors.insert(
            name,
            Registered {
                projector: Arc::new(projector),
                lock: Arc::default(),
            },
        );

        Ok(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.projectors.keys().copied().collect()
    }

    pub fn tables(&self, name: &str) -> Result<Vec<&'static str>> {
        Ok(self.registered(name)?.projector.tables())
    }

    pub(crate) fn registered(&self, name: &str) -> Result<&Registered> {
        self.projectors
            .get(name)
            .ok_or_else(|| ProjectionError::ProjectorNotFound(name.to_owned()))
    }

    pub(crate) async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint> {
        self.engine
            .checkpoint(name)
            .await?
            .ok_or_else(|| ProjectionError::CheckpointNotFound(name.to_owned()))
    }

    /// Registers the checkpoint of every projector. Existing ones are kept.
    pub async fn init(&self) -> Result<Vec<Checkpoint>> {
        let futures = self
            .projectors
            .keys()
            .map(|name| self.engine.register(name));

        join_all(futures).await.into_iter().collect()
    }

    /// Feeds one batch of events after the cursor to the projector.
    pub async fn dispatch(&self, name: &str) -> Result<DispatchOutcome> {
        let registered = self.registered(name)?;

        let Ok(_guard) = registered.lock.try_lock() else {
            debug!("projector {name} is locked, skip");

            return Ok(DispatchOutcome::Busy);
        };

        let checkpoint = self.load_checkpoint(name).await?;

        if !checkpoint.is_active() {
            debug!("projector {name} is {}, skip", checkpoint.status);

            return Ok(DispatchOutcome::Skipped(checkpoint.status));
        }

        if checkpoint.cursor >= self.store.last_position().await? {
            return Ok(DispatchOutcome::Processed {
                events: 0,
                cursor: checkpoint.cursor,
            });
        }

        if !self
            .engine
            .acquire(name, self.id, self.config.lease_ttl)
            .await?
        {
            debug!("projector {name} is leased by another instance, skip");

            return Ok(DispatchOutcome::Busy);
        }

        let outcome = self.dispatch_leased(registered.projector.as_ref()).await;
        let released = self.engine.release(name, self.id).await;

        let outcome = match outcome {
            Err(ProjectionError::Leased { .. }) => DispatchOutcome::Busy,
            outcome => outcome?,
        };
        released?;

        Ok(outcome)
    }

    async fn dispatch_leased(&self, projector: &dyn Projector) -> Result<DispatchOutcome> {
        let checkpoint = self.load_checkpoint(projector.name()).await?;

        if !checkpoint.is_active() {
            return Ok(DispatchOutcome::Skipped(checkpoint.status));
        }

        let outcome = match self.run_batch(projector, checkpoint.cursor, None).await? {
            Batch::Done { events, cursor } => DispatchOutcome::Processed { events, cursor },
            Batch::Failed { position, error } => DispatchOutcome::Failed { position, error },
        };

        Ok(outcome)
    }

    /// Waits until this instance holds the lease of `name`. Gives up with
    /// `Leased` once `token` is cancelled.
    pub(crate) async fn wait_lease(&self, name: &str, token: &CancellationToken) -> Result<()> {
        let mut waiting = false;

        loop {
            if self
                .engine
                .acquire(name, self.id, self.config.lease_ttl)
                .await?
            {
                return Ok(());
            }

            if !waiting {
                info!("projector {name} is leased by another instance, waiting");
                waiting = true;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(ProjectionError::Leased {
                        projector: name.to_owned(),
                    });
                }
                _ = sleep(self.config.poll_interval.max(Duration::from_millis(1))) => {}
            }
        }
    }

    pub async fn dispatch_all(&self) -> Vec<(&'static str, Result<DispatchOutcome>)> {
        let futures = self
            .projectors
            .keys()
            .map(|name| async move { (*name, self.dispatch(name).await) });

        join_all(futures).await
    }

    /// Dispatches until the projector has nothing left to read or stops.
    pub async fn catch_up(&self, name: &str) -> Result<Checkpoint> {
        loop {
            match self.dispatch(name).await? {
                DispatchOutcome::Processed { events, .. } if events > 0 => continue,
                _ => break,
            }
        }

        self.load_checkpoint(name).await
    }

    pub async fn catch_up_all(&self) -> Result<Vec<Checkpoint>> {
        let futures = self.projectors.keys().map(|name| self.catch_up(name));

        join_all(futures).await.into_iter().collect()
    }

    /// Spawns one dispatcher task per projector, polling until `token` is
    /// cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        self.init().await?;

        Ok(self
            .projectors
            .keys()
            .map(|name| self.spawn(*name, token.clone()))
            .collect())
    }

    fn spawn(&self, name: &'static str, token: CancellationToken) -> JoinHandle<()> {
        let projections = self.clone();
        let batch_size = usize::from(self.config.batch_size);
        let delay = self.config.start_delay;
        let poll_interval = self.config.poll_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            if !delay.is_zero() {
                info!("wait {delay:?} to start {name}");

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }

            info!("{name} started");

            let mut interval = interval_at(Instant::now(), poll_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                loop {
                    match projections.dispatch(name).await {
                        Ok(DispatchOutcome::Processed { events, cursor }) if events > 0 => {
                            debug!("{name} processed events='{events}' cursor='{cursor}'");

                            if events < batch_size || token.is_cancelled() {
                                break;
                            }
                        }
                        Ok(_) => break,
                        Err(e) => {
                            error!("{name} {e}");
                            break;
                        }
                    }
                }
            }

            info!("{name} stopped");
        })
    }

    /// Applies up to one batch of events after `cursor`, none past `until`.
    ///
    /// Events the projector does not subscribe to still move the cursor.
    /// The caller holds the lease of the projector.
    pub(crate) async fn run_batch(
        &self,
        projector: &dyn Projector,
        cursor: i64,
        until: Option<i64>,
    ) -> Result<Batch> {
        let name = projector.name();
        let mut events = self.store.read(cursor, self.config.batch_size, None).await?;

        if let Some(until) = until {
            events.retain(|event| event.position <= until);
        }

        let mut skipped = None;

        for event in events.iter() {
            if !accepts(projector, event) {
                skipped = Some(event.position);
                continue;
            }

            match self.apply_event(projector, event).await {
                Ok(()) => skipped = None,
                Err(ProjectionError::ProjectorApplyError { detail, .. }) => {
                    if let Some(position) = skipped {
                        self.engine.commit(name, self.id, position, vec![]).await?;
                    }

                    error!(
                        "projector {name} failed position='{}' id='{}' topic='{}': {detail}",
                        event.position,
                        event.id,
                        event.topic()
                    );

                    self.engine
                        .fail(name, self.id, event.position, &detail)
                        .await?;

                    return Ok(Batch::Failed {
                        position: event.position,
                        error: detail,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(position) = skipped {
            self.engine.commit(name, self.id, position, vec![]).await?;
        }

        Ok(Batch::Done {
            events: events.len(),
            cursor: events.last().map(|e| e.position).unwrap_or(cursor),
        })
    }

    async fn apply_event(&self, projector: &dyn Projector, event: &Event) -> Result<()> {
        let name = projector.name();
        let failed = |detail: String| ProjectionError::ProjectorApplyError {
            projector: name.to_owned(),
            position: event.position,
            detail,
        };

        let ctx = ApplyContext::new(projector, &*self.engine);
        let mutations = projector
            .apply(event, &ctx)
            .await
            .map_err(|err| failed(format!("{err:#}")))?;

        for mutation in mutations.iter() {
            ctx.owned(mutation.table())
                .and_then(|_| mutation.check())
                .map_err(|err| failed(err.to_string()))?;
        }

        let count = mutations.len();

        match self
            .engine
            .commit(name, self.id, event.position, mutations)
            .await
        {
            Ok(()) => {}
            Err(ProjectionError::InvalidMutation(detail)) => return Err(failed(detail)),
            Err(err) => return Err(err),
        }

        debug!(
            "projector {name} applied position='{}' id='{}' topic='{}' mutations='{count}'",
            event.position,
            event.id,
            event.topic()
        );

        Ok(())
    }

    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.engine.checkpoints().await
    }

    pub async fn checkpoint(&self, name: &str) -> Result<Checkpoint> {
        self.load_checkpoint(name).await
    }

    /// `active -> paused`. The running dispatcher stops at its next poll.
    pub async fn pause(&self, name: &str) -> Result<Checkpoint> {
        self.transition(name, CheckpointStatus::Active, CheckpointStatus::Paused)
            .await
    }

    /// `paused -> active`, continuing from the stored cursor.
    pub async fn resume(&self, name: &str) -> Result<Checkpoint> {
        self.transition(name, CheckpointStatus::Paused, CheckpointStatus::Active)
            .await
    }

    /// Back to cursor 0 / active from any status. Tables are kept; replayed
    /// events are skipped row by row until the cursor passes them.
    ///
    /// Waits for a rebuild running in another instance to finish.
    pub async fn reset(&self, name: &str) -> Result<Checkpoint> {
        let registered = self.registered(name)?;
        let _guard = registered.lock.lock().await;

        self.wait_lease(name, &CancellationToken::new()).await?;

        let reset = self.engine.reset(name).await;
        let released = self.engine.release(name, self.id).await;
        reset?;
        released?;

        info!("projector {name} reset to cursor 0");

        self.load_checkpoint(name).await
    }

    async fn transition(
        &self,
        name: &str,
        from: CheckpointStatus,
        to: CheckpointStatus,
    ) -> Result<Checkpoint> {
        self.registered(name)?;

        if !from.can_become(to) {
            return Err(ProjectionError::InvalidTransition {
                projector: name.to_owned(),
                from,
                to,
            });
        }

        let checkpoint = self.engine.transition(name, from, to).await?;

        info!("projector {name} {from} -> {to}");

        Ok(checkpoint)
    }

    pub async fn row(&self, table: &str, key: &str) -> Result<Option<Row>> {
        self.engine.row(table, key).await
    }

    pub async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        self.engine.rows(table).await
    }
}
