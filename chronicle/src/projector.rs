use async_trait::async_trait;
use chronicle_store::Event;
use glob_match::glob_match;

use crate::{
    engine::Engine,
    error::{ProjectionError, Result},
    read_model::{Mutation, Row},
};

/// Selects events by aggregate type and event type.
///
/// `event_type` is a glob matched against the event type, so
/// `EventFilter::new("case", "*")` selects every case event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub aggregate_type: String,
    pub event_type: String,
}

impl EventFilter {
    pub fn new(aggregate_type: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
        }
    }

    pub fn all(aggregate_type: impl Into<String>) -> Self {
        Self::new(aggregate_type, "*")
    }

    pub fn matches(&self, event: &Event) -> bool {
        glob_match(
            &format!("{}/{}", self.aggregate_type, self.event_type),
            &event.topic(),
        )
    }
}

/// Derives read-model tables from the event log.
///
/// `apply` must be a pure function of the event and of the projector's own
/// tables: rebuilding from position 1 has to land on the same rows as
/// incremental dispatch did.
#[async_trait]
pub trait Projector: Send + Sync {
    fn name(&self) -> &'static str;

    fn filters(&self) -> Vec<EventFilter>;

    /// Tables this projector owns. Nothing else may write them.
    fn tables(&self) -> Vec<&'static str>;

    async fn apply(&self, event: &Event, ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>>;
}

pub(crate) fn accepts(projector: &dyn Projector, event: &Event) -> bool {
    projector
        .filters()
        .iter()
        .any(|filter| filter.matches(event))
}

/// Read access to the tables of the projector being applied.
pub struct ApplyContext<'a> {
    projector: &'static str,
    tables: Vec<&'static str>,
    engine: &'a dyn Engine,
}

impl<'a> ApplyContext<'a> {
    pub(crate) fn new(projector: &dyn Projector, engine: &'a dyn Engine) -> Self {
        Self {
            projector: projector.name(),
            tables: projector.tables(),
            engine,
        }
    }

    pub fn projector(&self) -> &'static str {
        self.projector
    }

    pub async fn get(&self, table: &str, key: &str) -> Result<Option<Row>> {
        self.owned(table)?;

        self.engine.row(table, key).await
    }

    pub async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        self.owned(table)?;

        self.engine.rows(table).await
    }

    pub(crate) fn owned(&self, table: &str) -> Result<()> {
        if self.tables.iter().any(|owned| *owned == table) {
            return Ok(());
        }

        Err(ProjectionError::UnownedTable {
            projector: self.projector.to_owned(),
            table: table.to_owned(),
        })
    }
}
