#![forbid(unsafe_code)]

mod checkpoint;
mod config;
mod dispatcher;
mod engine;
mod error;
mod projector;
mod read_model;
mod rebuild;

pub mod projectors;
pub mod snapshot;

pub use checkpoint::*;
pub use config::*;
pub use dispatcher::{DispatchOutcome, Projections};
pub use engine::*;
pub use error::*;
pub use projector::*;
pub use read_model::{Mutation, Row, Slot};
pub use rebuild::*;
pub use snapshot::{compare, Comparison, Difference, ProjectionSnapshot, TableSnapshot};

pub use tokio_util::sync::CancellationToken;

/// Applies the SQL migrations of the event log, checkpoints and read models.
#[cfg(feature = "pg")]
pub async fn migrate(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::migrate!("../migrations").run(pool).await?;

    Ok(())
}
