//! Read models maintained by this crate.

mod activity_counts;
mod case_status;
mod deal_pipeline;

pub use activity_counts::*;
pub use case_status::*;
pub use deal_pipeline::*;

use crate::{dispatcher::Projections, error::Result};

/// Adds every projector of this module.
pub fn install(projections: Projections) -> Result<Projections> {
    projections
        .projector(CaseStatus)?
        .projector(DealPipeline)?
        .projector(ActivityCounts)
}
