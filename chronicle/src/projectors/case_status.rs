use async_trait::async_trait;
use chronicle_store::Event;
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    projector::{ApplyContext, EventFilter, Projector},
    read_model::Mutation,
};

pub const CASE_STATUS_TABLE: &str = "case_status";
pub const CASE_STATUS_COUNTS_TABLE: &str = "case_status_counts";

pub const CASE_OPEN: &str = "open";
pub const CASE_CLOSED: &str = "closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "snake_case")]
pub enum CaseEvent {
    Opened,
    StatusChanged,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseOpened {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseStatusChanged {
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseClosed {
    pub resolution: Option<String>,
}

/// Current status of every case, plus how many cases sit in each status.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseStatus;

impl CaseStatus {
    fn moved(from: Option<String>, to: &str) -> Vec<Mutation> {
        let arrived = Mutation::increment(CASE_STATUS_COUNTS_TABLE, to, "count", 1);

        match from {
            Some(from) if from == to => vec![],
            Some(from) => vec![
                Mutation::increment(CASE_STATUS_COUNTS_TABLE, from, "count", -1),
                arrived,
            ],
            None => vec![arrived],
        }
    }
}

#[async_trait]
impl Projector for CaseStatus {
    fn name(&self) -> &'static str {
        "case_status"
    }

    fn filters(&self) -> Vec<EventFilter> {
        [CaseEvent::Opened, CaseEvent::StatusChanged, CaseEvent::Closed]
            .iter()
            .map(|event| EventFilter::new("case", event.to_string()))
            .collect()
    }

    fn tables(&self) -> Vec<&'static str> {
        vec![CASE_STATUS_TABLE, CASE_STATUS_COUNTS_TABLE]
    }

    async fn apply(&self, event: &Event, ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        if event.is_erased() {
            return Ok(vec![]);
        }

        let case_id = event.aggregate_id.as_str();
        let current = ctx.get(CASE_STATUS_TABLE, case_id).await?;
        let previous = current
            .as_ref()
            .and_then(|row| row.data.get("status"))
            .and_then(|status| status.as_str())
            .map(ToOwned::to_owned);

        let (status, mut mutations) = match event.event_type.parse::<CaseEvent>()? {
            CaseEvent::Opened => {
                let data: CaseOpened = event.to_data()?;

                let row = Mutation::upsert(
                    CASE_STATUS_TABLE,
                    case_id,
                    json!({
                        "case_id": case_id,
                        "title": data.title,
                        "status": CASE_OPEN,
                        "opened_at": event.created_at,
                        "updated_at": event.created_at,
                        "closed_at": null,
                    }),
                );

                (CASE_OPEN.to_owned(), vec![row])
            }
            CaseEvent::StatusChanged => {
                let data: CaseStatusChanged = event.to_data()?;

                let row = Mutation::merge(
                    CASE_STATUS_TABLE,
                    case_id,
                    json!({
                        "case_id": case_id,
                        "status": data.status,
                        "updated_at": event.created_at,
                    }),
                );

                (data.status, vec![row])
            }
            CaseEvent::Closed => {
                let data: CaseClosed = event.to_data()?;

                let row = Mutation::merge(
                    CASE_STATUS_TABLE,
                    case_id,
                    json!({
                        "case_id": case_id,
                        "status": CASE_CLOSED,
                        "resolution": data.resolution,
                        "updated_at": event.created_at,
                        "closed_at": event.created_at,
                    }),
                );

                (CASE_CLOSED.to_owned(), vec![row])
            }
        };

        mutations.extend(Self::moved(previous, &status));

        Ok(mutations)
    }
}
