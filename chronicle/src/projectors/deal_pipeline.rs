use async_trait::async_trait;
use chronicle_store::Event;
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    projector::{ApplyContext, EventFilter, Projector},
    read_model::Mutation,
};

pub const DEAL_PIPELINE_TABLE: &str = "deal_pipeline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "snake_case")]
pub enum DealEvent {
    Created,
    StageChanged,
    ProcessChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealCreated {
    pub name: String,
    pub stage: String,
    pub process: Option<String>,
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealStageChanged {
    pub stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealProcessChanged {
    pub process: String,
}

/// One row per deal with its pipeline stage and process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DealPipeline;

#[async_trait]
impl Projector for DealPipeline {
    fn name(&self) -> &'static str {
        "deal_pipeline"
    }

    fn filters(&self) -> Vec<EventFilter> {
        vec![
            EventFilter::new("deal", DealEvent::Created.to_string()),
            EventFilter::new("deal", DealEvent::StageChanged.to_string()),
            EventFilter::new("deal", DealEvent::ProcessChanged.to_string()),
        ]
    }

    fn tables(&self) -> Vec<&'static str> {
        vec![DEAL_PIPELINE_TABLE]
    }

    async fn apply(&self, event: &Event, _ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        if event.is_erased() {
            return Ok(vec![]);
        }

        let deal_id = event.aggregate_id.as_str();

        let mutation = match event.event_type.parse::<DealEvent>()? {
            DealEvent::Created => {
                let data: DealCreated = event.to_data()?;

                Mutation::upsert(
                    DEAL_PIPELINE_TABLE,
                    deal_id,
                    json!({
                        "deal_id": deal_id,
                        "name": data.name,
                        "stage": data.stage,
                        "process": data.process,
                        "amount": data.amount,
                        "stage_entered_at": event.created_at,
                        "updated_at": event.created_at,
                    }),
                )
            }
            DealEvent::StageChanged => {
                let data: DealStageChanged = event.to_data()?;

                Mutation::merge(
                    DEAL_PIPELINE_TABLE,
                    deal_id,
                    json!({
                        "deal_id": deal_id,
                        "stage": data.stage,
                        "stage_entered_at": event.created_at,
                        "updated_at": event.created_at,
                    }),
                )
            }
            DealEvent::ProcessChanged => {
                let data: DealProcessChanged = event.to_data()?;

                Mutation::merge(
                    DEAL_PIPELINE_TABLE,
                    deal_id,
                    json!({
                        "deal_id": deal_id,
                        "process": data.process,
                        "updated_at": event.created_at,
                    }),
                )
            }
        };

        Ok(vec![mutation])
    }
}
