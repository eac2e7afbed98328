use async_trait::async_trait;
use chronicle_store::Event;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    projector::{ApplyContext, EventFilter, Projector},
    read_model::Mutation,
};

pub const CONTACT_ACTIVITY_TABLE: &str = "contact_activity_counts";
pub const ACCOUNT_ACTIVITY_TABLE: &str = "account_activity_rollup";

pub const ACTIVITY_LOGGED: &str = "activity_logged";

const RESERVED_FIELDS: [&str; 5] = ["key", "total", "contact_id", "account_id", "last_activity_at"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogged {
    pub account_id: String,
    /// `call`, `email`, `meeting`, ...; counted under its own field.
    pub kind: String,
}

/// Activity totals per contact and their roll-up per account.
///
/// Contact rows hold `total` plus one counter per activity kind; account rows
/// hold `total`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityCounts;

#[async_trait]
impl Projector for ActivityCounts {
    fn name(&self) -> &'static str {
        "activity_counts"
    }

    fn filters(&self) -> Vec<EventFilter> {
        vec![EventFilter::new("contact", ACTIVITY_LOGGED)]
    }

    fn tables(&self) -> Vec<&'static str> {
        vec![CONTACT_ACTIVITY_TABLE, ACCOUNT_ACTIVITY_TABLE]
    }

    async fn apply(&self, event: &Event, _ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        if event.is_erased() {
            return Ok(vec![]);
        }

        let data: ActivityLogged = event.to_data()?;
        let contact_id = event.aggregate_id.as_str();

        if data.kind.is_empty() || RESERVED_FIELDS.contains(&data.kind.as_str()) {
            anyhow::bail!("invalid activity kind `{}`", data.kind);
        }

        Ok(vec![
            Mutation::merge(
                CONTACT_ACTIVITY_TABLE,
                contact_id,
                json!({
                    "contact_id": contact_id,
                    "account_id": data.account_id,
                    "last_activity_at": event.created_at,
                }),
            ),
            Mutation::increment(CONTACT_ACTIVITY_TABLE, contact_id, "total", 1),
            Mutation::increment(CONTACT_ACTIVITY_TABLE, contact_id, data.kind.as_str(), 1),
            Mutation::increment(ACCOUNT_ACTIVITY_TABLE, data.account_id.as_str(), "total", 1),
        ])
    }
}
