use anyhow::bail;
use async_trait::async_trait;
use chronicle::{
    compare,
    projectors::{
        self, ActivityCounts, CaseStatus, DealEvent, DealPipeline, ACCOUNT_ACTIVITY_TABLE,
        ACTIVITY_LOGGED, CASE_OPEN, CASE_STATUS_COUNTS_TABLE, CASE_STATUS_TABLE,
        CONTACT_ACTIVITY_TABLE, DEAL_PIPELINE_TABLE,
    },
    ApplyContext, CancellationToken, CheckpointStatus, ConfigBuilder, DispatchOutcome,
    EventFilter, Mutation, ProjectionError, Projections, Projector,
};
use chronicle_store::{AppendRequest, Event, Store};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;
use uuid::Uuid;

pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

async fn append(
    store: &Store,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: impl ToString,
    data: Value,
) -> anyhow::Result<Event> {
    let request = AppendRequest::new(aggregate_type, aggregate_id, event_type.to_string())
        .data(data)?
        .actor("user", Some("tester"));

    Ok(store.append(request).await?)
}

async fn count(projections: &Projections, table: &str, key: &str, field: &str) -> anyhow::Result<i64> {
    Ok(projections
        .row(table, key)
        .await?
        .map(|row| row.count(field))
        .unwrap_or(0))
}

/// Counts ledger entries per ledger and refuses `rejected` entries.
pub struct FussyLedger;

#[async_trait]
impl Projector for FussyLedger {
    fn name(&self) -> &'static str {
        "fussy_ledger"
    }

    fn filters(&self) -> Vec<EventFilter> {
        vec![EventFilter::all("ledger")]
    }

    fn tables(&self) -> Vec<&'static str> {
        vec!["fussy_ledger"]
    }

    async fn apply(&self, event: &Event, _ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        if event.event_type == "rejected" {
            bail!("ledger entry {} rejected", event.aggregate_id);
        }

        Ok(vec![Mutation::increment(
            "fussy_ledger",
            event.aggregate_id.as_str(),
            "entries",
            1,
        )])
    }
}

pub struct LedgerTally;

#[async_trait]
impl Projector for LedgerTally {
    fn name(&self) -> &'static str {
        "ledger_tally"
    }

    fn filters(&self) -> Vec<EventFilter> {
        vec![EventFilter::all("ledger")]
    }

    fn tables(&self) -> Vec<&'static str> {
        vec!["ledger_tally"]
    }

    async fn apply(&self, event: &Event, _ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        Ok(vec![Mutation::increment(
            "ledger_tally",
            event.aggregate_id.as_str(),
            "entries",
            1,
        )])
    }
}

/// Writes into a table owned by another projector.
pub struct Trespasser;

#[async_trait]
impl Projector for Trespasser {
    fn name(&self) -> &'static str {
        "trespasser"
    }

    fn filters(&self) -> Vec<EventFilter> {
        vec![EventFilter::new("parcel", "trespassed")]
    }

    fn tables(&self) -> Vec<&'static str> {
        vec!["trespasser"]
    }

    async fn apply(&self, event: &Event, _ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        Ok(vec![
            Mutation::increment("trespasser", event.aggregate_id.as_str(), "seen", 1),
            Mutation::increment(CASE_STATUS_COUNTS_TABLE, CASE_OPEN, "count", 100),
        ])
    }
}

/// Cancels `token` once the wrapped projector applied an event.
pub struct Tripwire<P> {
    pub inner: P,
    pub token: CancellationToken,
}

#[async_trait]
impl<P: Projector> Projector for Tripwire<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn filters(&self) -> Vec<EventFilter> {
        self.inner.filters()
    }

    fn tables(&self) -> Vec<&'static str> {
        self.inner.tables()
    }

    async fn apply(&self, event: &Event, ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        let mutations = self.inner.apply(event, ctx).await?;
        self.token.cancel();

        Ok(mutations)
    }
}

/// Claims the counts table of `case_status`.
pub struct Squatter;

#[async_trait]
impl Projector for Squatter {
    fn name(&self) -> &'static str {
        "squatter"
    }

    fn filters(&self) -> Vec<EventFilter> {
        vec![EventFilter::new("case", "opened")]
    }

    fn tables(&self) -> Vec<&'static str> {
        vec![CASE_STATUS_COUNTS_TABLE]
    }

    async fn apply(&self, _event: &Event, _ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        Ok(vec![])
    }
}

/// Holds the first event it applies until `release` is notified.
pub struct Gate<P> {
    pub inner: P,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
    pub armed: AtomicBool,
}

#[async_trait]
impl<P: Projector> Projector for Gate<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn filters(&self) -> Vec<EventFilter> {
        self.inner.filters()
    }

    fn tables(&self) -> Vec<&'static str> {
        self.inner.tables()
    }

    async fn apply(&self, event: &Event, ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        self.inner.apply(event, ctx).await
    }
}

/// An outdated `deal_pipeline` that ignores stage changes.
pub struct StaleDealPipeline;

#[async_trait]
impl Projector for StaleDealPipeline {
    fn name(&self) -> &'static str {
        DealPipeline.name()
    }

    fn filters(&self) -> Vec<EventFilter> {
        DealPipeline.filters()
    }

    fn tables(&self) -> Vec<&'static str> {
        DealPipeline.tables()
    }

    async fn apply(&self, event: &Event, ctx: &ApplyContext<'_>) -> anyhow::Result<Vec<Mutation>> {
        if event.event_type == DealEvent::StageChanged.to_string() {
            return Ok(vec![]);
        }

        DealPipeline.apply(event, ctx).await
    }
}

pub async fn test_fresh_checkpoints(projections: Projections) -> anyhow::Result<()> {
    let projections = projectors::install(projections)?;
    let checkpoints = projections.init().await?;

    let names = checkpoints
        .iter()
        .map(|c| c.projector_name.as_str())
        .collect::<Vec<_>>();

    assert_eq!(names, vec!["activity_counts", "case_status", "deal_pipeline"]);

    for checkpoint in checkpoints.iter() {
        assert_eq!(checkpoint.cursor, 0);
        assert_eq!(checkpoint.status, CheckpointStatus::Active);
        assert_eq!(checkpoint.last_error, None);
        assert_eq!(checkpoint.error_position, None);
    }

    assert_eq!(projections.init().await?, checkpoints);
    assert_eq!(projections.checkpoints().await?, checkpoints);

    Ok(())
}

pub async fn test_dispatch(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projectors::install(projections)?;
    projections.init().await?;

    let case_id = unique("case");
    let deal_id = unique("deal");
    let account_id = unique("account");
    let contact_id = unique("contact");

    let open_before = count(&projections, CASE_STATUS_COUNTS_TABLE, CASE_OPEN, "count").await?;
    let triaged_before = count(&projections, CASE_STATUS_COUNTS_TABLE, "triaged", "count").await?;

    append(store, "case", &case_id, "opened", json!({"title": "Broken heating"})).await?;
    append(store, "case", &case_id, "note_added", json!({"note": "tenant called"})).await?;
    append(store, "case", &case_id, "status_changed", json!({"status": "triaged"})).await?;
    append(
        store,
        "deal",
        &deal_id,
        DealEvent::Created,
        json!({"name": "Roof repair", "stage": "lead", "process": "standard", "amount": 1200}),
    )
    .await?;
    append(store, "deal", &deal_id, DealEvent::StageChanged, json!({"stage": "proposal"})).await?;

    for kind in ["call", "call", "email"] {
        append(
            store,
            "contact",
            &contact_id,
            ACTIVITY_LOGGED,
            json!({"account_id": account_id, "kind": kind}),
        )
        .await?;
    }

    let outcomes = projections.dispatch_all().await;
    assert_eq!(outcomes.len(), 3);

    for (name, outcome) in outcomes {
        assert!(
            matches!(outcome, Ok(DispatchOutcome::Processed { events, .. }) if events > 0),
            "{name} did not process"
        );
    }

    projections.catch_up_all().await?;

    let case = projections
        .row(CASE_STATUS_TABLE, &case_id)
        .await?
        .expect("case row");
    assert_eq!(case.data["status"], "triaged");
    assert_eq!(case.data["title"], "Broken heating");

    assert_eq!(
        count(&projections, CASE_STATUS_COUNTS_TABLE, CASE_OPEN, "count").await?,
        open_before
    );
    assert_eq!(
        count(&projections, CASE_STATUS_COUNTS_TABLE, "triaged", "count").await?,
        triaged_before + 1
    );

    let deal = projections
        .row(DEAL_PIPELINE_TABLE, &deal_id)
        .await?
        .expect("deal row");
    assert_eq!(deal.data["stage"], "proposal");
    assert_eq!(deal.data["process"], "standard");
    assert_eq!(deal.data["amount"], 1200);

    assert_eq!(count(&projections, CONTACT_ACTIVITY_TABLE, &contact_id, "total").await?, 3);
    assert_eq!(count(&projections, CONTACT_ACTIVITY_TABLE, &contact_id, "call").await?, 2);
    assert_eq!(count(&projections, CONTACT_ACTIVITY_TABLE, &contact_id, "email").await?, 1);
    assert_eq!(count(&projections, ACCOUNT_ACTIVITY_TABLE, &account_id, "total").await?, 3);

    let last = store.last_position().await?;

    for name in projections.names() {
        let checkpoint = projections.checkpoint(name).await?;

        assert_eq!(checkpoint.cursor, last, "{name} cursor");
        assert_eq!(checkpoint.status, CheckpointStatus::Active);
    }

    Ok(())
}

pub async fn test_idempotent_replay(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projectors::install(projections)?;
    projections.init().await?;

    let case_id = unique("case");
    append(store, "case", &case_id, "opened", json!({"title": "Leaking tap"})).await?;
    append(store, "case", &case_id, "status_changed", json!({"status": "waiting"})).await?;
    append(store, "case", &case_id, "closed", json!({"resolution": "fixed"})).await?;

    let applied = projections.catch_up("case_status").await?;
    let tables = projections.tables("case_status")?;
    let before = projections.snapshot(&tables, None).await?;

    let reset = projections.reset("case_status").await?;
    assert_eq!(reset.cursor, 0);
    assert_eq!(reset.status, CheckpointStatus::Active);

    let replayed = projections.catch_up("case_status").await?;
    let after = projections.snapshot(&tables, None).await?;

    assert_eq!(replayed.cursor, applied.cursor);
    assert!(compare(&before, &after).equal);

    let case = projections
        .row(CASE_STATUS_TABLE, &case_id)
        .await?
        .expect("case row");
    assert_eq!(case.data["status"], "closed");
    assert_eq!(case.data["resolution"], "fixed");

    Ok(())
}

pub async fn test_rebuild_matches(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projectors::install(projections)?;
    projections.init().await?;

    let account_id = unique("account");

    for i in 0..4 {
        let case_id = unique("case");
        append(store, "case", &case_id, "opened", json!({"title": format!("Case {i}")})).await?;

        if i % 2 == 0 {
            append(store, "case", &case_id, "closed", json!({})).await?;
        }

        append(
            store,
            "contact",
            &unique("contact"),
            ACTIVITY_LOGGED,
            json!({"account_id": account_id, "kind": "meeting"}),
        )
        .await?;
    }

    projections.catch_up_all().await?;

    for name in projections.names() {
        let verification = projections.verify(name).await?;

        assert!(verification.is_equal(), "{name}: {:?}", verification.comparison);
        assert_eq!(verification.before.tables.len(), projections.tables(name)?.len());

        let verification = verification.into_result()?;
        assert_eq!(verification.before.tables, verification.after.tables);
    }

    let outcomes = projections.rebuild_all(CancellationToken::new()).await;
    assert_eq!(outcomes.len(), 3);

    let last = store.last_position().await?;

    for (name, outcome) in outcomes {
        let checkpoint = outcome?;

        assert_eq!(checkpoint.cursor, last, "{name} cursor");
        assert_eq!(checkpoint.status, CheckpointStatus::Active);
    }

    Ok(())
}

pub async fn test_verify_detects_drift(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let stale = projections.clone().projector(StaleDealPipeline)?;
    stale.init().await?;
    stale.catch_up("deal_pipeline").await?;

    let deal_id = unique("deal");
    append(
        store,
        "deal",
        &deal_id,
        DealEvent::Created,
        json!({"name": "Solar panels", "stage": "lead"}),
    )
    .await?;
    append(store, "deal", &deal_id, DealEvent::StageChanged, json!({"stage": "won"})).await?;
    stale.catch_up("deal_pipeline").await?;

    let row = stale.row(DEAL_PIPELINE_TABLE, &deal_id).await?.expect("deal row");
    assert_eq!(row.data["stage"], "lead");

    let current = projections.projector(DealPipeline)?;
    let verification = current.verify("deal_pipeline").await?;

    assert!(!verification.is_equal());
    assert_eq!(verification.comparison.differences.len(), 1);
    assert_eq!(verification.comparison.differences[0].table(), DEAL_PIPELINE_TABLE);

    let err = verification.into_result().unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::RebuildVerificationMismatch { ref projector, ref differences }
            if projector == "deal_pipeline" && differences.len() == 1
    ));

    let row = current.row(DEAL_PIPELINE_TABLE, &deal_id).await?.expect("deal row");
    assert_eq!(row.data["stage"], "won");

    Ok(())
}

pub async fn test_failure_isolation(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projections.projector(FussyLedger)?.projector(LedgerTally)?;
    projections.init().await?;

    let ledger_id = unique("ledger");
    let posted = append(store, "ledger", &ledger_id, "posted", json!({"amount": 10})).await?;
    let rejected = append(store, "ledger", &ledger_id, "rejected", json!({"amount": -5})).await?;
    let last = append(store, "ledger", &ledger_id, "posted", json!({"amount": 7})).await?;

    projections.catch_up_all().await?;

    let fussy = projections.checkpoint("fussy_ledger").await?;
    assert_eq!(fussy.status, CheckpointStatus::Error);
    assert_eq!(fussy.cursor, posted.position);
    assert_eq!(fussy.error_position, Some(rejected.position));
    assert!(fussy
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains(&format!("ledger entry {ledger_id} rejected"))));
    assert_eq!(count(&projections, "fussy_ledger", &ledger_id, "entries").await?, 1);

    let tally = projections.checkpoint("ledger_tally").await?;
    assert_eq!(tally.status, CheckpointStatus::Active);
    assert_eq!(tally.cursor, last.position);
    assert_eq!(count(&projections, "ledger_tally", &ledger_id, "entries").await?, 3);

    assert_eq!(
        projections.dispatch("fussy_ledger").await?,
        DispatchOutcome::Skipped(CheckpointStatus::Error)
    );

    let err = projections.resume("fussy_ledger").await.unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::InvalidTransition {
            from: CheckpointStatus::Error,
            to: CheckpointStatus::Active,
            ..
        }
    ));

    let err = projections.pause("fussy_ledger").await.unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::InvalidTransition {
            from: CheckpointStatus::Error,
            ..
        }
    ));

    let reset = projections.reset("fussy_ledger").await?;
    assert_eq!(reset.cursor, 0);
    assert_eq!(reset.status, CheckpointStatus::Active);
    assert_eq!(reset.last_error, None);

    let again = projections.catch_up("fussy_ledger").await?;
    assert_eq!(again.status, CheckpointStatus::Error);
    assert_eq!(again.error_position, Some(rejected.position));
    assert_eq!(count(&projections, "fussy_ledger", &ledger_id, "entries").await?, 1);

    let err = projections
        .rebuild("fussy_ledger", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::ProjectorApplyError { position, .. } if position == rejected.position
    ));

    assert!(matches!(
        projections.dispatch("unknown").await,
        Err(ProjectionError::ProjectorNotFound(_))
    ));

    Ok(())
}

pub async fn test_unowned_table(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projections.projector(Trespasser)?;
    projections.init().await?;

    let parcel_id = unique("parcel");
    let event = append(store, "parcel", &parcel_id, "trespassed", json!({})).await?;

    let checkpoint = projections.catch_up("trespasser").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Error);
    assert_eq!(checkpoint.error_position, Some(event.position));
    assert!(checkpoint
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("does not own table case_status_counts")));
    assert_eq!(count(&projections, "trespasser", &parcel_id, "seen").await?, 0);

    Ok(())
}

pub async fn test_pause_resume(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projections.projector(DealPipeline)?;
    projections.init().await?;
    projections.catch_up("deal_pipeline").await?;

    let paused = projections.pause("deal_pipeline").await?;
    assert_eq!(paused.status, CheckpointStatus::Paused);

    let err = projections.pause("deal_pipeline").await.unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::InvalidTransition {
            from: CheckpointStatus::Paused,
            ..
        }
    ));

    let deal_id = unique("deal");
    append(
        store,
        "deal",
        &deal_id,
        DealEvent::Created,
        json!({"name": "Boiler", "stage": "lead", "process": "fast"}),
    )
    .await?;
    append(store, "deal", &deal_id, DealEvent::ProcessChanged, json!({"process": "standard"})).await?;

    assert_eq!(
        projections.dispatch("deal_pipeline").await?,
        DispatchOutcome::Skipped(CheckpointStatus::Paused)
    );
    assert!(projections.row(DEAL_PIPELINE_TABLE, &deal_id).await?.is_none());
    assert_eq!(projections.checkpoint("deal_pipeline").await?.cursor, paused.cursor);

    let resumed = projections.resume("deal_pipeline").await?;
    assert_eq!(resumed.status, CheckpointStatus::Active);
    assert_eq!(resumed.cursor, paused.cursor);

    let caught_up = projections.catch_up("deal_pipeline").await?;
    assert_eq!(caught_up.cursor, store.last_position().await?);

    let row = projections
        .row(DEAL_PIPELINE_TABLE, &deal_id)
        .await?
        .expect("deal row");
    assert_eq!(row.data["process"], "standard");
    assert_eq!(row.data["stage"], "lead");

    let err = projections.resume("deal_pipeline").await.unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::InvalidTransition {
            from: CheckpointStatus::Active,
            to: CheckpointStatus::Active,
            ..
        }
    ));

    projections.pause("deal_pipeline").await?;

    let rebuilt = projections
        .rebuild("deal_pipeline", CancellationToken::new())
        .await?;
    assert_eq!(rebuilt.status, CheckpointStatus::Paused);
    assert_eq!(rebuilt.cursor, store.last_position().await?);
    assert_eq!(rebuilt.leased_by, None);

    let row = projections
        .row(DEAL_PIPELINE_TABLE, &deal_id)
        .await?
        .expect("deal row");
    assert_eq!(row.data["process"], "standard");

    projections.resume("deal_pipeline").await?;

    Ok(())
}

pub async fn test_cancelled_rebuild(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projections
        .config(ConfigBuilder::new().batch_size(2).build())
        .projector(ActivityCounts)?;
    projections.init().await?;

    let account_id = unique("account");

    for i in 0..6 {
        let kind = if i % 2 == 0 { "call" } else { "email" };

        append(
            store,
            "contact",
            &format!("{account_id}-contact-{}", i % 3),
            ACTIVITY_LOGGED,
            json!({"account_id": account_id, "kind": kind}),
        )
        .await?;
    }

    projections.catch_up("activity_counts").await?;

    let tables = projections.tables("activity_counts")?;
    let before = projections.snapshot(&tables, Some(3)).await?;
    let last = store.last_position().await?;

    let token = CancellationToken::new();
    let tripped = projections.clone().projector(Tripwire {
        inner: ActivityCounts,
        token: token.clone(),
    })?;

    let err = tripped
        .rebuild("activity_counts", token.clone())
        .await
        .unwrap_err();

    let ProjectionError::Cancelled { projector, cursor } = err else {
        bail!("expected a cancelled rebuild, got {err}");
    };

    assert_eq!(projector, "activity_counts");
    assert!(cursor > 0 && cursor < last, "cursor {cursor} of {last}");

    let checkpoint = projections.checkpoint("activity_counts").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Paused);
    assert_eq!(checkpoint.cursor, cursor);
    assert_eq!(
        projections.dispatch("activity_counts").await?,
        DispatchOutcome::Skipped(CheckpointStatus::Paused)
    );

    let resumed = projections
        .resume_rebuild("activity_counts", CancellationToken::new())
        .await?;
    assert_eq!(resumed.status, CheckpointStatus::Active);
    assert_eq!(resumed.cursor, last);

    let after = projections.snapshot(&tables, Some(3)).await?;
    assert!(compare(&before, &after).equal);
    assert_eq!(
        after.table(ACCOUNT_ACTIVITY_TABLE).map(|t| t.checksum.to_owned()),
        before.table(ACCOUNT_ACTIVITY_TABLE).map(|t| t.checksum.to_owned())
    );
    assert_eq!(count(&projections, ACCOUNT_ACTIVITY_TABLE, &account_id, "total").await?, 6);

    let err = projections
        .resume_rebuild("activity_counts", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProjectionError::InvalidTransition { .. }));

    Ok(())
}

pub async fn test_background_run(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projectors::install(projections)?.config(
        ConfigBuilder::new()
            .poll_interval(Duration::from_millis(20))
            .build(),
    );

    let token = CancellationToken::new();
    let handles = projections.run(token.clone()).await?;
    assert_eq!(handles.len(), 3);

    let case_id = unique("case");
    append(store, "case", &case_id, "opened", json!({"title": "Noisy fan"})).await?;

    let mut projected = None;

    for _ in 0..250 {
        projected = projections.row(CASE_STATUS_TABLE, &case_id).await?;

        if projected.is_some() {
            break;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    token.cancel();

    for handle in join_all(handles).await {
        handle?;
    }

    let projected = projected.expect("case projected by the background dispatcher");
    assert_eq!(projected.data["status"], CASE_OPEN);

    Ok(())
}

pub async fn test_table_ownership(projections: Projections) -> anyhow::Result<()> {
    let projections = projectors::install(projections)?;

    let Err(err) = projections.clone().projector(Squatter) else {
        bail!("squatter registered next to case_status");
    };

    assert!(matches!(
        err,
        ProjectionError::TableClaimed { ref table, ref owner, ref claimant }
            if table == CASE_STATUS_COUNTS_TABLE && owner == "case_status" && claimant == "squatter"
    ));

    let projections = projections.projector(StaleDealPipeline)?;
    assert_eq!(
        projections.names(),
        vec!["activity_counts", "case_status", "deal_pipeline"]
    );

    Ok(())
}

pub async fn test_verify_catches_up(store: &Store, projections: Projections) -> anyhow::Result<()> {
    let projections = projectors::install(projections)?;
    projections.init().await?;

    append(store, "case", &unique("case"), "opened", json!({"title": "Cold radiator"})).await?;
    projections.catch_up_all().await?;

    let late_id = unique("case");
    append(store, "case", &late_id, "opened", json!({"title": "Draughty window"})).await?;

    let verification = projections.verify("case_status").await?;
    assert!(verification.is_equal(), "{:?}", verification.comparison);

    let late = projections
        .row(CASE_STATUS_TABLE, &late_id)
        .await?
        .expect("late case row");
    assert_eq!(late.data["status"], CASE_OPEN);

    let checkpoint = projections.checkpoint("case_status").await?;
    assert_eq!(checkpoint.status, CheckpointStatus::Active);
    assert_eq!(checkpoint.cursor, store.last_position().await?);
    assert_eq!(checkpoint.leased_by, None);

    projections.pause("deal_pipeline").await?;

    let err = projections.verify("deal_pipeline").await.unwrap_err();
    assert!(matches!(
        err,
        ProjectionError::Inactive {
            status: CheckpointStatus::Paused,
            ..
        }
    ));

    projections.resume("deal_pipeline").await?;

    Ok(())
}

/// `rebuilding` and `dispatching` stand for two processes sharing the
/// same engine.
pub async fn test_rebuild_excludes_other_instances(
    store: &Store,
    rebuilding: Projections,
    dispatching: Projections,
) -> anyhow::Result<()> {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let rebuilding = rebuilding.projector(Gate {
        inner: CaseStatus,
        entered: entered.clone(),
        release: release.clone(),
        armed: AtomicBool::new(true),
    })?;
    let dispatching = dispatching.projector(CaseStatus)?;
    assert_ne!(rebuilding.id(), dispatching.id());

    dispatching.init().await?;

    let case_id = unique("case");
    append(store, "case", &case_id, "opened", json!({"title": "Stuck door"})).await?;
    dispatching.catch_up("case_status").await?;

    let open_before = count(&dispatching, CASE_STATUS_COUNTS_TABLE, CASE_OPEN, "count").await?;
    let triaged_before = count(&dispatching, CASE_STATUS_COUNTS_TABLE, "triaged", "count").await?;

    append(store, "case", &case_id, "status_changed", json!({"status": "triaged"})).await?;

    let rebuild = tokio::spawn(async move {
        rebuilding
            .rebuild("case_status", CancellationToken::new())
            .await
    });

    entered.notified().await;

    assert_eq!(dispatching.dispatch("case_status").await?, DispatchOutcome::Busy);
    assert!(dispatching
        .checkpoint("case_status")
        .await?
        .is_leased_to_other(dispatching.id()));

    release.notify_one();

    let rebuilt = rebuild.await??;
    assert_eq!(rebuilt.status, CheckpointStatus::Active);
    assert_eq!(rebuilt.cursor, store.last_position().await?);
    assert_eq!(rebuilt.leased_by, None);

    let caught_up = dispatching.catch_up("case_status").await?;
    assert_eq!(caught_up.cursor, rebuilt.cursor);

    assert_eq!(
        count(&dispatching, CASE_STATUS_COUNTS_TABLE, CASE_OPEN, "count").await?,
        open_before - 1
    );
    assert_eq!(
        count(&dispatching, CASE_STATUS_COUNTS_TABLE, "triaged", "count").await?,
        triaged_before + 1
    );

    let case = dispatching
        .row(CASE_STATUS_TABLE, &case_id)
        .await?
        .expect("case row");
    assert_eq!(case.data["status"], "triaged");

    Ok(())
}
