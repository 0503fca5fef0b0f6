mod common;

use common::{FakeLauncher, FakeWorld, fixtures_html};
use fixture_sync::config::SyncConfig;
use fixture_sync::driver::DriverError;
use fixture_sync::pipeline::{
    InMemoryStore, PipelineError, StageContext, StageError, SyncPipeline, SyncStage,
};
use fixture_sync::browser_pool::RestartReason;
use fixture_sync::scrape_engine::{ContentProbe, CriticalSelector, Severity, TaskError};
use serde_json::json;
use std::sync::Arc;

const SITE: &str = "https://www.example-league.com";

fn url(path: &str) -> String {
    format!("{SITE}/{path}")
}

fn base_config() -> fixture_sync::config::SyncConfigBuilder<fixture_sync::config::WithSiteUrl> {
    SyncConfig::builder().site_url(SITE).pool_size(2)
}

async fn start(config: SyncConfig) -> (SyncPipeline, Arc<FakeWorld>, Arc<InMemoryStore>) {
    let (launcher, world) = FakeLauncher::new();
    let store = Arc::new(InMemoryStore::new());
    let pipeline = SyncPipeline::start(config, launcher, store.clone())
        .await
        .unwrap();
    (pipeline, world, store)
}

fn probe() -> ContentProbe {
    ContentProbe::new("#fixtures", "tr.fixture-row")
        .unwrap()
        .unavailable_selector(".no-data")
        .unwrap()
}

/// Navigate, wait for the table, store one record per page
async fn sync_competition(ctx: StageContext, target: String) -> anyhow::Result<usize> {
    let mut lease = ctx.acquire().await?;
    let navigated = ctx.navigate(&mut lease, &target).await;
    if let Err(e) = navigated {
        lease.release().await;
        return Err(e.into());
    }
    let outcome = ctx.wait_for_content(&lease, &probe()).await;
    lease.release().await;

    let items = match outcome? {
        fixture_sync::scrape_engine::PollOutcome::Found { items, .. } => items,
        _ => 0,
    };
    ctx.upsert("competitions", &target, json!({ "url": target, "rows": items }))
        .await?;
    Ok(items)
}

#[tokio::test(start_paused = true)]
async fn test_stage_stores_each_record_once() {
    let (pipeline, world, store) = start(base_config().build().unwrap()).await;
    let targets: Vec<String> = (0..3).map(|i| url(&format!("comp/{i}"))).collect();
    for target in &targets {
        world.serve(target, &fixtures_html(2));
    }

    let report = pipeline
        .run_stage(SyncStage::Competitions, targets.clone(), sync_competition)
        .await
        .unwrap();

    assert_eq!(report.outcome.summary.successful, 3);
    assert_eq!(report.outcome.values(), vec![&2, &2, &2]);
    assert_eq!(report.record.items_found, 3);
    assert_eq!(report.record.items_new, 3);
    assert_eq!(report.record.errors_detected, 0);
    assert!(report.restarted.is_none());

    // Same records again: nothing new is written
    let writes_before = store.writes();
    let report = pipeline
        .run_stage(SyncStage::Teams, targets, sync_competition)
        .await
        .unwrap();
    assert_eq!(report.record.items_new, 0);
    assert_eq!(report.record.items_updated, 0);

    let progress = pipeline.tracker().snapshot().await;
    // Only progress snapshots were written during the second stage
    let competition_writes = (0..3)
        .filter(|i| store.get("competitions", &url(&format!("comp/{i}"))).is_some())
        .count();
    assert_eq!(competition_writes, 3);
    assert!(store.writes() > writes_before);
    assert_eq!(
        progress.completed_stages,
        vec![SyncStage::Competitions, SyncStage::Teams]
    );

    let stats = pipeline.pool_stats();
    assert_eq!(stats.available, 2);
    assert_eq!(stats.leased_permanent + stats.leased_ephemeral, 0);

    let finished = pipeline.finish().await;
    assert!(finished.finished_at.is_some());
    assert!(store
        .get("sync-progress", &finished.run_id.to_string())
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_cancels_remaining_tasks() {
    let config = base_config()
        .circuit_failure_threshold(2)
        .concurrency_for(SyncStage::Games, 1)
        .build()
        .unwrap();
    let (pipeline, world, _store) = start(config).await;
    let targets: Vec<String> = (0..5).map(|i| url(&format!("game/{i}"))).collect();
    for target in &targets {
        world.fail(
            target,
            DriverError::Connection {
                url: target.clone(),
                message: "net::ERR_TUNNEL_CONNECTION_FAILED".into(),
            },
        );
    }

    pipeline.skip_to(SyncStage::Games).await.unwrap();
    let report = pipeline
        .run_stage(SyncStage::Games, targets, sync_competition)
        .await
        .unwrap();

    let summary = report.outcome.summary;
    assert_eq!(summary.successful, 0);
    assert_eq!(summary.failed, 5);
    let cancelled = report
        .outcome
        .errors
        .iter()
        .filter(|e| matches!(e.outcome, Err(TaskError::Cancelled(_))))
        .count();
    assert_eq!(cancelled, 3);
    assert!(pipeline
        .proxy_health()
        .breaker()
        .is_open("www.example-league.com"));
    assert_eq!(world.navigations.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_page_is_evicted() {
    let (pipeline, world, _store) = start(base_config().build().unwrap()).await;
    let target = url("comp/limited");
    world.fail(
        &target,
        DriverError::RateLimited {
            url: target.clone(),
            status: 429,
        },
    );

    let report = pipeline
        .run_stage(SyncStage::Competitions, vec![target], sync_competition)
        .await
        .unwrap();

    assert_eq!(report.record.errors_detected, 1);
    let stats = pipeline.pool_stats();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.available, 2);
    assert!(pipeline.proxy_health().guard().is_in_backoff());
}

#[tokio::test(start_paused = true)]
async fn test_browser_restarts_between_stages() {
    let config = base_config()
        .max_operations_before_restart(2)
        .min_restart_interval_secs(0)
        .build()
        .unwrap();
    let (pipeline, world, _store) = start(config).await;
    let targets: Vec<String> = (0..3).map(|i| url(&format!("comp/{i}"))).collect();
    for target in &targets {
        world.serve(target, &fixtures_html(1));
    }

    let first = pipeline
        .run_stage(SyncStage::Competitions, targets.clone(), sync_competition)
        .await
        .unwrap();
    assert!(first.restarted.is_none());
    assert_eq!(pipeline.lifecycle().operation_count(), 3);

    let second = pipeline
        .run_stage(SyncStage::Teams, targets, sync_competition)
        .await
        .unwrap();
    assert_eq!(second.restarted, Some(RestartReason::OperationCount { count: 3 }));
    assert_eq!(second.outcome.summary.successful, 3);
    assert_eq!(world.launch_count(), 2);
    assert_eq!(pipeline.pool_stats().generation, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_on_error_aborts_stage() {
    let config = base_config()
        .continue_on_error(false)
        .concurrency_for(SyncStage::FixtureValidation, 1)
        .build()
        .unwrap();
    let (pipeline, _world, _store) = start(config).await;
    pipeline.skip_to(SyncStage::FixtureValidation).await.unwrap();

    let err = pipeline
        .run_stage(
            SyncStage::FixtureValidation,
            vec![1u32, 2, 3, 4],
            |_ctx, n| async move {
                if n == 2 {
                    anyhow::bail!("fixture {n} has no venue");
                }
                Ok(n)
            },
        )
        .await
        .unwrap_err();

    match err {
        PipelineError::Aborted { stage, index, error } => {
            assert_eq!(stage, SyncStage::FixtureValidation);
            assert_eq!(index, 1);
            assert!(matches!(error, TaskError::Failed(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    // The stage is still closed out
    let progress = pipeline.tracker().snapshot().await;
    assert!(progress.completed_stages.contains(&SyncStage::FixtureValidation));
    assert!(progress.current_stage.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stage_out_of_order_is_rejected() {
    let (pipeline, world, _store) = start(base_config().build().unwrap()).await;

    let err = pipeline
        .run_stage(SyncStage::Games, vec![url("game/1")], sync_competition)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Stage(StageError::OutOfOrder {
            requested: SyncStage::Games,
            expected: SyncStage::Competitions
        })
    ));
    assert_eq!(world.navigations.load(std::sync::atomic::Ordering::SeqCst), 0);

    pipeline.skip_to(SyncStage::Games).await.unwrap();
    let progress = pipeline.tracker().snapshot().await;
    assert_eq!(
        progress.completed_stages,
        vec![SyncStage::Competitions, SyncStage::Teams]
    );
    assert_eq!(progress.pending_stages.first(), Some(&SyncStage::Games));
}

#[tokio::test(start_paused = true)]
async fn test_structure_drift_is_reported() {
    let config = base_config()
        .concurrency_for(SyncStage::Competitions, 1)
        .build()
        .unwrap();
    let (pipeline, world, _store) = start(config).await;
    let pipeline = pipeline.with_critical_selectors(vec![
        CriticalSelector::new("fixtures container", "#fixtures", true).unwrap(),
        CriticalSelector::new("fixture rows", "tr.fixture-row", false).unwrap(),
    ]);

    let good = url("comp/good");
    let drifted = url("comp/drifted");
    world.serve(&good, &fixtures_html(2));
    world.serve(
        &drifted,
        "<html><head><title>Fixtures</title></head><body><div class=\"new-layout\"></div></body></html>",
    );

    let report = pipeline
        .run_stage(
            SyncStage::Competitions,
            vec![good, drifted],
            |ctx: StageContext, target: String| async move {
                let mut lease = ctx.acquire().await?;
                ctx.navigate(&mut lease, &target).await?;
                let changes = ctx.check_structure(&lease).await;
                lease.release().await;
                Ok::<_, anyhow::Error>(changes)
            },
        )
        .await
        .unwrap();

    let ordered = report.outcome.into_ordered();
    let baseline_changes = ordered[0].outcome.as_ref().unwrap();
    assert!(baseline_changes.is_empty());
    let drift = ordered[1].outcome.as_ref().unwrap();
    assert!(drift.iter().any(|c| c.severity == Severity::High));
    assert!(drift.iter().any(|c| c.severity == Severity::Medium));
}

#[tokio::test]
async fn test_failed_launch_is_fatal() {
    let (launcher, world) = FakeLauncher::new();
    world.set_fail_launch(true);
    let store = Arc::new(InMemoryStore::new());

    let err = SyncPipeline::start(base_config().build().unwrap(), launcher, store)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
}
