//! EnrollHub Background Worker
//!
//! Handles scheduled jobs including:
//! - Engine invariant checks (every 15 minutes, `INVARIANT_CHECK_CRON`)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use enrollhub_engine::{EnrollmentEngine, InvariantCheckSummary, PgStore, ViolationSeverity};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 */15 * * * *";

/// Log results of an invariant run
fn log_summary(summary: &InvariantCheckSummary) {
    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                entities = violation.entity_ids.len(),
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }

    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant check cycle complete"
    );

    if let Ok(json) = serde_json::to_string(summary) {
        debug!(summary = %json, "Invariant check summary");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,enrollhub_engine=debug")),
        )
        .init();

    info!("Starting EnrollHub Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = enrollhub_shared::create_pool(&database_url).await?;
    enrollhub_shared::run_migrations(&pool).await?;

    let engine: Arc<EnrollmentEngine<PgStore>> = Arc::new(EnrollmentEngine::from_env(pool));
    info!(config = ?engine.config, "Engine configured");

    let scheduler = JobScheduler::new().await?;

    // Job 1: Invariant checks
    let cron = std::env::var("INVARIANT_CHECK_CRON")
        .unwrap_or_else(|_| DEFAULT_INVARIANT_CHECK_CRON.to_string());
    let checker = engine.invariants.clone();
    scheduler
        .add(Job::new_async(cron.as_str(), move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running engine invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_summary(&summary),
                    Err(e) => error!(
                        error = %e,
                        retriable = e.is_retriable(),
                        "Invariant check run failed"
                    ),
                }
            })
        })?)
        .await?;
    info!(cron = %cron, "Scheduled: Engine invariant checks");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("EnrollHub Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
