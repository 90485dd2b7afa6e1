#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Streamline Background Worker
//!
//! Handles scheduled jobs:
//! - Subscription expiry (hourly)
//! - Billing invariant checks (daily at 4:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use streamline_billing::{BillingService, InvariantCheckSummary, ViolationSeverity};
use streamline_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Number of violations per severity, most severe first
fn count_by_severity(summary: &InvariantCheckSummary) -> [(ViolationSeverity, usize); 4] {
    [
        ViolationSeverity::Critical,
        ViolationSeverity::High,
        ViolationSeverity::Medium,
        ViolationSeverity::Low,
    ]
    .map(|severity| {
        let count = summary
            .violations
            .iter()
            .filter(|v| v.severity == severity)
            .count();
        (severity, count)
    })
}

/// Critical and high violations are logged as errors, the rest as warnings
fn needs_alert(severity: ViolationSeverity) -> bool {
    matches!(severity, ViolationSeverity::Critical | ViolationSeverity::High)
}

/// Log results of an invariant check run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing invariants hold"
        );
        return;
    }

    for (severity, count) in count_by_severity(summary) {
        if count > 0 {
            warn!(severity = %severity, count = count, "Billing invariant violations");
        }
    }

    for violation in &summary.violations {
        if needs_alert(violation.severity) {
            error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            );
        } else {
            warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            );
        }
    }

    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        "Invariant check cycle complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Streamline Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(value) => value
            .parse()
            .with_context(|| format!("DATABASE_MAX_CONNECTIONS has invalid value '{}'", value))?,
        Err(_) => DEFAULT_MAX_CONNECTIONS,
    };

    let pool = create_pool(&database_url, max_connections).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire subscriptions whose paid period has ended (hourly)
    let expiry_service = billing.subscriptions.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = expiry_service.clone();
            Box::pin(async move {
                info!("Running subscription expiry");
                match service
                    .expire_lapsed_subscriptions(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(expired) => info!(expired = expired, "Subscription expiry complete"),
                    Err(e) => error!(error = %e, "Subscription expiry failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription expiry (hourly)");

    // Job 2: Billing invariant checks (daily at 4:00 AM UTC)
    let invariant_checker = billing.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks(OffsetDateTime::now_utc()).await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 4:00 AM UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Streamline Worker started successfully with {} scheduled jobs", 2);

    // Jobs run on the scheduler's tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
