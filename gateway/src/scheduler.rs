use crate::db;
use crate::db::SqlitePool;
use crate::invoices;
use crate::rate_limit::RateLimiter;
use crate::settings::Settings;
use crate::webhook::WebhookWorker;
use anyhow::anyhow;
use anyhow::Result;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tokio_cron_scheduler::Job;
use tokio_cron_scheduler::JobScheduler;

/// Drives the whole payment lifecycle on a fixed cadence: expiry scan, cache
/// GC and one webhook batch per tick.
pub struct GatewayScheduler {
    scheduler: JobScheduler,
}

impl GatewayScheduler {
    pub async fn new() -> Self {
        let scheduler = JobScheduler::new()
            .await
            .expect("To be able to start the scheduler");

        Self { scheduler }
    }

    pub async fn add_lifecycle_job(
        &self,
        pool: SqlitePool,
        settings: Settings,
        worker: Arc<WebhookWorker>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<()> {
        // Ticks never overlap: a tick that fires while the previous one is
        // still running is skipped.
        let running = Arc::new(tokio::sync::Mutex::new(()));

        let uuid = self
            .scheduler
            .add(
                Job::new_repeated_async(settings.scheduler_interval(), move |_, _| {
                    let pool = pool.clone();
                    let worker = worker.clone();
                    let rate_limiter = rate_limiter.clone();
                    let running = running.clone();

                    Box::pin(async move {
                        let _guard = match running.try_lock() {
                            Ok(guard) => guard,
                            Err(_) => {
                                tracing::debug!("Previous lifecycle tick still running, skipping");
                                return;
                            }
                        };

                        let now = OffsetDateTime::now_utc().unix_timestamp();
                        if let Err(e) =
                            run_tick(&pool, worker.as_ref(), rate_limiter.as_ref(), now).await
                        {
                            tracing::error!("Lifecycle tick failed: {e:#}");
                        }
                    })
                })
                .expect("To be able to add the job"),
            )
            .await?;
        tracing::debug!(
            job_id = uuid.to_string(),
            "Started gateway lifecycle job"
        );

        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        Ok(())
    }
}

/// One lifecycle pass. Public so tests can drive it with a fabricated clock.
pub async fn run_tick(
    pool: &SqlitePool,
    worker: &WebhookWorker,
    rate_limiter: &RateLimiter,
    now: i64,
) -> Result<()> {
    let (expired, nonces, paid, pending) = {
        let pool = pool.clone();
        spawn_blocking(move || {
            let mut conn = pool.get()?;

            let expired = invoices::expire_due_invoices(&mut conn, now)
                .map_err(|e| anyhow!("Failed to expire invoices: {e:?}"))?;
            let nonces = db::nonces::delete_expired(&mut conn, now)?;
            let paid = db::paid_transactions::delete_expired(&mut conn, now)?;
            let pending = db::pending_transactions::delete_expired(&mut conn, now)?;

            anyhow::Ok((expired, nonces, paid, pending))
        })
        .await
        .expect("task to complete")?
    };

    rate_limiter.prune();

    let claimed = worker.run_batch(now).await?;

    if expired + nonces + paid + pending + claimed > 0 {
        tracing::debug!(
            expired,
            gc_nonces = nonces,
            gc_paid_cache = paid,
            gc_pending = pending,
            webhook_batch = claimed,
            "Lifecycle tick done"
        );
    }

    Ok(())
}
