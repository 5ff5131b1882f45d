use anyhow::Context;
use anyhow::Result;
use gateway::cli::Opts;
use gateway::db;
use gateway::logger;
use gateway::rate_limit::RateLimiter;
use gateway::routes::router;
use gateway::routes::AppState;
use gateway::run_migration;
use gateway::scheduler::GatewayScheduler;
use gateway::settings::Settings;
use gateway::upstream::HttpUpstream;
use gateway::webhook::WebhookWorker;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::metadata::LevelFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::read();

    logger::init_tracing(LevelFilter::DEBUG, opts.json)?;

    let settings = Settings::from_env()?;

    let database = opts.database()?;
    if let Some(data_dir) = database.parent() {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)
                .context(format!("Could not create data dir {}", data_dir.display()))?;
        }
    }

    let pool = db::init_pool(
        database
            .to_str()
            .context("Database path is not valid UTF-8")?,
    )?;

    let mut conn = pool.get()?;
    run_migration(&mut conn);
    drop(conn);

    let rate_limiter = Arc::new(RateLimiter::new(
        settings.rate_limit_per_minute,
        settings.rate_limit_window(),
    ));
    let upstream = Arc::new(HttpUpstream::new(
        settings.upstream_endpoint.clone(),
        settings.upstream_timeout(),
    )?);
    let worker = Arc::new(WebhookWorker::new(pool.clone(), settings.clone())?);

    let scheduler = GatewayScheduler::new().await;
    scheduler
        .add_lifecycle_job(
            pool.clone(),
            settings.clone(),
            worker,
            rate_limiter.clone(),
        )
        .await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        pool,
        settings,
        rate_limiter,
        upstream,
    });
    let app = router(app_state);

    let addr = SocketAddr::from((opts.http_address.ip(), opts.http_address.port()));
    tracing::debug!("listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}
