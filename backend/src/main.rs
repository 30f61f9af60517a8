use std::sync::Arc;

use livepoll::{
    cache::{CounterCache, MemoryCounterCache, RedisCounterCache},
    catchers::{bad_request, internal_error, not_found, too_many_requests, unavailable, unprocessable},
    config::Config,
    cors::CORS,
    engine::VoteTallyEngine,
    queries::PgStore,
    routes::{
        all_options, cast_vote, create_poll, delete_option, delete_poll, events, get_option, get_poll,
        grand_total, list_polls, reconcile, AppState,
    },
};
use rocket::fairing::AdHoc;
use rocket::{catchers, routes};
use shuttle_runtime::CustomError;
use sqlx::PgPool;
use tokio::time::Duration;
use tracing::{info, warn};

const LEDGER_RETENTION: time::Duration = time::Duration::days(1);
const LEDGER_CLEANUP_EVERY: Duration = Duration::from_secs(60 * 60);

async fn counter_cache(config: &Config) -> Result<Arc<dyn CounterCache>, CustomError> {
    let Some(url) = &config.redis_url else {
        return Ok(Arc::new(MemoryCounterCache::new()));
    };

    let cache = RedisCounterCache::connect(url, &config.counter_prefix, &config.ticket_prefix, config.scan_batch)
        .await
        .map_err(CustomError::new)?;
    Ok(Arc::new(cache))
}

#[shuttle_runtime::main]
async fn rocket(
    #[shuttle_shared_db::Postgres] pool: PgPool,
    #[shuttle_runtime::Secrets] secret_store: shuttle_runtime::SecretStore,
) -> shuttle_rocket::ShuttleRocket {
    info!("🚀 Starting live poll server");

    let config = Config::load(&secret_store);

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(CustomError::new)?;

    info!("📋 Migrations complete");

    let store = PgStore::new(pool);
    let cache = counter_cache(&config).await?;

    let engine = Arc::new(VoteTallyEngine::new(
        cache,
        Arc::new(store),
        config.reconcile_concurrency,
        config.observer_buffer,
    ));
    engine.start_reconciler(config.reconcile_interval);
    engine.start_ledger_cleanup(LEDGER_RETENTION, LEDGER_CLEANUP_EVERY);

    let drain_engine = Arc::clone(&engine);
    let drain_timeout = config.shutdown_drain_timeout;
    let drain_on_shutdown = AdHoc::on_shutdown("Drain pending votes", move |_| {
        Box::pin(async move {
            info!("Draining pending votes before exit");
            match drain_engine.shutdown(drain_timeout).await {
                Some(report) if report.failed.is_empty() => info!("Pending votes drained"),
                Some(report) => warn!("{} options could not be drained", report.failed.len()),
                None => warn!("Exiting with pending votes still in the counter cache"),
            }
        })
    });

    let rocket = rocket::build()
        .attach(CORS)
        .attach(drain_on_shutdown)
        .manage(AppState::new(engine, config.vote_rate_limit_per_minute))
        .mount(
            "/api",
            routes![
                list_polls,
                create_poll,
                get_poll,
                delete_poll,
                cast_vote,
                get_option,
                delete_option,
                grand_total,
                reconcile,
                events,
                all_options
            ],
        )
        .register(
            "/",
            catchers![
                too_many_requests,
                bad_request,
                unprocessable,
                unavailable,
                internal_error,
                not_found
            ],
        );

    Ok(rocket.into())
}
