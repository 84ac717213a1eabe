use std::sync::Arc;

use anyhow::Context;
use crawlgate_infra::capacity::{CapacityManager, StaticSettingsProvider};
use crawlgate_infra::config::CrawlgateConfig;
use crawlgate_infra::feeder::CrawlFeeder;
use crawlgate_infra::jobs::RedisJobQueue;
use crawlgate_infra::store::RedisKvStore;
use crawlgate_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format = match std::env::var("CRAWLGATE_LOG_FORMAT") {
        Ok(value) => value.parse::<LogFormat>().unwrap_or_else(|e| {
            eprintln!("{e}; falling back to json");
            LogFormat::Json
        }),
        Err(_) => LogFormat::default(),
    };
    crawlgate_observability::init(log_format);

    let config = CrawlgateConfig::from_env().context("invalid crawlgate configuration")?;

    let settings = match std::env::var("CRAWLGATE_TENANT_OVERRIDES") {
        Ok(json) => StaticSettingsProvider::from_json(&json)
            .context("invalid CRAWLGATE_TENANT_OVERRIDES")?,
        Err(_) => {
            tracing::info!("CRAWLGATE_TENANT_OVERRIDES not set; using global defaults for every tenant");
            StaticSettingsProvider::new()
        }
    };

    let store = Arc::new(
        RedisKvStore::connect(&config.redis.url, config.redis.op_timeout)
            .await
            .context("failed to connect to redis")?,
    );
    let queue = Arc::new(RedisJobQueue::new(&store));
    let capacity = Arc::new(CapacityManager::new(
        store.clone(),
        Arc::new(settings),
        config.capacity.clone(),
    ));

    tracing::info!(
        owner = %config.feeder.owner_id,
        lease_ttl_secs = config.feeder.lease_ttl.as_secs(),
        default_limit = config.capacity.concurrency_limit,
        "starting crawl feeder"
    );

    let handle = CrawlFeeder::new(store, capacity, queue, config.feeder).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.shutdown().await;
    tracing::info!(
        cycles = stats.cycles,
        dispatched = stats.jobs_dispatched,
        duplicates = stats.duplicates,
        "crawl feeder exited"
    );
    Ok(())
}
