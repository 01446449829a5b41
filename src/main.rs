use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::bus::Bus;
use crate::config::Config;
use crate::items::ItemsStore;
use crate::live_auctions::LiveAuctionsStore;
use crate::metrics::Reporter;
use crate::price_history::PriceHistoryStore;
use crate::region::{RegionName, RegionRealmModificationDates, Status};
use crate::source::SnapshotSource;
use crate::util::UnixTimestamp;

pub mod auction;
pub mod blob;
pub mod bus;
pub mod collector;
pub mod config;
pub mod error;
pub mod items;
pub mod kv;
pub mod live_auctions;
pub mod metrics;
pub mod pool;
pub mod price_history;
pub mod region;
pub mod router;
pub mod search;
pub mod source;
#[cfg(test)]
pub mod testing;
pub mod util;

pub const BUILD_VERSION: &str = env!("GIT_HASH");

/// Everything the listeners and the collector share, built once by
/// [`boot`] and handed around by `Arc`. No component holds a pointer back
/// into this container.
pub struct App {
    pub config: Config,
    pub bus: Bus,
    pub reporter: Reporter,
    pub source: SnapshotSource,
    pub live_auctions: LiveAuctionsStore,
    pub price_histories: PriceHistoryStore,
    pub items: ItemsStore,
    pub blob: BlobStore,
    pub statuses: std::sync::RwLock<HashMap<RegionName, Status>>,
    pub modification_dates: std::sync::RwLock<RegionRealmModificationDates>,
}

/// Build the container: stores over the cache dir, realm discovery per
/// enabled region, known realms registered in the live store.
pub async fn boot<F>(config: Config, make_source: F) -> anyhow::Result<Arc<App>>
where
    F: FnOnce(Reporter) -> SnapshotSource,
{
    let bus = Bus::connect();
    let reporter = Reporter::new(bus.clone());
    let source = make_source(reporter.clone());

    let cache_dir = PathBuf::from(&config.cache_dir);
    tokio::fs::create_dir_all(&cache_dir)
        .await
        .with_context(|| format!("could not create cache dir {}", cache_dir.display()))?;
    let blob = BlobStore::filesystem(&cache_dir);
    blob.ensure_bucket(router::LIVE_AUCTIONS_BUCKET)
        .await
        .context("could not prepare the auctions bucket")?;
    let items = ItemsStore::open(cache_dir.join("items.db.gz"))
        .await
        .context("could not open the items store")?;

    let live_auctions = LiveAuctionsStore::new();
    let mut statuses = HashMap::new();
    for region in &config.regions {
        if !config.region_enabled(&region.name) {
            continue;
        }
        let payload = source
            .get_realm_status(region)
            .await
            .with_context(|| format!("could not discover realms for {}", region.name))?;
        let status = Status::new(region.clone(), payload);
        for realm in &status.realms {
            if config.realm_whitelisted(&region.name, &realm.slug) {
                live_auctions.ensure_realm(&region.name, &realm.slug);
            }
        }
        info!(region = %region.name, realms = status.realms.len(), "Discovered realms");
        statuses.insert(region.name.clone(), status);
    }

    Ok(Arc::new(App {
        config,
        bus,
        reporter,
        source,
        live_auctions,
        price_histories: PriceHistoryStore::new(blob.clone()),
        items,
        blob,
        statuses: std::sync::RwLock::new(statuses),
        modification_dates: std::sync::RwLock::new(RegionRealmModificationDates::default()),
    }))
}

/// Reload snapshots persisted by earlier runs so queries survive restarts.
async fn warm_live_auctions(app: &Arc<App>) -> anyhow::Result<()> {
    let names = app.blob.list(router::LIVE_AUCTIONS_BUCKET, "").await?;
    if names.is_empty() {
        return Ok(());
    }

    let known: Vec<(String, String)> = {
        let statuses = app.statuses.read().expect("statuses lock");
        statuses
            .values()
            .flat_map(|status| {
                status
                    .realms
                    .iter()
                    .map(|realm| (realm.region_name.clone(), realm.slug.clone()))
            })
            .collect()
    };

    let mut warmed = 0;
    for (region, slug) in known {
        if !names.contains(&router::live_auctions_object(&region, &slug)) {
            continue;
        }
        match router::ingest_live_auctions(app, &region, &slug, UnixTimestamp::now()).await {
            Ok(_) => warmed += 1,
            Err(err) => warn!(region, realm = slug, error = %err, "Could not warm realm"),
        }
    }
    info!(warmed, "Warmed live auctions from persisted snapshots");
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => {
            info!("Terminated, shutting down");
        }
        it = tokio::signal::ctrl_c() => {
            it?;
            info!("Interrupted, shutting down");
        }
    }
    Ok(())
}

async fn api(config: Config) -> anyhow::Result<()> {
    info!("Starting api");
    let api_key = config.api_key.clone();
    let app = boot(config, move |reporter| {
        SnapshotSource::http(api_key, reporter)
    })
    .await?;
    warm_live_auctions(&app).await?;

    let listeners = router::Listeners::api(&app);
    let stop = CancellationToken::new();
    let collector = collector::start(Arc::clone(&app), stop.clone());

    info!(version = BUILD_VERSION, "goldwatch is up");
    wait_for_shutdown().await?;

    listeners.stop().await;
    stop.cancel();
    collector.await?;
    info!("Exiting");
    Ok(())
}

async fn prod_items(config: Config) -> anyhow::Result<()> {
    info!("Starting prod-items");
    let api_key = config.api_key.clone();
    let app = boot(config, move |reporter| {
        SnapshotSource::http(api_key, reporter)
    })
    .await?;

    let listeners = router::Listeners::items(&app);
    info!(version = BUILD_VERSION, "goldwatch items service is up");
    wait_for_shutdown().await?;

    listeners.stop().await;
    info!("Exiting");
    Ok(())
}

async fn cleanup_pricelist_histories(config: Config, retention_days: i64) -> anyhow::Result<()> {
    info!(retention_days, "Starting fn-cleanup-pricelist-histories");
    let api_key = config.api_key.clone();
    let app = boot(config, move |reporter| {
        SnapshotSource::http(api_key, reporter)
    })
    .await?;

    let older_than = (UnixTimestamp::now()
        - Duration::from_secs(retention_days as u64 * util::SECONDS_PER_DAY as u64))
    .normalized_day();
    let dropped = collector::cleanup_price_histories(&app, older_than).await;
    info!(dropped, "Cleanup finished");
    Ok(())
}

async fn api_test(config: Config, data_dir: PathBuf) -> anyhow::Result<()> {
    info!(data_dir = %data_dir.display(), "Starting api-test");
    let app = boot(config, move |reporter| {
        SnapshotSource::file(data_dir, reporter)
    })
    .await?;

    let listeners = router::Listeners::api(&app);

    // ingest the fixtures up front so queries have data immediately
    let stop = CancellationToken::new();
    collector::collect_regions(&app, &stop).await;

    // smoke the request path before handing the service over
    let reply = app
        .bus
        .request(bus::subjects::BOOT, Vec::new(), bus::BOOT_REQUEST_TIMEOUT)
        .await
        .context("boot smoke request failed")?;
    info!(code = ?reply.code, "Boot subject answered");

    info!(version = BUILD_VERSION, "goldwatch test service is up");
    wait_for_shutdown().await?;

    listeners.stop().await;
    info!("Exiting");
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "goldwatch", version = BUILD_VERSION)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Override the configured upstream API key
    #[arg(long)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full ingestion and query service
    Api,
    /// Serve only the item subjects from the persisted items store
    ProdItems,
    /// Expire price-history shards older than the retention horizon
    FnCleanupPricelistHistories {
        #[arg(long, default_value_t = collector::DEFAULT_RETENTION_DAYS)]
        retention_days: i64,
    },
    /// Run the service against fixture files instead of the upstream
    ApiTest {
        #[arg(long, default_value = "./test-fixtures")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = dotenv::dotenv() {
        println!("Loaded dotenv from {}", path.to_str().unwrap_or("?"));
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_path(&cli.config)?;
    if let Some(api_key) = cli
        .api_key
        .or_else(|| std::env::var("GOLDWATCH_API_KEY").ok())
    {
        config.api_key = api_key;
    }

    match cli.command {
        Command::Api => api(config).await,
        Command::ProdItems => prod_items(config).await,
        Command::FnCleanupPricelistHistories { retention_days } => {
            cleanup_pricelist_histories(config, retention_days).await
        }
        Command::ApiTest { data_dir } => api_test(config, data_dir).await,
    }
}
