use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auction::{self, minimize, ItemId, SnapshotPayload};
use crate::bus::subjects;
use crate::error::Result;
use crate::metrics::DurationKind;
use crate::pool;
use crate::region::{Realm, Region};
use crate::router::{live_auctions_object, IntakeRequest, LIVE_AUCTIONS_BUCKET};
use crate::util::{gzip_encode, UnixTimestamp};
use crate::App;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_RETENTION_DAYS: i64 = 14;
const DOWNLOAD_WORKERS: usize = 4;

/// What one collector pass did, for logs, metrics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub total_realms: usize,
    pub included_realms: usize,
    pub new_items: usize,
}

struct RealmDownload {
    slug: String,
    last_modified: UnixTimestamp,
    item_ids: BTreeSet<ItemId>,
}

/// Fetch one realm if upstream has something newer than what we already
/// downloaded; persists the raw snapshot blob on success.
async fn download_realm(app: &App, region: &Region, realm: &Realm) -> Result<Option<RealmDownload>> {
    let info = app.source.get_realm_info(region, &realm.slug).await?;
    let last_modified = UnixTimestamp(info.last_modified);

    let already_downloaded = app
        .modification_dates
        .read()
        .expect("modification dates lock")
        .get(&region.name, &realm.slug)
        .downloaded;
    if last_modified <= already_downloaded {
        debug!(region = %region.name, realm = %realm.slug, "Realm is unchanged");
        return Ok(None);
    }

    let body = app.source.download_snapshot(&info.url).await?;
    let payload: SnapshotPayload = serde_json::from_slice(&body)?;
    let item_ids = auction::item_ids(&minimize(&payload.auctions));

    app.blob
        .write(
            LIVE_AUCTIONS_BUCKET,
            &live_auctions_object(&region.name, &realm.slug),
            &gzip_encode(&body)?,
            "application/json",
            Some("gzip"),
        )
        .await?;

    Ok(Some(RealmDownload {
        slug: realm.slug.clone(),
        last_modified,
        item_ids,
    }))
}

/// Fetch and persist metadata for item ids the store has never seen.
async fn resolve_new_items(
    app: &Arc<App>,
    stop: &CancellationToken,
    region: &Region,
    sighted: BTreeSet<ItemId>,
) -> usize {
    let fresh = app.items.filter_new(sighted).await;
    if fresh.is_empty() {
        return 0;
    }
    info!(region = %region.name, items = fresh.len(), "Resolving new items");

    let (in_tx, in_rx) = mpsc::channel(DOWNLOAD_WORKERS);
    let (out_tx, mut out_rx) = mpsc::channel(DOWNLOAD_WORKERS);

    let worker_app = Arc::clone(app);
    let worker_region = region.clone();
    let worker_out = out_tx.clone();
    let workers = tokio::spawn(pool::work(
        DOWNLOAD_WORKERS,
        in_rx,
        move |id: ItemId| {
            let app = Arc::clone(&worker_app);
            let region = worker_region.clone();
            let out = worker_out.clone();
            async move {
                let _ = out.send((id, app.source.get_item(&region, id).await)).await;
            }
        },
        move || drop(out_tx),
    ));

    for id in fresh {
        if stop.is_cancelled() || in_tx.send(id).await.is_err() {
            break;
        }
    }
    drop(in_tx);

    let mut items = Vec::new();
    while let Some((id, result)) = out_rx.recv().await {
        match result {
            Ok(item) => items.push(item),
            Err(err) => warn!(item = id, error = %err, "Could not fetch item"),
        }
    }
    let _ = workers.await;

    let resolved = items.len();
    if let Err(err) = app.items.persist(items).await {
        warn!(region = %region.name, error = %err, "Could not persist items");
        return 0;
    }
    resolved
}

/// One polling pass over every whitelisted realm of every region. A failure
/// on one realm skips that realm; the pass always completes unless stopped,
/// in which case it winds down at the next work-item boundary.
pub async fn collect_regions(app: &Arc<App>, stop: &CancellationToken) -> PassSummary {
    info!("Collecting regions");
    let started = Instant::now();

    let mut summary = PassSummary::default();
    let mut intake = IntakeRequest::default();

    for region in &app.config.regions {
        if stop.is_cancelled() {
            break;
        }
        if !app.config.region_enabled(&region.name) {
            continue;
        }

        let realms: Vec<Realm> = {
            let statuses = app.statuses.read().expect("statuses lock");
            let Some(status) = statuses.get(&region.name) else {
                continue;
            };
            status
                .realms
                .iter()
                .filter(|realm| app.config.realm_whitelisted(&region.name, &realm.slug))
                .cloned()
                .collect()
        };
        summary.total_realms += realms.len();
        debug!(region = %region.name, realms = realms.len(), "Downloading region");

        let (in_tx, in_rx) = mpsc::channel(DOWNLOAD_WORKERS);
        let (out_tx, mut out_rx) = mpsc::channel(DOWNLOAD_WORKERS);

        let worker_app = Arc::clone(app);
        let worker_region = region.clone();
        let worker_out = out_tx.clone();
        let workers = tokio::spawn(pool::work(
            DOWNLOAD_WORKERS,
            in_rx,
            move |realm: Realm| {
                let app = Arc::clone(&worker_app);
                let region = worker_region.clone();
                let out = worker_out.clone();
                async move {
                    let result = download_realm(&app, &region, &realm).await;
                    let _ = out.send((realm.slug, result)).await;
                }
            },
            move || drop(out_tx),
        ));

        // at most one download in flight per realm: each realm is fed once
        for realm in realms {
            if stop.is_cancelled() || in_tx.send(realm).await.is_err() {
                break;
            }
        }
        drop(in_tx);

        let mut sighted_items = BTreeSet::new();
        while let Some((slug, result)) = out_rx.recv().await {
            match result {
                Ok(Some(download)) => {
                    summary.included_realms += 1;
                    sighted_items.extend(download.item_ids.iter().copied());
                    app.modification_dates
                        .write()
                        .expect("modification dates lock")
                        .entry(&region.name, &download.slug)
                        .observe_downloaded(download.last_modified);
                    intake
                        .region_realm_timestamps
                        .entry(region.name.clone())
                        .or_default()
                        .insert(download.slug, download.last_modified.0);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(region = %region.name, realm = %slug, error = %err, "Realm download failed");
                }
            }
        }
        let _ = workers.await;
        debug!(region = %region.name, "Downloaded region");

        if stop.is_cancelled() {
            break;
        }
        summary.new_items += resolve_new_items(app, stop, region, sighted_items).await;
    }

    // hand the downloaded realms to the intake pipeline
    match serde_json::to_vec(&intake) {
        Ok(body) => {
            if let Err(err) = app.bus.publish(subjects::AUCTIONS_INTAKE, body).await {
                warn!(error = %err, "Could not publish intake request");
            }
        }
        Err(err) => warn!(error = %err, "Could not encode intake request"),
    }

    let mut fields = Map::new();
    fields.insert("total_realms".to_owned(), Value::from(summary.total_realms));
    fields.insert(
        "included_realms".to_owned(),
        Value::from(summary.included_realms),
    );
    fields.insert("new_items".to_owned(), Value::from(summary.new_items));
    app.reporter
        .report_duration(DurationKind::CollectorDuration, started.elapsed(), fields)
        .await;

    info!(
        total_realms = summary.total_realms,
        included_realms = summary.included_realms,
        new_items = summary.new_items,
        "Finished collector pass"
    );
    summary
}

/// Periodic driver: refresh the upstream credential, then poll every
/// whitelisted realm. Stops cleanly at the next work-item boundary.
pub fn start(app: Arc<App>, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting collector");
        let mut ticker = tokio::time::interval(DEFAULT_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = app.source.refresh_token().await {
                        warn!(error = %err, "Could not refresh upstream token, skipping pass");
                        continue;
                    }
                    collect_regions(&app, &stop).await;
                }
            }
        }
        info!("Collector stopped");
    })
}

/// Expire price-history shards older than the retention horizon, realm by
/// realm. The `fn-cleanup-pricelist-histories` command's work.
pub async fn cleanup_price_histories(app: &Arc<App>, older_than: UnixTimestamp) -> usize {
    let mut dropped = 0;
    for region in &app.config.regions {
        if !app.config.region_enabled(&region.name) {
            continue;
        }
        let realms: Vec<String> = {
            let statuses = app.statuses.read().expect("statuses lock");
            let Some(status) = statuses.get(&region.name) else {
                continue;
            };
            status
                .realms
                .iter()
                .filter(|realm| app.config.realm_whitelisted(&region.name, &realm.slug))
                .map(|realm| realm.slug.clone())
                .collect()
        };

        for slug in realms {
            match app
                .price_histories
                .drop_expired(&region.name, &slug, older_than)
                .await
            {
                Ok(count) => dropped += count,
                Err(err) => {
                    warn!(region = %region.name, realm = %slug, error = %err, "Cleanup failed for realm");
                }
            }
        }
    }
    info!(dropped, older_than = %older_than.to_utc_string(), "Cleaned up price histories");
    dropped
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::router::Listeners;
    use crate::testing;

    async fn wait_for<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check().await {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn a_pass_drives_the_whole_pipeline() {
        let (_dir, app) = testing::fixture_app().await;
        let listeners = Listeners::api(&app);
        let stop = CancellationToken::new();

        let summary = collect_regions(&app, &stop).await;
        assert_eq!(summary.total_realms, 1);
        assert_eq!(summary.included_realms, 1);
        assert_eq!(summary.new_items, 1);

        // snapshot blob persisted
        assert!(
            app.blob
                .exists(LIVE_AUCTIONS_BUCKET, &live_auctions_object("us", "earthen-ring"))
                .await
        );
        // downloaded date advanced
        let dates = app
            .modification_dates
            .read()
            .unwrap()
            .get("us", "earthen-ring");
        assert!(dates.downloaded.0 > 0);
        // item metadata resolved
        assert!(app.items.find_items(&[10]).await.contains_key(&10));

        // intake runs asynchronously off the published message
        let live = Arc::clone(&app);
        wait_for("live auctions to land", move || {
            let app = Arc::clone(&live);
            async move {
                app.live_auctions
                    .stats("us", "earthen-ring")
                    .await
                    .map(|stats| stats.total_auctions == 2)
                    .unwrap_or(false)
            }
        })
        .await;

        let history = Arc::clone(&app);
        wait_for("price history to land", move || {
            let app = Arc::clone(&history);
            async move {
                app.price_histories
                    .get_price_history(
                        "us",
                        "earthen-ring",
                        10,
                        UnixTimestamp(0),
                        UnixTimestamp(i64::MAX),
                    )
                    .await
                    .map(|history| !history.is_empty())
                    .unwrap_or(false)
            }
        })
        .await;

        listeners.stop().await;
    }

    #[tokio::test]
    async fn unchanged_realms_are_not_downloaded_again() {
        let (_dir, app) = testing::fixture_app().await;
        let stop = CancellationToken::new();

        let first = collect_regions(&app, &stop).await;
        assert_eq!(first.included_realms, 1);

        // same fixture, same upstream last-modified: nothing to do
        let second = collect_regions(&app, &stop).await;
        assert_eq!(second.included_realms, 0);
        assert_eq!(second.new_items, 0);
    }

    #[tokio::test]
    async fn a_cancelled_pass_does_no_work()
    {
        let (_dir, app) = testing::fixture_app().await;
        let stop = CancellationToken::new();
        stop.cancel();

        let summary = collect_regions(&app, &stop).await;
        assert_eq!(summary.included_realms, 0);
        assert!(
            !app.blob
                .exists(LIVE_AUCTIONS_BUCKET, &live_auctions_object("us", "earthen-ring"))
                .await
        );
    }

    #[tokio::test]
    async fn collector_stop_acknowledges() {
        let (_dir, app) = testing::fixture_app().await;
        let stop = CancellationToken::new();

        let handle = start(Arc::clone(&app), stop.clone());
        // let the first tick's pass begin
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("collector should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_drops_only_expired_shards() {
        let (_dir, app) = testing::fixture_app().await;
        let old_day = UnixTimestamp(1_690_000_000);
        let new_day = UnixTimestamp(1_700_000_000);

        for ts in [old_day, new_day] {
            app.price_histories
                .append(
                    "us",
                    "earthen-ring",
                    ts,
                    &std::collections::BTreeMap::from([(
                        10u64,
                        crate::price_history::ItemPrice::default(),
                    )]),
                )
                .await
                .unwrap();
        }

        let dropped = cleanup_price_histories(&app, new_day.normalized_day()).await;
        assert_eq!(dropped, 1);
        assert_eq!(
            app.price_histories
                .list_shard_timestamps("us", "earthen-ring")
                .await
                .unwrap(),
            vec![new_day.normalized_day()]
        );
    }
}
