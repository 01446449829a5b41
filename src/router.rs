use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auction::{minimize, ItemId, MiniAuction, OwnerName, SnapshotPayload};
use crate::bus::{subjects, Message};
use crate::config::{Expansion, ItemClass, Profession};
use crate::error::{Error, Result};
use crate::items::Item;
use crate::live_auctions::ChurnReport;
use crate::metrics::{DurationKind, IntakeKind};
use crate::pool;
use crate::price_history::{item_prices, ItemPrice, PriceHistory};
use crate::region::{RealmModificationDates, RealmSlug, Region, RegionName};
use crate::search;
use crate::util::{gzip_decode, gzip_encode, UnixTimestamp};
use crate::App;

const INTAKE_WORKERS: usize = 4;

pub const LIVE_AUCTIONS_BUCKET: &str = "auctions";

pub fn live_auctions_object(region: &str, slug: &str) -> String {
    format!("{region}-{slug}.json.gz")
}

/// The region-realm-timestamps message the collector publishes and both
/// intake handlers consume.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IntakeRequest {
    pub region_realm_timestamps: HashMap<RegionName, HashMap<RealmSlug, i64>>,
}

impl IntakeRequest {
    pub fn jobs(&self) -> Vec<(RegionName, RealmSlug, UnixTimestamp)> {
        self.region_realm_timestamps
            .iter()
            .flat_map(|(region, realms)| {
                realms
                    .iter()
                    .map(|(slug, ts)| (region.clone(), slug.clone(), UnixTimestamp(*ts)))
            })
            .collect()
    }
}

fn decode_request<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|err| Error::parse(err))
}

/// Bulk payloads cross the bus as base64(gzip(json)).
fn encode_bulk<T: Serialize>(value: &T) -> Result<String> {
    let body = serde_json::to_vec(value)?;
    let compressed = gzip_encode(&body)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

#[derive(Deserialize)]
struct StatusRequest {
    region_name: RegionName,
}

#[derive(Serialize)]
struct StatusResponse {
    region: Region,
    realms: Vec<RealmStatusLine>,
}

#[derive(Serialize)]
struct RealmStatusLine {
    region_name: RegionName,
    slug: RealmSlug,
    display_name: String,
    last_modified: i64,
    modification_dates: RealmModificationDates,
}

#[derive(Deserialize)]
struct AuctionsRequest {
    region_name: RegionName,
    realm_slug: RealmSlug,
}

#[derive(Serialize)]
struct AuctionsResponse<'a> {
    auctions: &'a [MiniAuction],
}

#[derive(Deserialize)]
struct PriceListRequest {
    region_name: RegionName,
    realm_slug: RealmSlug,
    item_ids: Vec<ItemId>,
}

#[derive(Serialize)]
struct PriceListResponse {
    price_list: BTreeMap<ItemId, ItemPrice>,
}

#[derive(Deserialize)]
struct PriceListHistoryRequest {
    region_name: RegionName,
    realm_slug: RealmSlug,
    item_ids: Vec<ItemId>,
    lower_bounds: i64,
    upper_bounds: i64,
}

#[derive(Serialize)]
struct PriceListHistoryResponse {
    history: BTreeMap<ItemId, PriceHistory>,
}

#[derive(Deserialize)]
struct OwnersQueryRequest {
    region_name: RegionName,
    realm_slug: RealmSlug,
    #[serde(default)]
    query: String,
}

#[derive(Serialize)]
struct OwnersQueryResponse {
    items: Vec<crate::live_auctions::OwnerMatch>,
}

#[derive(Deserialize)]
struct OwnersQueryByItemsRequest {
    region_name: RegionName,
    realm_slug: RealmSlug,
    items: Vec<ItemId>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerItemsOwnership {
    pub owned_value: u64,
    pub owned_volume: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OwnersQueryByItemsResponse {
    pub ownership: BTreeMap<OwnerName, OwnerItemsOwnership>,
    pub total_value: u64,
    pub total_volume: u64,
}

#[derive(Deserialize)]
struct ItemsQueryRequest {
    #[serde(default)]
    query: String,
}

#[derive(Serialize)]
struct ItemsQueryEntry {
    item: Item,
    rank: i32,
}

#[derive(Serialize)]
struct ItemsQueryResponse {
    items: Vec<ItemsQueryEntry>,
}

#[derive(Serialize)]
struct BootResponse<'a> {
    regions: &'a [Region],
    item_classes: &'a [ItemClass],
    expansions: &'a [Expansion],
    professions: &'a [Profession],
}

async fn handle_status(app: Arc<App>, data: Vec<u8>) -> Result<String> {
    let request: StatusRequest = decode_request(&data)?;

    let status = {
        let statuses = app.statuses.read().expect("statuses lock");
        statuses
            .get(&request.region_name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("invalid region {}", request.region_name)))?
    };
    let dates = app
        .modification_dates
        .read()
        .expect("modification dates lock")
        .clone();

    let realms = status
        .realms
        .iter()
        .map(|realm| RealmStatusLine {
            region_name: realm.region_name.clone(),
            slug: realm.slug.clone(),
            display_name: realm.display_name.clone(),
            last_modified: realm.last_modified,
            modification_dates: dates.get(&realm.region_name, &realm.slug),
        })
        .collect();

    Ok(serde_json::to_string(&StatusResponse {
        region: status.region.clone(),
        realms,
    })?)
}

async fn handle_auctions(app: Arc<App>, data: Vec<u8>) -> Result<String> {
    let request: AuctionsRequest = decode_request(&data)?;
    let list = app
        .live_auctions
        .get_mini_auctions(&request.region_name, &request.realm_slug)
        .await?;
    let target_time = app
        .live_auctions
        .target_time(&request.region_name, &request.realm_slug)
        .await?;
    tracing::debug!(
        region = %request.region_name,
        realm = %request.realm_slug,
        target_time = target_time.0,
        auctions = list.len(),
        "Serving auctions"
    );
    encode_bulk(&AuctionsResponse { auctions: &list })
}

async fn handle_price_list(app: Arc<App>, data: Vec<u8>) -> Result<String> {
    let request: PriceListRequest = decode_request(&data)?;
    let list = app
        .live_auctions
        .get_mini_auctions(&request.region_name, &request.realm_slug)
        .await?;

    let all_prices = item_prices(&list);
    let price_list: BTreeMap<ItemId, ItemPrice> = request
        .item_ids
        .iter()
        .filter_map(|id| all_prices.get(id).map(|price| (*id, *price)))
        .collect();

    encode_bulk(&PriceListResponse { price_list })
}

async fn handle_price_list_history(app: Arc<App>, data: Vec<u8>) -> Result<String> {
    let request: PriceListHistoryRequest = decode_request(&data)?;

    // realm resolution mirrors the live side so unknown realms answer the
    // same way on both subjects
    {
        let statuses = app.statuses.read().expect("statuses lock");
        let status = statuses
            .get(&request.region_name)
            .ok_or_else(|| Error::not_found(format!("invalid region {}", request.region_name)))?;
        if status.realm(&request.realm_slug).is_none() {
            return Err(Error::not_found(format!("invalid realm {}", request.realm_slug)));
        }
    }

    let mut history = BTreeMap::new();
    for id in &request.item_ids {
        let entries = app
            .price_histories
            .get_price_history(
                &request.region_name,
                &request.realm_slug,
                *id,
                UnixTimestamp(request.lower_bounds),
                UnixTimestamp(request.upper_bounds),
            )
            .await?;
        if !entries.is_empty() {
            history.insert(*id, entries);
        }
    }

    encode_bulk(&PriceListHistoryResponse { history })
}

async fn handle_owners_query(app: Arc<App>, data: Vec<u8>) -> Result<String> {
    let request: OwnersQueryRequest = decode_request(&data)?;
    let started = Instant::now();
    let items = app
        .live_auctions
        .query_owners(&request.region_name, &request.realm_slug, &request.query, false)
        .await?;
    info!(
        region = %request.region_name,
        realm = %request.realm_slug,
        query = %request.query,
        duration_ms = started.elapsed().as_millis() as u64,
        "Queried owners"
    );

    Ok(serde_json::to_string(&OwnersQueryResponse { items })?)
}

async fn handle_owners_query_by_items(app: Arc<App>, data: Vec<u8>) -> Result<String> {
    let request: OwnersQueryByItemsRequest = decode_request(&data)?;
    let list = app
        .live_auctions
        .get_mini_auctions(&request.region_name, &request.realm_slug)
        .await?;

    let wanted: std::collections::HashSet<ItemId> = request.items.iter().copied().collect();
    let mut response = OwnersQueryByItemsResponse {
        ownership: BTreeMap::new(),
        total_value: 0,
        total_volume: 0,
    };
    for mini in list.iter().filter(|mini| wanted.contains(&mini.item_id)) {
        let count = mini.auc_ids.len() as u64;
        let value = mini.buyout * mini.quantity * count;
        let volume = mini.quantity * count;

        response.total_value += value;
        response.total_volume += volume;
        let entry = response.ownership.entry(mini.owner.clone()).or_default();
        entry.owned_value += value;
        entry.owned_volume += volume;
    }

    Ok(serde_json::to_string(&response)?)
}

async fn handle_items_query(app: Arc<App>, data: Vec<u8>) -> Result<String> {
    let request: ItemsQueryRequest = decode_request(&data)?;
    let cache = app.items.cached().await;

    let mut entries: Vec<ItemsQueryEntry> = cache
        .into_values()
        .filter_map(|item| {
            let rank = search::rank_match_fold(&request.query, &item.normalized_name);
            (rank >= 0).then_some(ItemsQueryEntry { item, rank })
        })
        .collect();
    entries.sort_by(|a, b| {
        a.rank
            .cmp(&b.rank)
            .then_with(|| a.item.normalized_name.cmp(&b.item.normalized_name))
    });
    entries.truncate(search::MAX_RESULTS);

    Ok(serde_json::to_string(&ItemsQueryResponse { items: entries })?)
}

async fn handle_boot(app: Arc<App>, _data: Vec<u8>) -> Result<String> {
    Ok(serde_json::to_string(&BootResponse {
        regions: &app.config.regions,
        item_classes: &app.config.item_classes,
        expansions: &app.config.expansions,
        professions: &app.config.professions,
    })?)
}

/// Load one realm's persisted snapshot and swap it into the live store.
pub async fn ingest_live_auctions(
    app: &App,
    region: &str,
    slug: &str,
    target_time: UnixTimestamp,
) -> Result<ChurnReport> {
    let object = live_auctions_object(region, slug);
    let body = app.blob.read(LIVE_AUCTIONS_BUCKET, &object).await?;
    let body = gzip_decode(&body).map_err(|err| Error::corrupt(format!("{object}: {err}")))?;
    let payload: SnapshotPayload = serde_json::from_slice(&body)?;

    let minis = minimize(&payload.auctions);
    let report = app.live_auctions.replace(region, slug, minis, target_time).await?;
    app.modification_dates
        .write()
        .expect("modification dates lock")
        .entry(region, slug)
        .observe_live_auctions_received(target_time);
    Ok(report)
}

/// Load one realm's persisted snapshot and append its derived prices to the
/// day's history shard.
pub async fn ingest_price_histories(
    app: &App,
    region: &str,
    slug: &str,
    target_time: UnixTimestamp,
) -> Result<()> {
    let object = live_auctions_object(region, slug);
    let body = app.blob.read(LIVE_AUCTIONS_BUCKET, &object).await?;
    let body = gzip_decode(&body).map_err(|err| Error::corrupt(format!("{object}: {err}")))?;
    let payload: SnapshotPayload = serde_json::from_slice(&body)?;

    let prices = item_prices(&minimize(&payload.auctions));
    app.price_histories
        .append(region, slug, target_time, &prices)
        .await?;
    app.modification_dates
        .write()
        .expect("modification dates lock")
        .entry(region, slug)
        .observe_pricelist_histories_received(target_time);
    Ok(())
}

fn note_intake_failure(subject: &str, region: &str, slug: &str, err: &Error) {
    if err.is_stop() {
        return;
    }
    debug_assert!(
        !matches!(err, Error::Invariant(_)),
        "intake invariant violation on {region}/{slug}: {err}"
    );
    warn!(subject, region, slug, error = %err, "Intake failed for realm");
}

async fn process_auctions_intake(app: Arc<App>, request: IntakeRequest) {
    let started = Instant::now();
    let jobs = request.jobs();
    let included = jobs.len();

    let (in_tx, in_rx) = mpsc::channel(INTAKE_WORKERS);
    let (out_tx, mut out_rx) = mpsc::channel(INTAKE_WORKERS);

    let worker_app = Arc::clone(&app);
    let worker_out = out_tx.clone();
    let workers = tokio::spawn(pool::work(
        INTAKE_WORKERS,
        in_rx,
        move |(region, slug, ts): (RegionName, RealmSlug, UnixTimestamp)| {
            let app = Arc::clone(&worker_app);
            let out = worker_out.clone();
            async move {
                let result = ingest_live_auctions(&app, &region, &slug, ts).await;
                let _ = out.send((region, slug, result)).await;
            }
        },
        move || drop(out_tx),
    ));

    for job in jobs {
        if in_tx.send(job).await.is_err() {
            break;
        }
    }
    drop(in_tx);

    let mut loaded = 0usize;
    let mut total_new = 0usize;
    let mut total_removed = 0usize;
    while let Some((region, slug, result)) = out_rx.recv().await {
        match result {
            Ok(report) => {
                loaded += 1;
                total_new += report.new_auction_count;
                total_removed += report.removed_auction_count;
            }
            Err(err) => note_intake_failure(subjects::AUCTIONS_INTAKE, &region, &slug, &err),
        }
    }
    let _ = workers.await;

    let mut fields = Map::new();
    fields.insert("included_realms".to_owned(), Value::from(included));
    fields.insert("loaded_realms".to_owned(), Value::from(loaded));
    fields.insert("total_new_auctions".to_owned(), Value::from(total_new));
    fields.insert("total_removed_auctions".to_owned(), Value::from(total_removed));
    app.reporter
        .report_duration(DurationKind::AuctionsIntakeDuration, started.elapsed(), fields)
        .await;

    // pipe the same payload onward for history computation
    match serde_json::to_vec(&request) {
        Ok(body) => {
            if let Err(err) = app.bus.publish(subjects::PRICELISTS_INTAKE, body).await {
                warn!(error = %err, "Could not pipe intake onward");
            }
        }
        Err(err) => warn!(error = %err, "Could not encode intake request"),
    }
}

async fn process_pricelists_intake(app: Arc<App>, request: IntakeRequest) {
    let started = Instant::now();
    let jobs = request.jobs();
    let included = jobs.len();

    let (in_tx, in_rx) = mpsc::channel(INTAKE_WORKERS);
    let (out_tx, mut out_rx) = mpsc::channel(INTAKE_WORKERS);

    let worker_app = Arc::clone(&app);
    let worker_out = out_tx.clone();
    let workers = tokio::spawn(pool::work(
        INTAKE_WORKERS,
        in_rx,
        move |(region, slug, ts): (RegionName, RealmSlug, UnixTimestamp)| {
            let app = Arc::clone(&worker_app);
            let out = worker_out.clone();
            async move {
                let result = ingest_price_histories(&app, &region, &slug, ts).await;
                let _ = out.send((region, slug, result)).await;
            }
        },
        move || drop(out_tx),
    ));

    for job in jobs {
        if in_tx.send(job).await.is_err() {
            break;
        }
    }
    drop(in_tx);

    let mut loaded = 0usize;
    while let Some((region, slug, result)) = out_rx.recv().await {
        match result {
            Ok(()) => loaded += 1,
            Err(err) => note_intake_failure(subjects::PRICELISTS_INTAKE, &region, &slug, &err),
        }
    }
    let _ = workers.await;

    let mut fields = Map::new();
    fields.insert("included_realms".to_owned(), Value::from(included));
    fields.insert("loaded_realms".to_owned(), Value::from(loaded));
    app.reporter
        .report_duration(DurationKind::PricelistsIntakeDuration, started.elapsed(), fields)
        .await;
}

fn reply_listener<F, Fut>(
    app: &Arc<App>,
    subject: &'static str,
    stop: CancellationToken,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<App>, Vec<u8>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    let bus = app.bus.clone();
    let app = Arc::clone(app);
    bus.subscribe(subject, stop, move |msg| {
        let app = Arc::clone(&app);
        let handler = handler.clone();
        async move {
            let reply = match handler(Arc::clone(&app), msg.data.clone()).await {
                Ok(data) => Message::ok(data),
                Err(err) => {
                    if !err.is_stop() {
                        warn!(subject = %msg.subject, error = %err, "Request failed");
                    }
                    Message::from(&err)
                }
            };
            let _ = app.bus.reply_to(&msg, reply);
        }
    })
}

fn auctions_intake_listener(app: &Arc<App>, stop: CancellationToken) -> JoinHandle<()> {
    let bus = app.bus.clone();
    let app = Arc::clone(app);
    bus.subscribe(subjects::AUCTIONS_INTAKE, stop, move |msg| {
        let app = Arc::clone(&app);
        async move {
            app.reporter
                .report_intake_buffer_size(
                    IntakeKind::LiveAuctionsIntake,
                    app.bus.queued(subjects::AUCTIONS_INTAKE),
                )
                .await;
            match decode_request::<IntakeRequest>(&msg.data) {
                Ok(request) => process_auctions_intake(app, request).await,
                Err(err) => warn!(error = %err, "Malformed auctions-intake request"),
            }
        }
    })
}

fn pricelists_intake_listener(app: &Arc<App>, stop: CancellationToken) -> JoinHandle<()> {
    let bus = app.bus.clone();
    let app = Arc::clone(app);
    bus.subscribe(subjects::PRICELISTS_INTAKE, stop, move |msg| {
        let app = Arc::clone(&app);
        async move {
            app.reporter
                .report_intake_buffer_size(
                    IntakeKind::PricelistsIntake,
                    app.bus.queued(subjects::PRICELISTS_INTAKE),
                )
                .await;
            match decode_request::<IntakeRequest>(&msg.data) {
                Ok(request) => process_pricelists_intake(app, request).await,
                Err(err) => warn!(error = %err, "Malformed pricelists-intake request"),
            }
        }
    })
}

/// The open subjects. Stopping cancels every listener and waits for each to
/// acknowledge, once.
pub struct Listeners {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Listeners {
    /// The full query + intake surface, the `api` command's set.
    pub fn api(app: &Arc<App>) -> Listeners {
        let stop = CancellationToken::new();
        let handles = vec![
            reply_listener(app, subjects::STATUS, stop.clone(), handle_status),
            reply_listener(app, subjects::AUCTIONS, stop.clone(), handle_auctions),
            reply_listener(app, subjects::PRICE_LIST, stop.clone(), handle_price_list),
            reply_listener(
                app,
                subjects::PRICE_LIST_HISTORY,
                stop.clone(),
                handle_price_list_history,
            ),
            reply_listener(app, subjects::OWNERS_QUERY, stop.clone(), handle_owners_query),
            reply_listener(
                app,
                subjects::OWNERS_QUERY_BY_ITEMS,
                stop.clone(),
                handle_owners_query_by_items,
            ),
            reply_listener(app, subjects::ITEMS_QUERY, stop.clone(), handle_items_query),
            reply_listener(app, subjects::BOOT, stop.clone(), handle_boot),
            auctions_intake_listener(app, stop.clone()),
            pricelists_intake_listener(app, stop.clone()),
        ];
        Listeners { stop, handles }
    }

    /// The item-serving subset, the `prod-items` command's set.
    pub fn items(app: &Arc<App>) -> Listeners {
        let stop = CancellationToken::new();
        let handles = vec![
            reply_listener(app, subjects::BOOT, stop.clone(), handle_boot),
            reply_listener(app, subjects::ITEMS_QUERY, stop.clone(), handle_items_query),
            reply_listener(app, subjects::STATUS, stop.clone(), handle_status),
        ];
        Listeners { stop, handles }
    }

    pub async fn stop(self) {
        self.stop.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("All listeners stopped");
    }
}
