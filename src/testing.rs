//! Shared test scaffolding: a fully wired [`App`] over temp directories and
//! the file-backed snapshot source.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::blob::BlobStore;
use crate::bus::Bus;
use crate::config::{Config, ItemClass};
use crate::items::ItemsStore;
use crate::live_auctions::LiveAuctionsStore;
use crate::metrics::Reporter;
use crate::price_history::PriceHistoryStore;
use crate::region::{Realm, Region, Status};
use crate::source::SnapshotSource;
use crate::App;

pub fn test_region() -> Region {
    Region {
        name: "us".to_owned(),
        hostname: "us.api.example.test".to_owned(),
    }
}

pub fn test_config(cache_dir: &Path) -> Config {
    Config {
        api_key: "test-key".to_owned(),
        regions: vec![test_region()],
        whitelist: HashMap::new(),
        cache_dir: cache_dir.to_string_lossy().into_owned(),
        use_cache_dir: true,
        use_blob_store: false,
        item_classes: vec![ItemClass {
            class: 0,
            name: "Consumable".to_owned(),
            subclasses: Vec::new(),
        }],
        expansions: Vec::new(),
        professions: Vec::new(),
    }
}

async fn build_app(dir: &tempfile::TempDir) -> Arc<App> {
    let fixtures = dir.path().join("fixtures");
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(&fixtures).unwrap();
    std::fs::create_dir_all(&cache).unwrap();

    let config = test_config(&cache);
    let bus = Bus::connect();
    let reporter = Reporter::new(bus.clone());
    let source = SnapshotSource::file(&fixtures, reporter.clone());
    let blob = BlobStore::filesystem(&cache);
    let items = ItemsStore::open(cache.join("items.db.gz")).await.unwrap();

    let region = test_region();
    let status = Status {
        region: region.clone(),
        realms: vec![Realm {
            region_name: region.name.clone(),
            slug: "earthen-ring".to_owned(),
            display_name: "Earthen Ring".to_owned(),
            last_modified: 0,
        }],
    };

    Arc::new(App {
        config,
        bus,
        reporter,
        source,
        live_auctions: LiveAuctionsStore::new(),
        price_histories: PriceHistoryStore::new(blob.clone()),
        items,
        blob,
        statuses: std::sync::RwLock::new(HashMap::from([(region.name, status)])),
        modification_dates: std::sync::RwLock::new(Default::default()),
    })
}

/// An app with one region and one known realm, no data anywhere.
pub async fn empty_app() -> (tempfile::TempDir, Arc<App>) {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(&dir).await;
    (dir, app)
}

/// An app whose file source serves a small upstream: a realm status, a
/// two-listing snapshot for item 10 and that item's metadata.
pub async fn fixture_app() -> (tempfile::TempDir, Arc<App>) {
    let dir = tempfile::tempdir().unwrap();
    let fixtures = dir.path().join("fixtures");
    std::fs::create_dir_all(fixtures.join("items")).unwrap();

    std::fs::write(
        fixtures.join("realm-status.json"),
        r#"{"realms": [{"name": "Earthen Ring", "slug": "earthen-ring"}]}"#,
    )
    .unwrap();
    std::fs::write(
        fixtures.join("auctions.json"),
        r#"{
            "realms": [{"name": "Earthen Ring", "slug": "earthen-ring"}],
            "auctions": [
                {"auc": 1, "item": 10, "owner": "A", "ownerRealm": "Earthen Ring",
                 "bid": 5, "buyout": 10, "quantity": 1, "timeLeft": "LONG",
                 "rand": 0, "seed": 0, "context": 0},
                {"auc": 2, "item": 10, "owner": "A", "ownerRealm": "Earthen Ring",
                 "bid": 5, "buyout": 10, "quantity": 1, "timeLeft": "LONG",
                 "rand": 0, "seed": 0, "context": 0}
            ]
        }"#,
    )
    .unwrap();
    std::fs::write(
        fixtures.join("items/10.json"),
        r#"{"id": 10, "name": "Copper Ore", "icon": "inv_ore_copper_01"}"#,
    )
    .unwrap();

    let app = build_app(&dir).await;
    app.live_auctions.ensure_realm("us", "earthen-ring");
    (dir, app)
}
