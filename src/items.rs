// Goldwatch - an auction house data service
// Copyright (C) 2023 Goldwatch contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::auction::ItemId;
use crate::error::{Error, Result};
use crate::kv::SortedBytesStore;
use crate::util::{gzip_decode, gzip_encode};

const ITEM_KEY_PREFIX: &str = "item-";
const DEFAULT_ICON_URL_FORMAT: &str = "https://render-us.worldofwarcraft.com/icons/56";

/// Item metadata as upstream reports it (camelCase aliases) and as this
/// service stores it. Created on first sighting; only the icon URL is ever
/// filled in afterwards; never destroyed.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub normalized_name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub icon_url: String,
    #[serde(default, alias = "itemClass")]
    pub item_class: i64,
    #[serde(default, alias = "itemSubClass")]
    pub item_sub_class: i64,
    #[serde(default, alias = "inventoryType")]
    pub inventory_type: i64,
    #[serde(default, alias = "itemLevel")]
    pub item_level: i64,
    #[serde(default)]
    pub quality: i64,
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn default_icon_url(icon: &str) -> String {
    format!("{DEFAULT_ICON_URL_FORMAT}/{icon}.jpg")
}

impl Item {
    /// Fill the derived fields an upstream payload does not carry.
    pub fn normalize(&mut self) {
        self.normalized_name = normalize_name(&self.name);
        if self.icon_url.is_empty() && !self.icon.is_empty() {
            self.icon_url = default_icon_url(&self.icon);
        }
    }
}

/// Two tiers: the sorted-bytes store persists `item-<id>` → gzip-encoded
/// JSON, and an in-memory cache serves the read-mostly query side. Single
/// writer (the collector), many readers (bus handlers).
pub struct ItemsStore {
    db: SortedBytesStore,
    cache: RwLock<HashMap<ItemId, Item>>,
}

fn item_key(id: ItemId) -> Vec<u8> {
    format!("{ITEM_KEY_PREFIX}{id}").into_bytes()
}

fn parse_item_key(key: &[u8]) -> Result<ItemId> {
    std::str::from_utf8(key)
        .ok()
        .and_then(|key| key.strip_prefix(ITEM_KEY_PREFIX))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| Error::corrupt(format!("malformed item key {key:?}")))
}

impl ItemsStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = ItemsStore {
            db: SortedBytesStore::open(path.as_ref()).await?,
            cache: RwLock::new(HashMap::new()),
        };

        let items = store.get_items().await?;
        info!(items = items.len(), "Warmed items cache");
        Ok(store)
    }

    /// Rebuild the cache from the persistent tier and return the full map.
    pub async fn get_items(&self) -> Result<HashMap<ItemId, Item>> {
        let mut items = HashMap::new();
        self.db
            .for_each(|key, value| {
                let id = parse_item_key(key)?;
                let body = gzip_decode(value).map_err(|err| Error::corrupt(err))?;
                let item: Item = serde_json::from_slice(&body)
                    .map_err(|err| Error::corrupt(format!("item {id}: {err}")))?;
                items.insert(id, item);
                Ok(())
            })
            .await?;

        *self.cache.write().await = items.clone();
        Ok(items)
    }

    /// Only the entries actually present; absent ids are simply omitted.
    pub async fn find_items(&self, ids: &[ItemId]) -> HashMap<ItemId, Item> {
        let cache = self.cache.read().await;
        ids.iter()
            .filter_map(|id| cache.get(id).map(|item| (*id, item.clone())))
            .collect()
    }

    /// Ids not yet stored, bounding the collector's outbound metadata
    /// fetches.
    pub async fn filter_new(&self, ids: impl IntoIterator<Item = ItemId>) -> Vec<ItemId> {
        let cache = self.cache.read().await;
        ids.into_iter().filter(|id| !cache.contains_key(id)).collect()
    }

    /// Write-through persist: derived fields are filled, the persistent
    /// tier is updated, then the cache.
    pub async fn persist(&self, items: Vec<Item>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        info!(items = items.len(), "Persisting items");

        let mut batch = Vec::with_capacity(items.len());
        let mut normalized = Vec::with_capacity(items.len());
        for mut item in items {
            item.normalize();
            let body = serde_json::to_vec(&item)?;
            batch.push((item_key(item.id), gzip_encode(&body)?));
            normalized.push(item);
        }
        self.db.put_batch(batch).await?;

        let mut cache = self.cache.write().await;
        for item in normalized {
            cache.insert(item.id, item);
        }
        Ok(())
    }

    /// Snapshot of the cache for query handlers.
    pub async fn cached(&self) -> HashMap<ItemId, Item> {
        self.cache.read().await.clone()
    }
}
