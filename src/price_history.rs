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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auction::{ItemId, MiniAuction};
use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::util::{gzip_decode, gzip_encode, UnixTimestamp, SECONDS_PER_DAY};

/// Per-item aggregate over one snapshot. Zero-buyout listings count toward
/// volume but not toward the buyout aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct ItemPrice {
    pub min_buyout: u64,
    pub max_buyout: u64,
    pub average_buyout: f64,
    pub median_buyout: f64,
    pub volume: u64,
}

pub type PriceHistory = BTreeMap<UnixTimestamp, ItemPrice>;
pub type ItemPriceHistories = BTreeMap<ItemId, PriceHistory>;

/// Derive per-item prices from a snapshot's mini-auctions. Each listing
/// weighs in once per underlying auction id.
pub fn item_prices(list: &[MiniAuction]) -> BTreeMap<ItemId, ItemPrice> {
    let mut buyouts: BTreeMap<ItemId, Vec<u64>> = BTreeMap::new();
    let mut volumes: BTreeMap<ItemId, u64> = BTreeMap::new();

    for mini in list {
        let weight = mini.auc_ids.len() as u64;
        *volumes.entry(mini.item_id).or_default() += mini.quantity * weight;
        if mini.buyout > 0 {
            buyouts
                .entry(mini.item_id)
                .or_default()
                .extend(std::iter::repeat(mini.buyout).take(mini.auc_ids.len()));
        }
    }

    volumes
        .into_iter()
        .map(|(id, volume)| {
            let mut values = buyouts.remove(&id).unwrap_or_default();
            values.sort_unstable();

            let price = if values.is_empty() {
                ItemPrice {
                    volume,
                    ..ItemPrice::default()
                }
            } else {
                let total: u64 = values.iter().sum();
                let median = if values.len() % 2 == 1 {
                    values[values.len() / 2] as f64
                } else {
                    (values[values.len() / 2 - 1] + values[values.len() / 2]) as f64 / 2.0
                };
                ItemPrice {
                    min_buyout: values[0],
                    max_buyout: values[values.len() - 1],
                    average_buyout: total as f64 / values.len() as f64,
                    median_buyout: median,
                    volume,
                }
            };
            (id, price)
        })
        .collect()
}

/// Shard codec: one `<item_id>\t<base64(json(history))>` line per item,
/// gzip-compressed. Base64 keeps tabs and newlines out of the payload.
pub fn encode_histories(histories: &ItemPriceHistories) -> Result<Vec<u8>> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut text = String::new();
    for (id, history) in histories {
        text.push_str(&id.to_string());
        text.push('\t');
        text.push_str(&engine.encode(serde_json::to_vec(history)?));
        text.push('\n');
    }
    gzip_encode(text.as_bytes()).map_err(Error::from)
}

pub fn decode_histories(body: &[u8]) -> Result<ItemPriceHistories> {
    let text = gzip_decode(body).map_err(|err| Error::corrupt(err))?;
    let text = String::from_utf8(text).map_err(|err| Error::corrupt(err))?;

    let engine = base64::engine::general_purpose::STANDARD;
    let mut histories = ItemPriceHistories::new();
    for line in text.lines().filter(|line| !line.is_empty()) {
        let (id, encoded) = line
            .split_once('\t')
            .ok_or_else(|| Error::corrupt(format!("shard line without separator: {line:?}")))?;
        let id: ItemId = id
            .parse()
            .map_err(|_| Error::corrupt(format!("shard line with bad item id: {line:?}")))?;
        let body = engine
            .decode(encoded)
            .map_err(|err| Error::corrupt(format!("item {id}: {err}")))?;
        let history: PriceHistory = serde_json::from_slice(&body)
            .map_err(|err| Error::corrupt(format!("item {id}: {err}")))?;
        histories.insert(id, history);
    }
    Ok(histories)
}

fn shard_name(day: UnixTimestamp) -> String {
    format!("{}.txt.gz", day.0)
}

fn parse_shard_name(name: &str) -> Option<UnixTimestamp> {
    name.strip_suffix(".txt.gz")
        .and_then(|day| day.parse().ok())
        .map(UnixTimestamp)
}

/// Append-only per-item time series, sharded by (region, realm, UTC day).
/// One writer per realm; readers and the writer coordinate on a per-shard
/// lock, and a reader may still observe the pre-write shard state.
pub struct PriceHistoryStore {
    blob: BlobStore,
    shard_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PriceHistoryStore {
    pub fn new(blob: BlobStore) -> Self {
        PriceHistoryStore {
            blob,
            shard_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn bucket(region: &str, slug: &str) -> String {
        format!("pricelist-histories/{region}/{slug}")
    }

    fn shard_lock(&self, bucket: &str, name: &str) -> Arc<Mutex<()>> {
        self.shard_locks
            .lock()
            .expect("shard locks")
            .entry(format!("{bucket}/{name}"))
            .or_default()
            .clone()
    }

    /// Load a shard, quarantining it and starting fresh when it no longer
    /// decodes. Ingestion continues either way.
    async fn load_or_quarantine(&self, bucket: &str, name: &str) -> Result<ItemPriceHistories> {
        let body = match self.blob.read(bucket, name).await {
            Ok(body) => body,
            Err(Error::NotFound(_)) => return Ok(ItemPriceHistories::new()),
            Err(err) => return Err(err),
        };

        match decode_histories(&body) {
            Ok(histories) => Ok(histories),
            Err(err) => {
                let quarantined = format!("{name}.corrupt-{}", Uuid::new_v4());
                warn!(bucket, name, quarantined, error = %err, "Quarantining corrupt shard");
                self.blob.rename(bucket, name, &quarantined).await?;
                Ok(ItemPriceHistories::new())
            }
        }
    }

    /// Merge one snapshot's prices into the day shard of `target_time`.
    /// Repeat appends for the same timestamp overwrite in place.
    pub async fn append(
        &self,
        region: &str,
        slug: &str,
        target_time: UnixTimestamp,
        iprices: &BTreeMap<ItemId, ItemPrice>,
    ) -> Result<UnixTimestamp> {
        let day = target_time.normalized_day();
        let bucket = Self::bucket(region, slug);
        let name = shard_name(day);

        let lock = self.shard_lock(&bucket, &name);
        let _guard = lock.lock().await;

        let mut histories = self.load_or_quarantine(&bucket, &name).await?;
        for (id, price) in iprices {
            histories.entry(*id).or_default().insert(target_time, *price);
        }

        let body = encode_histories(&histories)?;
        self.blob
            .write(&bucket, &name, &body, "text/plain", Some("gzip"))
            .await?;
        Ok(day)
    }

    /// Timestamps for one item across the shards intersecting `[from, to]`.
    pub async fn get_price_history(
        &self,
        region: &str,
        slug: &str,
        item: ItemId,
        from: UnixTimestamp,
        to: UnixTimestamp,
    ) -> Result<PriceHistory> {
        let bucket = Self::bucket(region, slug);
        let mut out = PriceHistory::new();

        for name in self.blob.list(&bucket, "").await? {
            let Some(day) = parse_shard_name(&name) else {
                continue;
            };
            if day > to || UnixTimestamp(day.0 + SECONDS_PER_DAY) <= from {
                continue;
            }

            let lock = self.shard_lock(&bucket, &name);
            let _guard = lock.lock().await;
            let body = match self.blob.read(&bucket, &name).await {
                Ok(body) => body,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let histories = match decode_histories(&body) {
                Ok(histories) => histories,
                Err(err) => {
                    warn!(bucket, name, error = %err, "Skipping unreadable shard");
                    continue;
                }
            };

            if let Some(history) = histories.get(&item) {
                out.extend(
                    history
                        .iter()
                        .filter(|(ts, _)| **ts >= from && **ts <= to)
                        .map(|(ts, price)| (*ts, *price)),
                );
            }
        }
        Ok(out)
    }

    /// Shard-day timestamps currently present for a realm.
    pub async fn list_shard_timestamps(&self, region: &str, slug: &str) -> Result<Vec<UnixTimestamp>> {
        let bucket = Self::bucket(region, slug);
        Ok(self
            .blob
            .list(&bucket, "")
            .await?
            .iter()
            .filter_map(|name| parse_shard_name(name))
            .collect())
    }

    /// Remove shards whose day is strictly before `older_than`.
    pub async fn drop_expired(
        &self,
        region: &str,
        slug: &str,
        older_than: UnixTimestamp,
    ) -> Result<usize> {
        let bucket = Self::bucket(region, slug);
        let mut dropped = 0;
        for name in self.blob.list(&bucket, "").await? {
            let Some(day) = parse_shard_name(&name) else {
                continue;
            };
            if day >= older_than {
                continue;
            }

            let lock = self.shard_lock(&bucket, &name);
            let _guard = lock.lock().await;
            self.blob.delete(&bucket, &name).await?;
            dropped += 1;
        }

        if dropped > 0 {
            info!(region, slug, dropped, "Dropped expired price-history shards");
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auction::fixtures::raw;
    use crate::auction::minimize;

    fn store() -> (tempfile::TempDir, PriceHistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceHistoryStore::new(BlobStore::filesystem(dir.path()));
        (dir, store)
    }

    fn price(value: u64, volume: u64) -> ItemPrice {
        ItemPrice {
            min_buyout: value,
            max_buyout: value,
            average_buyout: value as f64,
            median_buyout: value as f64,
            volume,
        }
    }

    #[test]
    fn prices_weigh_each_underlying_listing() {
        let minis = minimize(&[raw(1, 10, "A", 10), raw(2, 10, "A", 10)]);
        let prices = item_prices(&minis);

        assert_eq!(prices[&10], price(10, 2));
    }

    #[test]
    fn price_aggregates_across_differing_listings() {
        let minis = minimize(&[raw(1, 10, "A", 10), raw(2, 10, "B", 30), raw(3, 10, "C", 20)]);
        let aggregated = item_prices(&minis)[&10];

        assert_eq!(aggregated.min_buyout, 10);
        assert_eq!(aggregated.max_buyout, 30);
        assert_eq!(aggregated.average_buyout, 20.0);
        assert_eq!(aggregated.median_buyout, 20.0);
        assert_eq!(aggregated.volume, 3);

        // even-sized population takes the midpoint
        let minis = minimize(&[raw(1, 10, "A", 10), raw(2, 10, "B", 30)]);
        assert_eq!(item_prices(&minis)[&10].median_buyout, 20.0);
    }

    #[test]
    fn zero_buyouts_count_toward_volume_only() {
        let minis = minimize(&[raw(1, 10, "A", 0), raw(2, 10, "B", 40)]);
        let aggregated = item_prices(&minis)[&10];

        assert_eq!(aggregated.volume, 2);
        assert_eq!(aggregated.min_buyout, 40);
        assert_eq!(aggregated.average_buyout, 40.0);
    }

    #[test]
    fn shard_codec_round_trips() {
        let mut histories = ItemPriceHistories::new();
        histories
            .entry(10)
            .or_default()
            .insert(UnixTimestamp(1_700_000_000), price(10, 2));
        histories
            .entry(11)
            .or_default()
            .insert(UnixTimestamp(1_700_000_600), price(55, 7));

        let encoded = encode_histories(&histories).unwrap();
        assert_eq!(decode_histories(&encoded).unwrap(), histories);

        // empty round-trips too
        let empty = ItemPriceHistories::new();
        assert_eq!(decode_histories(&encode_histories(&empty).unwrap()).unwrap(), empty);
    }

    #[test]
    fn garbage_shards_decode_as_corrupt() {
        assert!(matches!(
            decode_histories(b"junk").unwrap_err(),
            Error::Corrupt(_)
        ));

        let text = gzip_encode(b"no-separator-here\n").unwrap();
        assert!(matches!(decode_histories(&text).unwrap_err(), Error::Corrupt(_)));
    }

    #[tokio::test]
    async fn appended_prices_come_back_in_range_queries() {
        let (_dir, store) = store();
        let ts = UnixTimestamp(1_700_000_000);
        let prices = BTreeMap::from([(10, price(10, 2))]);

        store.append("us", "earthen-ring", ts, &prices).await.unwrap();

        let history = store
            .get_price_history(
                "us",
                "earthen-ring",
                10,
                UnixTimestamp(1_699_000_000),
                UnixTimestamp(1_701_000_000),
            )
            .await
            .unwrap();
        assert_eq!(history, PriceHistory::from([(ts, price(10, 2))]));

        // outside the bounds nothing comes back
        let history = store
            .get_price_history(
                "us",
                "earthen-ring",
                10,
                UnixTimestamp(1_700_000_001),
                UnixTimestamp(1_701_000_000),
            )
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn append_is_idempotent_in_target_time() {
        let (_dir, store) = store();
        let ts = UnixTimestamp(1_700_000_000);
        let prices = BTreeMap::from([(10, price(10, 2))]);

        store.append("us", "earthen-ring", ts, &prices).await.unwrap();
        let bucket = PriceHistoryStore::bucket("us", "earthen-ring");
        let name = shard_name(ts.normalized_day());
        let first = store.blob.read(&bucket, &name).await.unwrap();

        store.append("us", "earthen-ring", ts, &prices).await.unwrap();
        let second = store.blob.read(&bucket, &name).await.unwrap();
        assert_eq!(
            decode_histories(&first).unwrap(),
            decode_histories(&second).unwrap()
        );

        let history = store
            .get_price_history("us", "earthen-ring", 10, UnixTimestamp(0), UnixTimestamp(i64::MAX))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn same_day_appends_share_a_shard() {
        let (_dir, store) = store();
        let first = UnixTimestamp(1_700_000_000);
        let second = first + std::time::Duration::from_secs(1200);

        store
            .append("us", "earthen-ring", first, &BTreeMap::from([(10, price(10, 2))]))
            .await
            .unwrap();
        store
            .append("us", "earthen-ring", second, &BTreeMap::from([(10, price(12, 3))]))
            .await
            .unwrap();

        assert_eq!(
            store.list_shard_timestamps("us", "earthen-ring").await.unwrap(),
            vec![first.normalized_day()]
        );
        let history = store
            .get_price_history("us", "earthen-ring", 10, UnixTimestamp(0), UnixTimestamp(i64::MAX))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_shards_are_quarantined_and_ingestion_continues() {
        let (_dir, store) = store();
        let ts = UnixTimestamp(1_700_000_000);
        let bucket = PriceHistoryStore::bucket("us", "earthen-ring");
        let name = shard_name(ts.normalized_day());

        store
            .blob
            .write(&bucket, &name, b"definitely not gzip", "text/plain", Some("gzip"))
            .await
            .unwrap();

        store
            .append("us", "earthen-ring", ts, &BTreeMap::from([(10, price(10, 2))]))
            .await
            .unwrap();

        // the bad shard moved aside, the fresh one reads back clean
        let names = store.blob.list(&bucket, "").await.unwrap();
        assert!(names.iter().any(|n| n.contains(".corrupt-")));
        let history = store
            .get_price_history("us", "earthen-ring", 10, UnixTimestamp(0), UnixTimestamp(i64::MAX))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn drop_expired_removes_only_strictly_older_days() {
        let (_dir, store) = store();
        let old_day = UnixTimestamp(1_700_000_000).normalized_day();
        let new_day = UnixTimestamp(old_day.0 + 3 * SECONDS_PER_DAY);

        store
            .append("us", "earthen-ring", old_day, &BTreeMap::from([(10, price(10, 1))]))
            .await
            .unwrap();
        store
            .append("us", "earthen-ring", new_day, &BTreeMap::from([(10, price(12, 1))]))
            .await
            .unwrap();

        let dropped = store
            .drop_expired("us", "earthen-ring", new_day.normalized_day())
            .await
            .unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(
            store.list_shard_timestamps("us", "earthen-ring").await.unwrap(),
            vec![new_day.normalized_day()]
        );

        // dropping at the same horizon again is a no-op
        let dropped = store
            .drop_expired("us", "earthen-ring", new_day.normalized_day())
            .await
            .unwrap();
        assert_eq!(dropped, 0);
    }
}
