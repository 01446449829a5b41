use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::auction::{self, AuctionId, FoldKey, ItemId, MiniAuction, OwnerName};
use crate::error::{Error, Result};
use crate::region::{RealmSlug, RegionName};
use crate::search;
use crate::util::UnixTimestamp;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub total_auctions: usize,
    pub owner_names: Vec<OwnerName>,
    pub item_ids: Vec<ItemId>,
}

/// One owner-query result; rank 0 is an exact (or prefix) hit.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OwnerMatch {
    pub owner: OwnerName,
    pub rank: i32,
}

/// What one `replace` changed, by symmetric difference on auction-id sets.
/// This is the only place churn is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChurnReport {
    pub new_auction_count: usize,
    pub removed_auction_count: usize,
    pub owner_count: usize,
    pub item_count: usize,
}

#[derive(Default)]
struct RealmSnapshot {
    list: Arc<Vec<MiniAuction>>,
    target_time: UnixTimestamp,
}

fn auction_ids(list: &[MiniAuction]) -> HashSet<AuctionId> {
    list.iter().flat_map(|mini| mini.auc_ids.iter().copied()).collect()
}

/// Current mini-auction snapshot per (region, realm). Writers serialize per
/// realm; readers take a snapshot handle under a short lock, so a replace
/// never tears a read and realms never block each other.
pub struct LiveAuctionsStore {
    realms: std::sync::RwLock<HashMap<(RegionName, RealmSlug), Arc<RwLock<RealmSnapshot>>>>,
}

impl Default for LiveAuctionsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveAuctionsStore {
    pub fn new() -> Self {
        LiveAuctionsStore {
            realms: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register a realm so reads on it return empty rather than not-found.
    pub fn ensure_realm(&self, region: &str, slug: &str) {
        self.realms
            .write()
            .expect("realms lock")
            .entry((region.to_owned(), slug.to_owned()))
            .or_default();
    }

    fn entry(&self, region: &str, slug: &str) -> Result<Arc<RwLock<RealmSnapshot>>> {
        self.realms
            .read()
            .expect("realms lock")
            .get(&(region.to_owned(), slug.to_owned()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no realm {region}/{slug}")))
    }

    fn entry_or_create(&self, region: &str, slug: &str) -> Arc<RwLock<RealmSnapshot>> {
        self.realms
            .write()
            .expect("realms lock")
            .entry((region.to_owned(), slug.to_owned()))
            .or_default()
            .clone()
    }

    /// Atomically swap a realm's snapshot. Rejects (without mutating) a list
    /// that folds two entries onto the same key.
    pub async fn replace(
        &self,
        region: &str,
        slug: &str,
        list: Vec<MiniAuction>,
        target_time: UnixTimestamp,
    ) -> Result<ChurnReport> {
        let mut keys: HashSet<FoldKey> = HashSet::with_capacity(list.len());
        for mini in &list {
            if !keys.insert(mini.fold_key()) {
                return Err(Error::invariant(format!(
                    "duplicate mini-auction key for item {} owner {} in {region}/{slug}",
                    mini.item_id, mini.owner
                )));
            }
        }

        let owner_count = auction::owner_names(&list).len();
        let item_count = auction::item_ids(&list).len();
        let incoming = auction_ids(&list);

        let entry = self.entry_or_create(region, slug);
        let mut snapshot = entry.write().await;
        let previous = auction_ids(&snapshot.list);

        let report = ChurnReport {
            new_auction_count: incoming.difference(&previous).count(),
            removed_auction_count: previous.difference(&incoming).count(),
            owner_count,
            item_count,
        };

        snapshot.list = Arc::new(list);
        snapshot.target_time = target_time;
        debug!(
            region,
            slug,
            new = report.new_auction_count,
            removed = report.removed_auction_count,
            "Replaced live auctions"
        );
        Ok(report)
    }

    /// Full snapshot read; the handle stays valid across later replaces.
    pub async fn get_mini_auctions(&self, region: &str, slug: &str) -> Result<Arc<Vec<MiniAuction>>> {
        let entry = self.entry(region, slug)?;
        let snapshot = entry.read().await;
        Ok(Arc::clone(&snapshot.list))
    }

    pub async fn target_time(&self, region: &str, slug: &str) -> Result<UnixTimestamp> {
        let entry = self.entry(region, slug)?;
        let snapshot = entry.read().await;
        Ok(snapshot.target_time)
    }

    pub async fn stats(&self, region: &str, slug: &str) -> Result<Stats> {
        let list = self.get_mini_auctions(region, slug).await?;
        Ok(Stats {
            total_auctions: auction::total_auctions(&list),
            owner_names: auction::owner_names(&list).into_iter().collect(),
            item_ids: auction::item_ids(&list).into_iter().collect(),
        })
    }

    /// Owners of the current snapshot matching `query`: case-insensitive
    /// prefix match, or fuzzy-ranked when `prefix_only` is off.
    pub async fn query_owners(
        &self,
        region: &str,
        slug: &str,
        query: &str,
        prefix_only: bool,
    ) -> Result<Vec<OwnerMatch>> {
        let list = self.get_mini_auctions(region, slug).await?;
        let owners = auction::owner_names(&list);

        if prefix_only {
            let needle = query.to_lowercase();
            return Ok(owners
                .into_iter()
                .filter(|owner| owner.to_lowercase().starts_with(&needle))
                .map(|owner| OwnerMatch { owner, rank: 0 })
                .collect());
        }

        Ok(search::rank_all(query, owners.iter().map(|owner| owner.as_str()))
            .into_iter()
            .map(|(owner, rank)| OwnerMatch { owner, rank })
            .collect())
    }
}
