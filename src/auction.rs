use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::region::RealmSlug;

pub type ItemId = u64;
pub type AuctionId = u64;
pub type OwnerName = String;

/// Upstream realm-data manifest: `{ "files": [{ "url": .., "lastModified": .. }] }`.
#[derive(Debug, Deserialize, Serialize)]
pub struct RealmInfo {
    pub files: Vec<RealmInfoFile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealmInfoFile {
    pub url: String,
    #[serde(rename = "lastModified")]
    pub last_modified: i64,
}

/// One complete upstream snapshot for a realm.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SnapshotPayload {
    #[serde(default)]
    pub realms: Vec<SnapshotRealm>,
    #[serde(default)]
    pub auctions: Vec<RawAuction>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SnapshotRealm {
    pub name: String,
    pub slug: RealmSlug,
}

/// One listing as upstream reports it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawAuction {
    pub auc: AuctionId,
    pub item: ItemId,
    #[serde(default)]
    pub owner: OwnerName,
    #[serde(rename = "ownerRealm", default)]
    pub owner_realm: String,
    pub bid: u64,
    pub buyout: u64,
    pub quantity: u64,
    #[serde(rename = "timeLeft", default)]
    pub time_left: String,
    #[serde(default)]
    pub rand: i64,
    #[serde(default)]
    pub seed: i64,
    #[serde(default)]
    pub context: i64,
}

/// Listings folded by everything except the auction id. `auc_ids` carries
/// the underlying listing identifiers.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MiniAuction {
    pub item_id: ItemId,
    pub owner: OwnerName,
    pub bid: u64,
    pub buyout: u64,
    pub quantity: u64,
    pub time_left: String,
    pub auc_ids: Vec<AuctionId>,
}

impl MiniAuction {
    pub fn fold_key(&self) -> FoldKey {
        (
            self.item_id,
            self.owner.clone(),
            self.bid,
            self.buyout,
            self.quantity,
            self.time_left.clone(),
        )
    }
}

pub type FoldKey = (ItemId, OwnerName, u64, u64, u64, String);

/// Collapse raw listings into mini-auctions. Output order is first
/// appearance of each fold key, which makes the function deterministic for
/// identical input without callers being allowed to rely on any order.
pub fn minimize(raw: &[RawAuction]) -> Vec<MiniAuction> {
    let mut index: HashMap<FoldKey, usize> = HashMap::new();
    let mut out: Vec<MiniAuction> = Vec::new();

    for auction in raw {
        let key: FoldKey = (
            auction.item,
            auction.owner.clone(),
            auction.bid,
            auction.buyout,
            auction.quantity,
            auction.time_left.clone(),
        );
        match index.get(&key) {
            Some(&at) => out[at].auc_ids.push(auction.auc),
            None => {
                index.insert(key, out.len());
                out.push(MiniAuction {
                    item_id: auction.item,
                    owner: auction.owner.clone(),
                    bid: auction.bid,
                    buyout: auction.buyout,
                    quantity: auction.quantity,
                    time_left: auction.time_left.clone(),
                    auc_ids: vec![auction.auc],
                });
            }
        }
    }

    out
}

pub fn item_ids(list: &[MiniAuction]) -> BTreeSet<ItemId> {
    list.iter().map(|mini| mini.item_id).collect()
}

pub fn owner_names(list: &[MiniAuction]) -> BTreeSet<OwnerName> {
    list.iter().map(|mini| mini.owner.clone()).collect()
}

pub fn total_auctions(list: &[MiniAuction]) -> usize {
    list.iter().map(|mini| mini.auc_ids.len()).sum()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn raw(auc: AuctionId, item: ItemId, owner: &str, buyout: u64) -> RawAuction {
        RawAuction {
            auc,
            item,
            owner: owner.to_owned(),
            owner_realm: "Earthen Ring".to_owned(),
            bid: 5,
            buyout,
            quantity: 1,
            time_left: "LONG".to_owned(),
            rand: 0,
            seed: 0,
            context: 0,
        }
    }
}
