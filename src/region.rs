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

use serde::{Deserialize, Serialize};

use crate::util::UnixTimestamp;

pub type RegionName = String;
pub type RealmSlug = String;

/// Top-level partition of realms. Immutable after configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Region {
    pub name: RegionName,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Realm {
    pub region_name: RegionName,
    pub slug: RealmSlug,
    pub display_name: String,
    /// Upstream-reported epoch second of the most recent snapshot.
    #[serde(default)]
    pub last_modified: i64,
}

/// Upstream realm-status envelope: `{ "realms": [{ "name": .., "slug": .. }] }`.
#[derive(Debug, Deserialize, Serialize)]
pub struct RealmStatusPayload {
    pub realms: Vec<RealmStatusEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RealmStatusEntry {
    pub name: String,
    pub slug: RealmSlug,
}

/// A region together with its discovered realms.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub region: Region,
    pub realms: Vec<Realm>,
}

impl Status {
    pub fn new(region: Region, payload: RealmStatusPayload) -> Self {
        let realms = payload
            .realms
            .into_iter()
            .map(|entry| Realm {
                region_name: region.name.clone(),
                slug: entry.slug,
                display_name: entry.name,
                last_modified: 0,
            })
            .collect();

        Status { region, realms }
    }

    pub fn realm(&self, slug: &str) -> Option<&Realm> {
        self.realms.iter().find(|rea| rea.slug == slug)
    }
}

/// Epoch seconds observed by the collector for one realm, advanced only
/// forward.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RealmModificationDates {
    pub downloaded: UnixTimestamp,
    pub live_auctions_received: UnixTimestamp,
    pub pricelist_histories_received: UnixTimestamp,
}

impl RealmModificationDates {
    fn advance(slot: &mut UnixTimestamp, observed: UnixTimestamp) {
        if observed > *slot {
            *slot = observed;
        }
    }

    pub fn observe_downloaded(&mut self, observed: UnixTimestamp) {
        Self::advance(&mut self.downloaded, observed);
    }

    pub fn observe_live_auctions_received(&mut self, observed: UnixTimestamp) {
        Self::advance(&mut self.live_auctions_received, observed);
    }

    pub fn observe_pricelist_histories_received(&mut self, observed: UnixTimestamp) {
        Self::advance(&mut self.pricelist_histories_received, observed);
    }
}

/// Modification dates for every known realm, keyed region → slug.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegionRealmModificationDates(
    pub HashMap<RegionName, HashMap<RealmSlug, RealmModificationDates>>,
);

impl RegionRealmModificationDates {
    pub fn get(&self, region: &str, slug: &str) -> RealmModificationDates {
        self.0
            .get(region)
            .and_then(|realms| realms.get(slug))
            .copied()
            .unwrap_or_default()
    }

    pub fn entry(&mut self, region: &str, slug: &str) -> &mut RealmModificationDates {
        self.0
            .entry(region.to_owned())
            .or_default()
            .entry(slug.to_owned())
            .or_default()
    }
}
