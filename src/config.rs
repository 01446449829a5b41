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

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::region::{Region, RegionName, RealmSlug};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub api_key: String,
    pub regions: Vec<Region>,
    /// Per-region realm filter. A region with no entry (or an explicit null)
    /// admits all realms; an empty list admits none.
    #[serde(default)]
    pub whitelist: HashMap<RegionName, Option<Vec<RealmSlug>>>,
    pub cache_dir: String,
    #[serde(default)]
    pub use_cache_dir: bool,
    #[serde(default)]
    pub use_blob_store: bool,
    #[serde(default)]
    pub item_classes: Vec<ItemClass>,
    #[serde(default)]
    pub expansions: Vec<Expansion>,
    #[serde(default)]
    pub professions: Vec<Profession>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ItemClass {
    pub class: i64,
    pub name: String,
    #[serde(default)]
    pub subclasses: Vec<ItemSubClass>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ItemSubClass {
    pub subclass: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Expansion {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profession {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub icon: String,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        info!(path = %path.display(), "Reading config");

        let body = std::fs::read(path)
            .with_context(|| format!("could not read config at {}", path.display()))?;
        let config: Config = serde_json::from_slice(&body)
            .with_context(|| format!("could not parse config at {}", path.display()))?;
        Ok(config)
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|reg| reg.name == name)
    }

    /// Whether a region has any realms admitted at all. An explicit empty
    /// whitelist shuts the region off entirely.
    pub fn region_enabled(&self, region: &str) -> bool {
        match self.whitelist.get(region) {
            Some(Some(slugs)) => !slugs.is_empty(),
            _ => true,
        }
    }

    pub fn realm_whitelisted(&self, region: &str, slug: &str) -> bool {
        match self.whitelist.get(region) {
            Some(Some(slugs)) => slugs.iter().any(|s| s == slug),
            // absent entry or explicit null: all realms
            _ => true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(body: &str) -> Config {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn absent_whitelist_admits_all_realms() {
        let config = parse(
            r#"{
                "api_key": "k",
                "regions": [{"name": "us", "hostname": "us.api.example.test"}],
                "cache_dir": "/tmp/goldwatch"
            }"#,
        );

        assert!(config.region_enabled("us"));
        assert!(config.realm_whitelisted("us", "earthen-ring"));
    }

    #[test]
    fn null_whitelist_admits_all_realms() {
        let config = parse(
            r#"{
                "api_key": "k",
                "regions": [{"name": "us", "hostname": "us.api.example.test"}],
                "whitelist": {"us": null},
                "cache_dir": "/tmp/goldwatch"
            }"#,
        );

        assert!(config.region_enabled("us"));
        assert!(config.realm_whitelisted("us", "anything"));
    }

    #[test]
    fn empty_whitelist_admits_no_realms() {
        let config = parse(
            r#"{
                "api_key": "k",
                "regions": [{"name": "us", "hostname": "us.api.example.test"}],
                "whitelist": {"us": []},
                "cache_dir": "/tmp/goldwatch"
            }"#,
        );

        assert!(!config.region_enabled("us"));
        assert!(!config.realm_whitelisted("us", "earthen-ring"));
    }

    #[test]
    fn listed_whitelist_admits_only_listed_realms() {
        let config = parse(
            r#"{
                "api_key": "k",
                "regions": [{"name": "us", "hostname": "us.api.example.test"}],
                "whitelist": {"us": ["earthen-ring"]},
                "cache_dir": "/tmp/goldwatch"
            }"#,
        );

        assert!(config.region_enabled("us"));
        assert!(config.realm_whitelisted("us", "earthen-ring"));
        assert!(!config.realm_whitelisted("us", "tichondrius"));
    }
}
