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

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use hyper::client::HttpConnector;
use hyper::header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING};
use hyper::{Body, Client, Method, Request};
use hyper_tls::HttpsConnector;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::auction::{ItemId, RealmInfo, RealmInfoFile};
use crate::error::{Error, Result};
use crate::items::Item;
use crate::metrics::Reporter;
use crate::region::{RealmStatusPayload, Region};
use crate::util::{gzip_decode, UnixTimestamp, UrlForRequest};

const OAUTH_TOKEN_ENDPOINT: &str = "https://oauth.battle.net/token";

#[derive(Deserialize)]
struct TokenPayload {
    access_token: String,
}

enum SourceKind {
    Http {
        client: Client<HttpsConnector<HttpConnector>>,
        api_key: String,
        // swapped whole on refresh; in-flight downloads keep the Arc they
        // captured at request start
        token: RwLock<Arc<str>>,
    },
    File {
        root: PathBuf,
    },
}

/// Where snapshots come from: the HTTP upstream in production, a fixture
/// directory for `api-test`. The collector is parametric in which.
pub struct SnapshotSource {
    kind: SourceKind,
    reporter: Reporter,
}

impl SnapshotSource {
    pub fn http(api_key: String, reporter: Reporter) -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder().build::<_, Body>(https);
        SnapshotSource {
            kind: SourceKind::Http {
                client,
                api_key,
                token: RwLock::new(Arc::from("")),
            },
            reporter,
        }
    }

    pub fn file(root: impl Into<PathBuf>, reporter: Reporter) -> Self {
        SnapshotSource {
            kind: SourceKind::File { root: root.into() },
            reporter,
        }
    }

    fn current_token(token: &RwLock<Arc<str>>) -> Arc<str> {
        Arc::clone(&token.read().expect("token lock"))
    }

    async fn http_get(
        client: &Client<HttpsConnector<HttpConnector>>,
        url: Url,
        bearer: Option<Arc<str>>,
    ) -> Result<Vec<u8>> {
        let mut builder = Request::builder()
            .url(url.clone())
            .map_err(|err| Error::transient(err))?
            .method(Method::GET)
            .header(ACCEPT_ENCODING, "gzip");
        if let Some(token) = bearer.filter(|token| !token.is_empty()) {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder
            .body(Body::empty())
            .map_err(|err| Error::transient(err))?;

        let response = client
            .request(request)
            .await
            .map_err(|err| Error::transient(err))?;
        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "upstream returned {} for {url}",
                response.status()
            )));
        }

        let compressed = response
            .headers()
            .get(CONTENT_ENCODING)
            .map(|value| value.as_bytes() == b"gzip")
            .unwrap_or(false);
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| Error::transient(err))?;

        if compressed {
            gzip_decode(&body).map_err(|err| Error::parse(format!("gzip body for {url}: {err}")))
        } else {
            Ok(body.to_vec())
        }
    }

    /// Swap the upstream credential. In-flight downloads keep using the one
    /// they started with.
    pub async fn refresh_token(&self) -> Result<()> {
        match &self.kind {
            SourceKind::File { .. } => Ok(()),
            SourceKind::Http {
                client,
                api_key,
                token,
            } => {
                let url = Url::parse_with_params(
                    OAUTH_TOKEN_ENDPOINT,
                    [
                        ("grant_type", "client_credentials"),
                        ("client_id", api_key.as_str()),
                    ],
                )
                .map_err(|err| Error::parse(err))?;

                let body = Self::http_get(client, url, None).await?;
                let payload: TokenPayload = serde_json::from_slice(&body)?;
                *token.write().expect("token lock") = Arc::from(payload.access_token.as_str());
                info!("Refreshed upstream access token");
                Ok(())
            }
        }
    }

    /// Realm-indexed manifest; the first `files[]` entry names the current
    /// snapshot and its upstream modification time.
    pub async fn get_realm_info(&self, region: &Region, slug: &str) -> Result<RealmInfoFile> {
        let body = match &self.kind {
            SourceKind::Http { client, token, .. } => {
                let url = Url::parse(&format!(
                    "https://{}/wow/auction/data/{slug}",
                    region.hostname
                ))
                .map_err(|err| Error::parse(err))?;
                Self::http_get(client, url, Some(Self::current_token(token))).await?
            }
            SourceKind::File { root } => {
                let path = root.join("auctions.json");
                let modified: UnixTimestamp = tokio::fs::metadata(&path)
                    .await?
                    .modified()
                    .map(UnixTimestamp::from)
                    .unwrap_or_default();
                return Ok(RealmInfoFile {
                    url: "auctions.json".to_owned(),
                    last_modified: modified.0,
                });
            }
        };

        let info: RealmInfo = serde_json::from_slice(&body)?;
        info.files
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse(format!("manifest for {slug} has no files")))
    }

    /// Full snapshot body, gzip handled transparently.
    pub async fn download_snapshot(&self, url: &str) -> Result<Vec<u8>> {
        let body = match &self.kind {
            SourceKind::Http { client, token, .. } => {
                let url = Url::parse(url).map_err(|err| Error::parse(err))?;
                Self::http_get(client, url, Some(Self::current_token(token))).await?
            }
            SourceKind::File { root } => tokio::fs::read(root.join(url)).await?,
        };

        debug!(url, bytes = body.len(), "Downloaded snapshot");
        self.reporter.report_ingress_bytes(url, body.len()).await;
        Ok(body)
    }

    /// Realm discovery for a region at boot.
    pub async fn get_realm_status(&self, region: &Region) -> Result<RealmStatusPayload> {
        let body = match &self.kind {
            SourceKind::Http { client, token, .. } => {
                let url = Url::parse(&format!("https://{}/wow/realm/status", region.hostname))
                    .map_err(|err| Error::parse(err))?;
                Self::http_get(client, url, Some(Self::current_token(token))).await?
            }
            SourceKind::File { root } => tokio::fs::read(root.join("realm-status.json")).await?,
        };

        serde_json::from_slice(&body).map_err(Error::from)
    }

    /// Item metadata for the items-store fill path.
    pub async fn get_item(&self, region: &Region, id: ItemId) -> Result<Item> {
        let body = match &self.kind {
            SourceKind::Http { client, token, .. } => {
                let url = Url::parse(&format!("https://{}/wow/item/{id}", region.hostname))
                    .map_err(|err| Error::parse(err))?;
                Self::http_get(client, url, Some(Self::current_token(token))).await?
            }
            SourceKind::File { root } => {
                tokio::fs::read(root.join("items").join(format!("{id}.json"))).await?
            }
        };

        let mut item: Item = serde_json::from_slice(&body)?;
        item.id = id;
        Ok(item)
    }
}
