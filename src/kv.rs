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

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::Engine;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::util::{gzip_decode, gzip_encode};

/// Persistent sorted map over raw byte keys. Read view, batched writes and
/// ordered iteration; values are opaque. The whole map persists as one
/// gzip-compressed file of `base64(key)\tbase64(value)` lines, rewritten
/// atomically on each batch — the read-mostly single-writer usage the items
/// store needs.
#[derive(Debug)]
pub struct SortedBytesStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl SortedBytesStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(body) => Self::decode(&body)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(Error::from(err)),
        };
        info!(path = %path.display(), entries = entries.len(), "Opened sorted-bytes store");

        Ok(SortedBytesStore {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn decode(body: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let text = gzip_decode(body).map_err(|err| Error::corrupt(err))?;
        let text = String::from_utf8(text).map_err(|err| Error::corrupt(err))?;

        let engine = base64::engine::general_purpose::STANDARD;
        let mut entries = BTreeMap::new();
        for line in text.lines().filter(|line| !line.is_empty()) {
            let (key, value) = line
                .split_once('\t')
                .ok_or_else(|| Error::corrupt(format!("line without separator: {line:?}")))?;
            entries.insert(
                engine.decode(key).map_err(|err| Error::corrupt(err))?,
                engine.decode(value).map_err(|err| Error::corrupt(err))?,
            );
        }
        Ok(entries)
    }

    fn encode(entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<Vec<u8>> {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut text = String::new();
        for (key, value) in entries {
            text.push_str(&engine.encode(key));
            text.push('\t');
            text.push_str(&engine.encode(value));
            text.push('\n');
        }
        gzip_encode(text.as_bytes()).map_err(Error::from)
    }

    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &[u8]) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Apply a batch of puts and flush. The map mutates only after the new
    /// file content has replaced the old one.
    pub async fn put_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut entries = self.entries.write().await;

        let mut next = entries.clone();
        for (key, value) in batch {
            next.insert(key, value);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, Self::encode(&next)?).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        *entries = next;
        Ok(())
    }

    /// Visit every entry in key order.
    pub async fn for_each<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for (key, value) in self.entries.read().await.iter() {
            visit(key, value)?;
        }
        Ok(())
    }
}
