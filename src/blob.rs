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

use tracing::debug;

use crate::error::{Error, Result};

/// Bucket/object storage over the local filesystem, rooted at the cache
/// dir. Buckets are directories, objects are files; writes go through a
/// temp file and a rename so readers never observe a torn object.
///
/// Content type and encoding are part of the object-store call surface; the
/// filesystem backend carries them in the object name suffix only.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        BlobStore { root: root.into() }
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.bucket_path(bucket).join(name)
    }

    pub async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.bucket_path(bucket))
            .await
            .map_err(Error::from)
    }

    pub async fn exists(&self, bucket: &str, name: &str) -> bool {
        tokio::fs::try_exists(self.object_path(bucket, name))
            .await
            .unwrap_or(false)
    }

    pub async fn read(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, name);
        tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("no object {bucket}/{name}"))
            } else {
                Error::from(err)
            }
        })
    }

    pub async fn write(
        &self,
        bucket: &str,
        name: &str,
        body: &[u8],
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        debug!(
            bucket,
            name,
            bytes = body.len(),
            content_type,
            content_encoding,
            "Writing object"
        );
        self.ensure_bucket(bucket).await?;

        let path = self.object_path(bucket, name);
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    pub async fn delete(&self, bucket: &str, name: &str) -> Result<()> {
        tokio::fs::remove_file(self.object_path(bucket, name))
            .await
            .map_err(Error::from)
    }

    pub async fn rename(&self, bucket: &str, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(self.object_path(bucket, from), self.object_path(bucket, to))
            .await
            .map_err(Error::from)
    }

    /// Object names under a bucket matching a prefix, sorted.
    pub async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let path = self.bucket_path(bucket);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::from(err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && !name.ends_with(".tmp") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
