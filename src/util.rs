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

use std::io::{Read, Write};
use std::ops::{Add, Sub};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::http::request::Builder;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use url::Url;

// Sadly need to use Url for url encoding, since hypers uri does not have that capability
pub trait UrlForRequest {
    fn url(self, url: Url) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl UrlForRequest for Builder {
    fn url(self, url: Url) -> anyhow::Result<Self> {
        Ok(self.uri(Uri::from_str(url.as_str())?))
    }
}

pub fn gzip_encode(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

pub fn gzip_decode(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Second-resolution epoch timestamp, the unit every upstream manifest and
/// every persisted shard name speaks.
#[derive(
    Debug, Default, Deserialize, Serialize, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash,
)]
pub struct UnixTimestamp(pub i64);

impl UnixTimestamp {
    pub fn now() -> Self {
        UnixTimestamp::from(SystemTime::now())
    }

    /// UTC midnight of the day this timestamp falls in.
    pub fn normalized_day(&self) -> Self {
        UnixTimestamp(self.0.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY)
    }

    pub fn to_utc_string(&self) -> String {
        match Utc.timestamp_opt(self.0, 0) {
            chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
            _ => format!("@{}", self.0),
        }
    }
}

impl From<SystemTime> for UnixTimestamp {
    fn from(value: SystemTime) -> Self {
        // Pre-epoch mtimes clamp to zero
        UnixTimestamp(
            value
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        )
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        UnixTimestamp(self.0 + rhs.as_secs() as i64)
    }
}

impl Sub<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        UnixTimestamp(self.0 - rhs.as_secs() as i64)
    }
}
