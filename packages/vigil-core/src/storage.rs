//! Object storage for screenshots and grids.
//!
//! Blob keys embed a capture timestamp (`%y-%m-%d--%H--%M--%S`), and grid
//! composition depends on ordering by that *logical* timestamp rather than
//! the backend's creation time, so listing is a two-phase sort: newest N
//! descending, then ascending so grids read earliest-to-latest.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cloud_storage::{Client, ListRequest};
use futures::TryStreamExt;

use crate::error::{VigilError, VigilResult};
use crate::utils::url_stem;

/// Fixed-width timestamp embedded at the end of every screenshot key stem.
const KEY_TIMESTAMP_FORMAT: &str = "%y-%m-%d--%H--%M--%S";
const KEY_TIMESTAMP_LEN: usize = 20;

/// Blob storage interface consumed by the screenshot pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads a local file under the given blob key.
    async fn upload(&self, local_path: &Path, key: &str) -> VigilResult<()>;

    /// Returns public URLs for the `count` most recent screenshots of a
    /// stream, ordered earliest to latest.
    async fn recent_screenshot_urls(
        &self,
        stream_id: i64,
        count: usize,
    ) -> VigilResult<Vec<String>>;
}

/// Parses the logical capture timestamp out of a blob key or URL.
///
/// The sanitized stream name may itself contain dashes, so the stamp is
/// located from the end of the stem, where its width is fixed.
pub(crate) fn parse_key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let stem = url_stem(key);
    if stem.len() < KEY_TIMESTAMP_LEN {
        return None;
    }
    let (_, stamp) = stem.split_at(stem.len() - KEY_TIMESTAMP_LEN);
    NaiveDateTime::parse_from_str(stamp, KEY_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// A listed blob: key plus the backend's creation timestamp (the fallback
/// when the key carries no parseable stamp).
#[derive(Debug, Clone)]
pub(crate) struct BlobRecord {
    pub name: String,
    pub created: DateTime<Utc>,
}

impl BlobRecord {
    /// Sort key: logical timestamp (falling back to creation time), then the
    /// full key lexicographically as a stable tiebreaker within one second.
    fn sort_key(&self) -> (DateTime<Utc>, &str) {
        let ts = parse_key_timestamp(&self.name).unwrap_or(self.created);
        (ts, self.name.as_str())
    }
}

/// Picks the `count` most recent blobs, returning their keys in
/// chronological order (earliest first).
pub(crate) fn select_recent(mut records: Vec<BlobRecord>, count: usize) -> Vec<String> {
    records.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
    records.truncate(count);
    records.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    records.into_iter().map(|r| r.name).collect()
}

/// Google Cloud Storage implementation of [`ObjectStore`].
pub struct GcsStore {
    client: Client,
    bucket: String,
}

impl GcsStore {
    /// Builds a store from `GCS_CREDENTIALS_PATH` and `GCS_BUCKET_NAME`.
    ///
    /// Fails fast when either variable is missing so misconfiguration is
    /// caught at startup rather than on the first upload.
    pub fn from_env() -> VigilResult<Self> {
        let credentials = std::env::var("GCS_CREDENTIALS_PATH")
            .map_err(|_| VigilError::Config("GCS_CREDENTIALS_PATH is not set".into()))?;
        let bucket = std::env::var("GCS_BUCKET_NAME")
            .map_err(|_| VigilError::Config("GCS_BUCKET_NAME is not set".into()))?;
        if !Path::new(&credentials).exists() {
            return Err(VigilError::Config(format!(
                "GCS credentials file not found: {credentials}"
            )));
        }
        // The cloud-storage crate reads its service account path from
        // SERVICE_ACCOUNT; bridge our conventional variable over to it.
        if std::env::var("SERVICE_ACCOUNT").is_err() {
            std::env::set_var("SERVICE_ACCOUNT", &credentials);
        }
        Ok(Self {
            client: Client::default(),
            bucket,
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://storage.googleapis.com/{}/{}", self.bucket, key)
    }

    fn mime_for_key(key: &str) -> &'static str {
        match key.rsplit('.').next() {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("bmp") => "image/bmp",
            _ => "image/jpeg",
        }
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn upload(&self, local_path: &Path, key: &str) -> VigilResult<()> {
        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            VigilError::Upload(format!("cannot read {}: {e}", local_path.display()))
        })?;
        self.client
            .object()
            .create(&self.bucket, bytes, key, Self::mime_for_key(key))
            .await
            .map_err(|e| VigilError::Upload(format!("{key}: {e}")))?;
        log::debug!("[Storage] Uploaded {}", key);
        Ok(())
    }

    async fn recent_screenshot_urls(
        &self,
        stream_id: i64,
        count: usize,
    ) -> VigilResult<Vec<String>> {
        let request = ListRequest {
            prefix: Some(format!("screenshots/{stream_id}-")),
            ..Default::default()
        };
        let pages: Vec<_> = self
            .client
            .object()
            .list(&self.bucket, request)
            .await
            .map_err(|e| VigilError::Network(format!("blob listing failed: {e}")))?
            .try_collect()
            .await
            .map_err(|e| VigilError::Network(format!("blob listing failed: {e}")))?;

        let records: Vec<BlobRecord> = pages
            .into_iter()
            .flat_map(|page| page.items)
            .map(|object| BlobRecord {
                name: object.name,
                created: object.time_created,
            })
            .collect();

        Ok(select_recent(records, count)
            .into_iter()
            .map(|name| self.public_url(&name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(name: &str, created_secs: i64) -> BlobRecord {
        BlobRecord {
            name: name.to_string(),
            created: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    #[test]
    fn parses_trailing_timestamp() {
        let ts = parse_key_timestamp("screenshots/3-Front_Door-25-07-31--09--15--00.jpg")
            .expect("stamp parses");
        assert_eq!(ts.to_rfc3339(), "2025-07-31T09:15:00+00:00");
    }

    #[test]
    fn parses_timestamp_when_name_is_empty() {
        assert!(parse_key_timestamp("screenshots/3--25-07-31--09--15--00.jpg").is_some());
    }

    #[test]
    fn unparseable_key_yields_none() {
        assert!(parse_key_timestamp("screenshots/3-short.jpg").is_none());
        assert!(parse_key_timestamp("screenshots/3-Front_Door-not--a--real--stamp.jpg").is_none());
    }

    #[test]
    fn select_recent_orders_earliest_to_latest() {
        let records = vec![
            record("screenshots/1-Cam-25-07-31--09--15--03.jpg", 0),
            record("screenshots/1-Cam-25-07-31--09--15--01.jpg", 0),
            record("screenshots/1-Cam-25-07-31--09--15--05.jpg", 0),
            record("screenshots/1-Cam-25-07-31--09--15--02.jpg", 0),
        ];
        let names = select_recent(records, 3);
        assert_eq!(
            names,
            vec![
                "screenshots/1-Cam-25-07-31--09--15--02.jpg",
                "screenshots/1-Cam-25-07-31--09--15--03.jpg",
                "screenshots/1-Cam-25-07-31--09--15--05.jpg",
            ]
        );
    }

    #[test]
    fn select_recent_takes_newest_before_reordering() {
        let records = vec![
            record("screenshots/1-Cam-25-07-31--09--00--00.jpg", 0),
            record("screenshots/1-Cam-25-07-31--10--00--00.jpg", 0),
        ];
        let names = select_recent(records, 1);
        assert_eq!(names, vec!["screenshots/1-Cam-25-07-31--10--00--00.jpg"]);
    }

    #[test]
    fn equal_timestamps_break_ties_by_full_key() {
        let records = vec![
            record("screenshots/1-Cam-25-07-31--09--15--00.jpg", 0),
            record("screenshots/1-Cab-25-07-31--09--15--00.jpg", 0),
        ];
        let names = select_recent(records, 2);
        assert_eq!(
            names,
            vec![
                "screenshots/1-Cab-25-07-31--09--15--00.jpg",
                "screenshots/1-Cam-25-07-31--09--15--00.jpg",
            ]
        );
    }

    #[test]
    fn creation_time_is_the_fallback_ordering() {
        let records = vec![
            record("screenshots/1-newer.jpg", 200),
            record("screenshots/1-older.jpg", 100),
        ];
        let names = select_recent(records, 2);
        assert_eq!(
            names,
            vec!["screenshots/1-older.jpg", "screenshots/1-newer.jpg"]
        );
    }

    #[test]
    fn fewer_records_than_requested_returns_all() {
        let records = vec![record("screenshots/1-Cam-25-07-31--09--15--00.jpg", 0)];
        assert_eq!(select_recent(records, 6).len(), 1);
    }
}
