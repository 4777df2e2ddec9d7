//! Client side of the durable append-only stream service.
//!
//! The service exposes one log per key over HTTP: `PUT` creates it (409 when
//! it already exists), `POST` appends a JSON array of records atomically and
//! in order, `GET` returns every record as a JSON array.
//!
//! A key maps to `<base>/v1/stream/<namespace>/<name>`. The name after the
//! first `/` is sent as a single percent-encoded path segment, so session ids
//! containing `/`, `?`, `#` or `%` still address their own stream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::error::StreamError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// An append-only, per-key log.
#[async_trait]
pub trait DurableStream: Send + Sync {
    /// Create the log for `key`. Returns [`StreamError::Conflict`] if it exists.
    async fn create(&self, key: &str) -> Result<(), StreamError>;

    /// Append pre-serialized JSON records, in order, as one write.
    async fn append(&self, key: &str, records: &[String]) -> Result<(), StreamError>;

    /// Read every record of `key`, oldest first.
    async fn read(&self, key: &str) -> Result<Vec<String>, StreamError>;
}

pub struct HttpStreamClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpStreamClient {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, StreamError> {
        let base = base_url.as_ref();
        let base_url = Url::parse(base)
            .map_err(|e| StreamError::InvalidUrl(format!("{}: {}", base, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StreamError::InvalidUrl(format!("{}: not a base url", base)));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, key: &str) -> Result<Url, StreamError> {
        let (namespace, name) = match key.split_once('/') {
            Some((namespace, name)) => (namespace, Some(name)),
            None => (key, None),
        };
        for segment in std::iter::once(namespace).chain(name) {
            // `.` and `..` would be dropped from the path instead of encoded
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StreamError::InvalidUrl(format!(
                    "stream key {:?} has no addressable path",
                    key
                )));
            }
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StreamError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["v1", "stream", namespace])
            .extend(name);
        Ok(url)
    }
}

/// Turn a non-success response into a [`StreamError::Status`]
async fn check_status(key: &str, resp: reqwest::Response) -> Result<reqwest::Response, StreamError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(StreamError::Status {
        key: key.to_string(),
        status: status.as_u16(),
        message,
    })
}

/// Join pre-serialized records into one JSON array body
fn batch_body(records: &[String]) -> String {
    let mut body = String::with_capacity(records.iter().map(|r| r.len() + 1).sum::<usize>() + 2);
    body.push('[');
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            body.push(',');
        }
        body.push_str(record);
    }
    body.push(']');
    body
}

#[async_trait]
impl DurableStream for HttpStreamClient {
    async fn create(&self, key: &str) -> Result<(), StreamError> {
        let resp = self
            .client
            .put(self.url(key)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(StreamError::Conflict(key.to_string()));
        }
        check_status(key, resp).await?;
        tracing::debug!(key, "created stream");
        Ok(())
    }

    async fn append(&self, key: &str, records: &[String]) -> Result<(), StreamError> {
        if records.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.url(key)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(batch_body(records))
            .send()
            .await?;
        check_status(key, resp).await?;
        tracing::trace!(key, count = records.len(), "appended records");
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<String>, StreamError> {
        let resp = self.client.get(self.url(key)?).send().await?;
        let resp = check_status(key, resp).await?;
        let values: Vec<serde_json::Value> = serde_json::from_str(&resp.text().await?)?;
        Ok(values.iter().map(|v| v.to_string()).collect())
    }
}
