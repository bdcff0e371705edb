use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::trace;

use crate::Error;
use crate::query::RequestDescriptor;

#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Non-2xx responses become [`Error::Status`] carrying the body text.
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::Status {
            status: self.status,
            body: String::from_utf8_lossy(&self.body).into_owned(),
        })
    }
}

/// Issues GET requests for descriptors. Production uses [`HttpTransport`];
/// tests script responses in memory.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(&self, request: &RequestDescriptor) -> Result<RawResponse, Error>;
}

/// reqwest-backed transport that decorates every request with the access key
/// header.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        access_key: Option<(&str, &str)>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        if let Some((name, key)) = access_key {
            let name = HeaderName::try_from(name)?;
            let mut value = HeaderValue::from_str(key)?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(HttpTransport {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &RequestDescriptor) -> Result<RawResponse, Error> {
        let url = request.url(&self.base_url)?;
        trace!(%url, "GET");
        let res = self.client.get(url.clone()).send().await?;
        let status = res.status().as_u16();
        let body = res.bytes().await.map_err(|err| {
            Error::Transport(format!("reading {status} body from {url}: {err}"))
        })?;
        Ok(RawResponse { status, body })
    }
}
