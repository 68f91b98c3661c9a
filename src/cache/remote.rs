// src/cache/remote.rs

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::CacheError;
use crate::fingerprint::Fingerprint;

/// Media type of a packed cache entry on the wire.
pub const ARTIFACT_CONTENT_TYPE: &str = "application/vnd.kiln.build-cache-artifact.v1";

pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// A shared cache tier reached over the network.
///
/// Implementations bound every call by their own timeout and map transport
/// failures to [`CacheError::Io`] or [`CacheError::Timeout`].
pub trait RemoteCache: Send + Sync {
    /// `Ok(None)` when the remote has no entry for `key`.
    fn load<'a>(&'a self, key: &'a Fingerprint) -> RemoteFuture<'a, Option<Vec<u8>>>;

    fn store<'a>(&'a self, key: &'a Fingerprint, archive: Vec<u8>) -> RemoteFuture<'a, ()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct RemoteCredentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// HTTP remote: `GET`/`PUT {base}/cache/{hex}`.
///
/// `404` on `GET` is a miss; any 2xx is success.
#[derive(Debug, Clone)]
pub struct HttpRemoteCache {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<RemoteCredentials>,
    timeout: Duration,
}

impl HttpRemoteCache {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Io(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
            timeout,
        })
    }

    pub fn with_credentials(mut self, credentials: RemoteCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn url(&self, key: &Fingerprint) -> String {
        format!("{}/cache/{}", self.base_url, key.to_hex())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(c) => request.basic_auth(&c.username, c.password.as_ref()),
            None => request,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> CacheError {
        if err.is_timeout() {
            CacheError::Timeout(self.timeout)
        } else {
            CacheError::Io(err.to_string())
        }
    }

    async fn fetch(&self, key: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError> {
        let url = self.url(key);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(url = %url, "remote cache miss");
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CacheError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        debug!(url = %url, bytes = body.len(), "remote cache hit");
        Ok(Some(body.to_vec()))
    }

    async fn upload(&self, key: &Fingerprint, archive: Vec<u8>) -> Result<(), CacheError> {
        let url = self.url(key);
        let bytes = archive.len();
        let response = self
            .authorize(self.client.put(&url))
            .header(CONTENT_TYPE, ARTIFACT_CONTENT_TYPE)
            .body(archive)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CacheError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        debug!(url = %url, bytes, "stored remote cache entry");
        Ok(())
    }
}

impl RemoteCache for HttpRemoteCache {
    fn load<'a>(&'a self, key: &'a Fingerprint) -> RemoteFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.fetch(key))
                .await
                .unwrap_or(Err(CacheError::Timeout(self.timeout)))
        })
    }

    fn store<'a>(&'a self, key: &'a Fingerprint, archive: Vec<u8>) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.upload(key, archive))
                .await
                .unwrap_or(Err(CacheError::Timeout(self.timeout)))
        })
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
