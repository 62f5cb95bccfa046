//! Remote image fetching through the persistent store
//!
//! Downloaded bytes are cached raw (before resizing) under a `remote:` key, so
//! one download serves every target size until the entry expires.

use image::DynamicImage;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::TtlStore;
use crate::canvas::transform;

/// Prefix separating remote source keys from rendered output keys
pub const REMOTE_KEY_PREFIX: &str = "remote:";

/// Errors that can occur when fetching a remote image
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The downloaded bytes are not a decodable image
    #[error("Failed to decode image from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Upper bound on a single request, connect to last byte
    pub request_timeout: Duration,
    /// Accept TLS certificates that fail verification
    pub accept_invalid_certs: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }
}

/// Fetches remote images, consulting the store before the network
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    /// HTTP client for making requests
    http_client: Client,
    /// Store holding raw downloaded bytes
    store: TtlStore,
}

impl RemoteFetcher {
    /// Creates a fetcher with an HTTP client built from `config`
    pub fn new(store: TtlStore, config: &FetchConfig) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self::with_client(http_client, store))
    }

    /// Creates a fetcher with a custom HTTP client
    pub fn with_client(http_client: Client, store: TtlStore) -> Self {
        Self { http_client, store }
    }

    /// The store holding downloaded bytes
    pub fn store(&self) -> &TtlStore {
        &self.store
    }

    /// Store key for a source URL
    pub fn cache_key(url: &str) -> String {
        format!("{REMOTE_KEY_PREFIX}{url}")
    }

    /// Returns the image at `url` resized to `width` x `height`
    ///
    /// # Behavior
    /// - A live cache entry is decoded and resized without touching the network
    /// - A cache entry that fails to decode is logged and ignored; the record
    ///   stays until the live fetch below overwrites it
    /// - On a miss the image is downloaded and decoded, the raw bytes are
    ///   stored for `ttl` (a failed store is only logged), and the decoded
    ///   image is resized
    pub async fn fetch(
        &self,
        url: &str,
        width: u32,
        height: u32,
        ttl: Duration,
    ) -> Result<DynamicImage, FetchError> {
        let key = Self::cache_key(url);

        if let Some(cached) = self.store.get_async(&key).await {
            match image::load_from_memory(&cached) {
                Ok(img) => {
                    debug!(url, "remote image served from cache");
                    return Ok(transform::resize(img, width, height));
                }
                Err(e) => warn!(url, error = %e, "cached image failed to decode"),
            }
        }

        let bytes = self.download(url).await?;
        let img = image::load_from_memory(&bytes).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })?;

        if let Err(e) = self.store.put_async(&key, bytes, ttl).await {
            warn!(url, error = %e, "failed to cache remote image");
        }

        Ok(transform::resize(img, width, height))
    }

    /// Downloads the raw body at `url`
    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url, "downloading remote image");
        let response = self.http_client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
