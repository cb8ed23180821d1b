//! Upstream stream metadata
//!
//! A [`MetadataProvider`] lists the quality variants a user's stream is
//! available in; [`select_source`] picks the one we relay.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};

/// One quality variant of a remote stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVariant {
    /// Playback path on the remote server
    #[serde(default, alias = "Play")]
    pub play: String,

    /// Auth token for the remote server
    #[serde(default, alias = "Token")]
    pub token: String,

    /// Connection endpoint (rtmp URL)
    #[serde(default, alias = "Connect")]
    pub connect: String,

    /// Reported bitrate, in the upstream's units
    #[serde(default, alias = "Bitrate")]
    pub bitrate: Option<f64>,
}

/// Source of stream metadata
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Fetch every quality variant currently offered for `identifier`
    ///
    /// An empty list means the stream is not live.
    async fn fetch_variants(&self, identifier: &str) -> Result<Vec<QualityVariant>>;
}

/// Pick the lowest-bitrate variant, or `None` if even that exceeds `max_bitrate`
///
/// A variant that reports no bitrate counts as bitrate `0`, so it wins over
/// every rated variant. Variants with a NaN or negative bitrate are never
/// selected.
pub fn select_source(variants: &[QualityVariant], max_bitrate: f64) -> Option<QualityVariant> {
    variants
        .iter()
        .filter_map(|v| match v.bitrate.unwrap_or(0.0) {
            b if b.is_finite() && b >= 0.0 => Some((b, v)),
            _ => None,
        })
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .filter(|(bitrate, _)| *bitrate <= max_bitrate)
        .map(|(_, v)| v.clone())
}

/// HTTP client for the upstream metadata API
pub struct UsherClient {
    client: Client,
    url_template: String,
}

impl UsherClient {
    /// Create a client; `url_template` must contain `{identifier}`
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::UpstreamUnavailable(format!("client setup: {}", e)))?;

        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        Self::new(config.url_template.clone(), config.timeout())
    }

    fn url_for(&self, identifier: &str) -> String {
        self.url_template
            .replace("{identifier}", &encode_path_segment(identifier))
    }
}

/// Percent-encode `segment` as a single URL path segment (`' '` → `%20`, `/` → `%2F`)
fn encode_path_segment(segment: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return segment.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(segment);
    }
    url.path().trim_start_matches('/').to_string()
}

#[async_trait]
impl MetadataProvider for UsherClient {
    async fn fetch_variants(&self, identifier: &str) -> Result<Vec<QualityVariant>> {
        let url = self.url_for(identifier);
        tracing::debug!(identifier = %identifier, url = %url, "Fetching stream metadata");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))?;

        response
            .json::<Vec<QualityVariant>>()
            .await
            .map_err(|e| RelayError::UpstreamUnavailable(format!("invalid metadata: {}", e)))
    }
}
