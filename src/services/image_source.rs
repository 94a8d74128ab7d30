use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::curation::{SourceFilter, SourceImage};
use crate::services::providers::{ImageSource, ProviderError};

const CIVITAI_IMAGES_URL: &str = "https://civitai.com/api/v1/images";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard page cap of the public images endpoint.
const MAX_PAGE_SIZE: usize = 200;

/// Trending images from the Civitai public API.
pub struct CivitaiClient {
    http: Client,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesPage {
    #[serde(default)]
    items: Vec<CivitaiImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CivitaiImage {
    id: u64,
    url: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    nsfw: Option<bool>,
    #[serde(default)]
    nsfw_level: Option<serde_json::Value>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    stats: Option<CivitaiStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CivitaiStats {
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    heart_count: u64,
    #[serde(default)]
    laugh_count: u64,
    #[serde(default)]
    cry_count: u64,
}

impl CivitaiImage {
    /// `nsfwLevel` is a string ("None", "Soft", ...) on older responses and a
    /// numeric bitmask (1 = safe) on newer ones.
    fn is_nsfw(&self) -> bool {
        if self.nsfw == Some(true) {
            return true;
        }
        match &self.nsfw_level {
            Some(serde_json::Value::String(level)) => !level.eq_ignore_ascii_case("none"),
            Some(serde_json::Value::Number(level)) => level.as_u64().is_some_and(|l| l > 1),
            _ => false,
        }
    }
}

impl CivitaiClient {
    pub fn new(api_key: Option<String>) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, api_key })
    }
}

#[async_trait]
impl ImageSource for CivitaiClient {
    async fn fetch_trending_images(&self, filter: &SourceFilter) -> Result<Vec<SourceImage>, ProviderError> {
        let limit = filter.limit.clamp(1, MAX_PAGE_SIZE).to_string();
        let mut request = self.http.get(CIVITAI_IMAGES_URL).query(&[
            ("limit", limit.as_str()),
            ("period", filter.period.as_str()),
            ("sort", filter.sort.as_str()),
            ("nsfw", if filter.allow_nsfw { "X" } else { "None" }),
        ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        parse_images(&body, filter.allow_nsfw)
    }
}

/// Decode an images page. NSFW entries are dropped unless allowed, even when
/// the query already asked the API to exclude them.
pub fn parse_images(body: &str, allow_nsfw: bool) -> Result<Vec<SourceImage>, ProviderError> {
    let page: ImagesPage = serde_json::from_str(body)?;

    Ok(page
        .items
        .into_iter()
        .filter(|img| allow_nsfw || !img.is_nsfw())
        .filter(|img| !img.url.is_empty())
        .map(|img| {
            let stats = img.stats.unwrap_or_default();
            SourceImage {
                source_id: img.id.to_string(),
                url: img.url,
                width: img.width,
                height: img.height,
                author: img.username,
                reactions: stats.like_count + stats.heart_count + stats.laugh_count + stats.cry_count,
            }
        })
        .collect())
}
