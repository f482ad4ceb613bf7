//! YouTube Data API v3 client: video details for audits, comment threads for
//! the comment collector.

use anyhow::Result;
use async_trait::async_trait;
use psvd_core::{VideoRecord, VideoShape};
use psvd_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use crate::Downloader;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Error)]
pub enum YouTubeError {
    #[error("YOUTUBE_DATA_API_KEY is not set; the YouTube Data API cannot be called")]
    MissingCredential,
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone)]
pub struct YouTubeConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub comment_page_size: u32,
    pub http: HttpClientConfig,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_API_BASE.to_string(),
            comment_page_size: 100,
            http: HttpClientConfig::default(),
        }
    }
}

/// Source of raw `commentThreads` responses.
#[async_trait]
pub trait CommentSource: Send + Sync {
    async fn comment_threads(&self, video_id: &str) -> Result<JsonValue, YouTubeError>;
}

/// The credential is only checked when a request is made, so stages that
/// never touch the API run without one.
#[derive(Debug)]
pub struct YouTubeClient {
    http: HttpFetcher,
    api_key: Option<String>,
    base_url: String,
    comment_page_size: String,
}

impl YouTubeClient {
    pub fn new(config: YouTubeConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            api_key: config.api_key.filter(|k| !k.trim().is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            comment_page_size: config.comment_page_size.to_string(),
        })
    }

    fn api_key(&self) -> Result<&str, YouTubeError> {
        self.api_key.as_deref().ok_or(YouTubeError::MissingCredential)
    }

    /// Raw `videos.list` item for one ID, or `None` if the API returned no
    /// item (deleted, private or unknown video).
    pub async fn video(&self, video_id: &str) -> Result<Option<JsonValue>, YouTubeError> {
        let key = self.api_key()?;
        let url = format!("{}/videos", self.base_url);
        let response = match self
            .http
            .fetch_json(
                "youtube.videos",
                &url,
                &[
                    ("part", "snippet,contentDetails,statistics"),
                    ("id", video_id),
                    ("key", key),
                ],
            )
            .await
        {
            Ok(response) => response,
            Err(err) if err.status() == Some(404) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(first_item(response))
    }
}

fn first_item(mut response: JsonValue) -> Option<JsonValue> {
    response
        .get_mut("items")
        .and_then(JsonValue::as_array_mut)
        .filter(|items| !items.is_empty())
        .map(|items| items.swap_remove(0))
}

#[async_trait]
impl Downloader for YouTubeClient {
    async fn download(&self, video_id: &str) -> Result<Option<VideoRecord>> {
        let Some(raw) = self.video(video_id).await? else {
            debug!(video_id, "videos.list returned no items");
            return Ok(None);
        };
        Ok(Some(VideoRecord::from_value(raw, VideoShape::TopLevelId)?))
    }
}

#[async_trait]
impl CommentSource for YouTubeClient {
    async fn comment_threads(&self, video_id: &str) -> Result<JsonValue, YouTubeError> {
        let key = self.api_key()?;
        let url = format!("{}/commentThreads", self.base_url);
        Ok(self
            .http
            .fetch_json(
                "youtube.commentThreads",
                &url,
                &[
                    ("part", "snippet,replies"),
                    ("videoId", video_id),
                    ("maxResults", self.comment_page_size.as_str()),
                    ("key", key),
                ],
            )
            .await?)
    }
}
