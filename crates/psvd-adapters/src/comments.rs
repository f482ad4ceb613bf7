//! Resumable comment collection for a list of video IDs.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::fs;
use tracing::{info, warn};

use crate::youtube::{CommentSource, YouTubeError};

/// `{"comments": [{"<video id>": <commentThreads response>}, ...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCommentResponses {
    pub comments: Vec<BTreeMap<String, JsonValue>>,
}

impl RawCommentResponses {
    pub fn completed_ids(&self) -> HashSet<String> {
        self.comments
            .iter()
            .flat_map(|entry| entry.keys().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoComments {
    pub comments: Vec<String>,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentCollection {
    pub fetched: usize,
    pub already_completed: usize,
    pub failed: usize,
}

pub struct CommentCollector<'a> {
    source: &'a dyn CommentSource,
    raw_path: PathBuf,
    delay: Duration,
}

impl<'a> CommentCollector<'a> {
    pub fn new(source: &'a dyn CommentSource, raw_path: impl Into<PathBuf>, delay: Duration) -> Self {
        Self {
            source,
            raw_path: raw_path.into(),
            delay,
        }
    }

    pub async fn load_raw(&self) -> Result<RawCommentResponses> {
        match fs::read_to_string(&self.raw_path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", self.raw_path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(RawCommentResponses::default())
            }
            Err(err) => {
                Err(err).with_context(|| format!("reading {}", self.raw_path.display()))
            }
        }
    }

    /// Requests comment threads for every ID not already present in the raw
    /// responses file. The file is rewritten after each video so an
    /// interrupted run picks up where it stopped.
    pub async fn collect(&self, video_ids: &[String]) -> Result<CommentCollection> {
        let mut raw = self.load_raw().await?;
        let mut completed = raw.completed_ids();
        let mut summary = CommentCollection::default();

        for video_id in video_ids {
            if completed.contains(video_id) {
                info!(video_id = %video_id, "already scraped");
                summary.already_completed += 1;
                continue;
            }

            let started = Instant::now();
            let (response, pace) = match self.source.comment_threads(video_id).await {
                Ok(response) => {
                    summary.fetched += 1;
                    (response, !self.delay.is_zero())
                }
                Err(YouTubeError::Fetch(err)) if err.status().is_some() => {
                    warn!(video_id = %video_id, error = %err, "comment request failed; recording noComments");
                    summary.failed += 1;
                    (json!({ "noComments": [] }), false)
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("fetching comments for {video_id}"));
                }
            };

            raw.comments
                .push(BTreeMap::from([(video_id.clone(), response)]));
            self.persist(&raw).await?;
            completed.insert(video_id.clone());
            info!(
                video_id = %video_id,
                seconds = started.elapsed().as_secs_f64(),
                "wrote comments to JSON"
            );

            // only successful requests count against the quota
            if pace {
                tokio::time::sleep(self.delay).await;
            }
        }

        Ok(summary)
    }

    async fn persist(&self, raw: &RawCommentResponses) -> Result<()> {
        if let Some(parent) = self.raw_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(raw).context("serializing comment responses")?;
        fs::write(&self.raw_path, bytes)
            .await
            .with_context(|| format!("writing {}", self.raw_path.display()))
    }
}

/// Top-level comment texts grouped per video, sorted by video ID. Videos with
/// no comments (or a `noComments` marker) are left out.
pub fn group_comments(raw: &RawCommentResponses) -> Vec<VideoComments> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in &raw.comments {
        for (video_id, response) in entry {
            if response.get("noComments").is_some() {
                continue;
            }
            let Some(items) = response.get("items").and_then(JsonValue::as_array) else {
                continue;
            };
            for item in items {
                let text = item
                    .pointer("/snippet/topLevelComment/snippet/textOriginal")
                    .and_then(JsonValue::as_str);
                if let Some(text) = text {
                    grouped
                        .entry(video_id.clone())
                        .or_default()
                        .push(text.to_string());
                }
            }
        }
    }

    grouped
        .into_iter()
        .map(|(id, comments)| VideoComments { comments, id })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use psvd_storage::FetchError;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct ScriptedSource {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommentSource for ScriptedSource {
        async fn comment_threads(&self, video_id: &str) -> Result<JsonValue, YouTubeError> {
            self.calls.lock().unwrap().push(video_id.to_string());
            if video_id.starts_with("disabled") {
                return Err(YouTubeError::Fetch(FetchError::HttpStatus {
                    status: 403,
                    endpoint: "youtube.commentThreads".into(),
                }));
            }
            Ok(thread_response(&[&format!("first on {video_id}")]))
        }
    }

    fn thread_response(texts: &[&str]) -> JsonValue {
        let items: Vec<_> = texts
            .iter()
            .map(|t| json!({"snippet": {"topLevelComment": {"id": "c", "snippet": {"textOriginal": t}}}}))
            .collect();
        json!({ "items": items })
    }

    #[tokio::test]
    async fn collection_resumes_and_records_failures() {
        let dir = tempdir().unwrap();
        let raw_path = dir.path().join("fetchedComments/raw_comment_responses.json");
        let source = ScriptedSource {
            calls: Mutex::new(Vec::new()),
        };
        let collector = CommentCollector::new(&source, &raw_path, Duration::ZERO);

        let ids = vec!["a".to_string(), "disabled".to_string()];
        let first = collector.collect(&ids).await.unwrap();
        assert_eq!(first.fetched, 1);
        assert_eq!(first.failed, 1);

        let ids = vec!["a".to_string(), "disabled".to_string(), "b".to_string()];
        let second = collector.collect(&ids).await.unwrap();
        assert_eq!(second.already_completed, 2);
        assert_eq!(second.fetched, 1);
        assert_eq!(*source.calls.lock().unwrap(), ["a", "disabled", "b"]);

        let raw = collector.load_raw().await.unwrap();
        assert_eq!(raw.comments.len(), 3);
        assert_eq!(raw.comments[1]["disabled"], json!({"noComments": []}));
    }

    #[tokio::test]
    async fn delay_follows_successful_requests_only() {
        let dir = tempdir().unwrap();
        let raw_path = dir.path().join("fetchedComments/raw_comment_responses.json");
        let source = ScriptedSource {
            calls: Mutex::new(Vec::new()),
        };
        let delay = Duration::from_millis(400);
        let collector = CommentCollector::new(&source, &raw_path, delay);

        let started = Instant::now();
        let failed = collector
            .collect(&["disabled1".to_string(), "disabled2".to_string()])
            .await
            .unwrap();
        assert_eq!(failed.failed, 2);
        assert!(started.elapsed() < delay);

        let started = Instant::now();
        let fetched = collector.collect(&["ok".to_string()]).await.unwrap();
        assert_eq!(fetched.fetched, 1);
        assert!(started.elapsed() >= delay);
    }

    #[test]
    fn grouping_skips_empty_and_disabled_videos() {
        let raw = RawCommentResponses {
            comments: vec![
                BTreeMap::from([("z".to_string(), thread_response(&["one", "two"]))]),
                BTreeMap::from([("off".to_string(), json!({"noComments": []}))]),
                BTreeMap::from([("empty".to_string(), json!({"items": []}))]),
                BTreeMap::from([("a".to_string(), thread_response(&["three"]))]),
            ],
        };

        let grouped = group_comments(&raw);
        assert_eq!(
            grouped,
            vec![
                VideoComments {
                    comments: vec!["three".into()],
                    id: "a".into()
                },
                VideoComments {
                    comments: vec!["one".into(), "two".into()],
                    id: "z".into()
                },
            ]
        );
    }
}
