//! Collaborator contracts consumed by the pipeline + their implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psvd_core::{
    Channel, Classification, Dataset, ItemsEnvelope, LabeledVideo, VideoRecord, VideoShape,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use thiserror::Error;

pub mod comments;
pub mod model;
pub mod youtube;

pub use comments::{group_comments, CommentCollection, CommentCollector, RawCommentResponses, VideoComments};
pub use model::{BranchFeatureEngineer, BranchModel, FusionClassifier, FusionModelLoader, FusionTrainer, FusionWeights};
pub use youtube::{CommentSource, YouTubeClient, YouTubeConfig, YouTubeError};

pub const CRATE_NAME: &str = "psvd-adapters";

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("data source {source_name} is unreachable: {reason}")]
    Unreachable { source_name: String, reason: String },
    #[error("querying data source {source_name}: {reason}")]
    Query { source_name: String, reason: String },
    #[error("decoding dataset from {source_name}: {reason}")]
    Decode { source_name: String, reason: String },
}

/// Where the training corpus comes from.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn describe(&self) -> String;

    async fn load(&self) -> Result<Dataset, DataSourceError>;
}

/// Fetches one video's metadata. `Ok(None)` means the API had nothing for
/// that ID.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, video_id: &str) -> Result<Option<VideoRecord>>;
}

pub trait FeatureEngineer: Send + Sync {
    fn prepare_inputs(&self, dataset: &Dataset, channel: Channel) -> Result<()>;

    fn finetune(&self, channel: Channel) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerHandle {
    pub weights_path: PathBuf,
    pub examples: usize,
    pub trained_at: DateTime<Utc>,
}

pub trait Trainer: Send + Sync {
    fn train(&self, dataset: &Dataset) -> Result<TrainerHandle>;
}

pub trait Classifier: Send + Sync {
    fn classify(&self, record: &VideoRecord) -> Result<Classification>;
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, weights_path: &Path) -> Result<Box<dyn Classifier>>;
}

/// Dataset stored as `{"items": [LabeledVideo, ...]}` on disk.
#[derive(Debug, Clone)]
pub struct JsonDataSource {
    path: PathBuf,
}

impl JsonDataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataSource for JsonDataSource {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    async fn load(&self) -> Result<Dataset, DataSourceError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| DataSourceError::Unreachable {
                source_name: self.describe(),
                reason: err.to_string(),
            })?;
        let envelope: ItemsEnvelope<LabeledVideo> =
            serde_json::from_str(&text).map_err(|err| DataSourceError::Decode {
                source_name: self.describe(),
                reason: err.to_string(),
            })?;
        Ok(Dataset {
            source: self.describe(),
            loaded_at: Utc::now(),
            examples: envelope.items,
        })
    }
}

/// Ground-truth table in Postgres. Expected columns: `id`, `label`,
/// `snippet`, `tags` (jsonb array), `transcript`, `comments` (jsonb array).
#[derive(Debug, Clone)]
pub struct PgDataSource {
    database_url: String,
    table: String,
}

impl PgDataSource {
    pub fn new(database_url: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            anyhow::bail!("invalid dataset table name {table:?}");
        }
        Ok(Self {
            database_url: database_url.into(),
            table,
        })
    }
}

#[async_trait]
impl DataSource for PgDataSource {
    fn describe(&self) -> String {
        format!("postgres:{}", self.table)
    }

    async fn load(&self) -> Result<Dataset, DataSourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await
            .map_err(|err| DataSourceError::Unreachable {
                source_name: self.describe(),
                reason: err.to_string(),
            })?;

        let sql = format!(
            "SELECT id, label, snippet, tags, transcript, comments FROM {} ORDER BY id",
            self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&pool)
            .await
            .map_err(|err| DataSourceError::Query {
                source_name: self.describe(),
                reason: err.to_string(),
            })?;

        let mut examples = Vec::with_capacity(rows.len());
        for row in rows {
            examples.push(labeled_video_from_row(&row).map_err(|err| DataSourceError::Decode {
                source_name: self.describe(),
                reason: format!("{err:#}"),
            })?);
        }
        pool.close().await;

        Ok(Dataset {
            source: self.describe(),
            loaded_at: Utc::now(),
            examples,
        })
    }
}

fn labeled_video_from_row(row: &sqlx::postgres::PgRow) -> Result<LabeledVideo> {
    let tags: Option<JsonValue> = row.try_get("tags")?;
    let comments: Option<JsonValue> = row.try_get("comments")?;
    Ok(LabeledVideo {
        id: row.try_get("id")?,
        label: row.try_get("label")?,
        snippet: row.try_get::<Option<String>, _>("snippet")?.unwrap_or_default(),
        tags: json_string_list(tags),
        transcript: row
            .try_get::<Option<String>, _>("transcript")?
            .unwrap_or_default(),
        comments: json_string_list(comments),
    })
}

fn json_string_list(value: Option<JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Parses a `{"items": [...]}` batch of video records, resolving each
/// record's identifier with `shape`.
pub fn parse_video_records(bytes: &[u8], shape: VideoShape) -> Result<Vec<VideoRecord>> {
    let envelope: ItemsEnvelope<JsonValue> =
        serde_json::from_slice(bytes).context("parsing video record batch")?;
    envelope
        .items
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            VideoRecord::from_value(raw, shape)
                .with_context(|| format!("video record at index {index}"))
        })
        .collect()
}
