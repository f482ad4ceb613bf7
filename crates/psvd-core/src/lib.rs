//! Core domain model for the pseudoscientific video detection pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "psvd-core";

/// Label written for audit slots whose video could not be downloaded.
pub const UNAVAILABLE_LABEL: &str = "unavailable";

/// A CLI-selectable unit of pipeline work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageTarget {
    Clean,
    Data,
    Comments,
    FineTune,
    Train,
    Audit,
    All,
    Test,
}

impl StageTarget {
    pub const GRANULAR: [StageTarget; 6] = [
        StageTarget::Clean,
        StageTarget::Data,
        StageTarget::Comments,
        StageTarget::FineTune,
        StageTarget::Train,
        StageTarget::Audit,
    ];

    /// Parses a CLI token. Matching is case-insensitive, so `fineTune` and
    /// `finetune` are the same target.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "clean" => Some(Self::Clean),
            "data" => Some(Self::Data),
            "comments" => Some(Self::Comments),
            "finetune" => Some(Self::FineTune),
            "train" => Some(Self::Train),
            "audit" => Some(Self::Audit),
            "all" => Some(Self::All),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Data => "data",
            Self::Comments => "comments",
            Self::FineTune => "finetune",
            Self::Train => "train",
            Self::Audit => "audit",
            Self::All => "all",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for StageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text input channel feeding one branch of the fusion network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "video_snippet")]
    Snippet,
    #[serde(rename = "video_tags")]
    Tags,
    #[serde(rename = "video_transcript")]
    Transcript,
    #[serde(rename = "video_comments")]
    Comments,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Snippet,
        Channel::Tags,
        Channel::Transcript,
        Channel::Comments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snippet => "video_snippet",
            Self::Tags => "video_tags",
            Self::Transcript => "video_transcript",
            Self::Comments => "video_comments",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record keeps its identifier. Resolved once when the record is
/// ingested; consumers never re-inspect the JSON to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoShape {
    /// `videos.list` item: identifier at top-level `id`.
    TopLevelId,
    /// Playlist-style item: identifier at `contentDetails.videoId`.
    NestedContentDetails,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("video record is not a JSON object")]
    NotAnObject,
    #[error("video record has no identifier for shape {shape:?}")]
    MissingIdentifier { shape: VideoShape },
}

/// A video metadata record as returned by the API or stored in a fixture.
///
/// The raw JSON is kept verbatim so persisted downloads round-trip exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRecord {
    id: String,
    shape: VideoShape,
    raw: JsonValue,
}

impl VideoRecord {
    pub fn from_value(raw: JsonValue, shape: VideoShape) -> Result<Self, RecordError> {
        if !raw.is_object() {
            return Err(RecordError::NotAnObject);
        }
        let id = match shape {
            VideoShape::TopLevelId => raw.get("id").and_then(JsonValue::as_str),
            VideoShape::NestedContentDetails => raw
                .get("contentDetails")
                .and_then(|c| c.get("videoId"))
                .and_then(JsonValue::as_str),
        }
        .ok_or(RecordError::MissingIdentifier { shape })?
        .to_string();
        Ok(Self { id, shape, raw })
    }

    /// Placeholder kept in an audit batch when the download produced no data.
    pub fn unavailable(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            raw: serde_json::json!({ "id": id }),
            id,
            shape: VideoShape::TopLevelId,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shape(&self) -> VideoShape {
        self.shape
    }

    pub fn raw(&self) -> &JsonValue {
        &self.raw
    }

    /// False for the identifier-only placeholder produced by failed downloads.
    pub fn is_available(&self) -> bool {
        self.raw
            .as_object()
            .map(|obj| obj.keys().any(|k| k != "id"))
            .unwrap_or(false)
    }

    /// Concatenated text for one input channel; empty when the record has none.
    pub fn channel_text(&self, channel: Channel) -> String {
        let snippet = self.raw.get("snippet");
        match channel {
            Channel::Snippet => {
                let title = snippet
                    .and_then(|s| s.get("title"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default();
                let description = snippet
                    .and_then(|s| s.get("description"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default();
                join_nonempty([title, description])
            }
            Channel::Tags => strings_in(snippet.and_then(|s| s.get("tags"))).join(" "),
            Channel::Transcript => strings_in(self.raw.get("transcript")).join(" "),
            Channel::Comments => strings_in(self.raw.get("comments")).join(" "),
        }
    }
}

impl Serialize for VideoRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

fn join_nonempty<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accepts a string, an array of strings, or an array of comment objects
/// (`textOriginal`/`textDisplay`).
fn strings_in(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::String(s)) => vec![s.clone()],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Object(obj) => obj
                    .get("textOriginal")
                    .or_else(|| obj.get("textDisplay"))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// One ground-truth training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledVideo {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub comments: Vec<String>,
}

impl LabeledVideo {
    pub fn channel_text(&self, channel: Channel) -> String {
        match channel {
            Channel::Snippet => self.snippet.clone(),
            Channel::Tags => self.tags.join(" "),
            Channel::Transcript => self.transcript.clone(),
            Channel::Comments => self.comments.join(" "),
        }
    }
}

/// Training corpus handle. Owned by the data source that produced it and only
/// ever lent out by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub source: String,
    pub loaded_at: DateTime<Utc>,
    pub examples: Vec<LabeledVideo>,
}

impl Dataset {
    pub fn labels(&self) -> BTreeSet<&str> {
        self.examples.iter().map(|e| e.label.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

/// One scored video in a run artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub video_id: String,
    pub prediction: String,
    pub confidence_score: f64,
}

impl PredictionRecord {
    pub fn from_classification(video_id: impl Into<String>, c: Classification) -> Self {
        Self {
            video_id: video_id.into(),
            prediction: c.label,
            confidence_score: c.confidence,
        }
    }

    pub fn unavailable(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            prediction: UNAVAILABLE_LABEL.to_string(),
            confidence_score: 0.0,
        }
    }
}

/// `{"items": [...]}` wrapper shared by every JSON batch artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsEnvelope<T> {
    pub items: Vec<T>,
}
