//! Pipeline configuration: defaults, optional `psvd.yaml`, then environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use psvd_storage::TokenBucketConfig;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "psvd.yaml";
pub const DEFAULT_DATASET_TABLE: &str = "groundtruth_videos";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSourceConfig {
    Json { path: PathBuf },
    Postgres { database_url: String, table: String },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub dataset: DatasetSourceConfig,
    pub audit_file: PathBuf,
    pub audit_data_name: Option<String>,
    pub downloads_dir: PathBuf,
    pub test_fixture: PathBuf,
    pub all_runs_dir: PathBuf,
    pub test_runs_dir: PathBuf,
    pub weights_path: PathBuf,
    pub features_dir: PathBuf,
    pub comments_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub clean_dirs: Vec<PathBuf>,
    pub clean_ignore: Vec<String>,
    pub override_weights: bool,
    pub enable_logging: bool,
    pub youtube_api_key: Option<String>,
    pub youtube_api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub comment_delay_ms: u64,
    pub comment_page_size: u32,
    /// Quota for YouTube Data API calls; unlimited when unset.
    pub youtube_requests_per_minute: Option<u32>,
}

impl PipelineConfig {
    pub fn defaults(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            dataset: DatasetSourceConfig::Json {
                path: PathBuf::from("fixtures/training_dataset.json"),
            },
            audit_file: PathBuf::from("audit/audit_ids.txt"),
            audit_data_name: None,
            downloads_dir: PathBuf::from("audit/downloaded"),
            test_fixture: PathBuf::from("fixtures/test_videos.json"),
            all_runs_dir: PathBuf::from("runs/all_runs"),
            test_runs_dir: PathBuf::from("runs/test_runs"),
            weights_path: PathBuf::from("models/pseudoscience_model_final.json"),
            features_dir: PathBuf::from("features"),
            comments_dir: PathBuf::from("fetchedComments"),
            logs_dir: PathBuf::from("logs"),
            clean_dirs: vec![
                PathBuf::from("runs/all_runs"),
                PathBuf::from("runs/test_runs"),
                PathBuf::from("audit/downloaded"),
                PathBuf::from("features"),
            ],
            clean_ignore: vec![".gitignore".to_string(), ".gitkeep".to_string()],
            override_weights: false,
            enable_logging: true,
            youtube_api_key: None,
            youtube_api_base: psvd_adapters::youtube::DEFAULT_API_BASE.to_string(),
            user_agent: "psvd-pipeline/0.1".to_string(),
            http_timeout_secs: 20,
            comment_delay_ms: 5_000,
            comment_page_size: 100,
            youtube_requests_per_minute: None,
        }
    }

    /// Defaults, then `<root>/psvd.yaml` if present, then process environment.
    pub fn load(workspace_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(workspace_root);
        let file_path = config.workspace_root.join(CONFIG_FILE_NAME);
        if file_path.exists() {
            let text = std::fs::read_to_string(&file_path).map_err(|source| ConfigError::Read {
                path: file_path.clone(),
                source,
            })?;
            let file: ConfigFile =
                serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: file_path.clone(),
                    source,
                })?;
            config.apply_file(file)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(".")
    }

    /// Name of the combined download file; the audit file stem unless set.
    pub fn audit_data_name(&self) -> String {
        self.audit_data_name.clone().unwrap_or_else(|| {
            self.audit_file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "audit".to_string())
        })
    }

    pub fn audit_data_path(&self) -> PathBuf {
        self.downloads_dir
            .join(format!("{}.json", self.audit_data_name()))
    }

    pub fn raw_comments_path(&self) -> PathBuf {
        self.comments_dir.join("raw_comment_responses.json")
    }

    pub fn grouped_comments_path(&self) -> PathBuf {
        self.comments_dir.join("groundtruth_videos_comments.json")
    }

    pub fn comment_delay(&self) -> Duration {
        Duration::from_millis(self.comment_delay_ms)
    }

    pub fn youtube_quota(&self) -> Option<TokenBucketConfig> {
        self.youtube_requests_per_minute
            .and_then(TokenBucketConfig::per_minute)
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.workspace_root.join(path)
    }

    fn apply_file(&mut self, file: ConfigFile) -> Result<(), ConfigError> {
        if let Some(dataset) = file.dataset {
            self.dataset = match dataset.kind.as_str() {
                "json" => DatasetSourceConfig::Json {
                    path: dataset.path.ok_or_else(|| {
                        ConfigError::Invalid("dataset.kind=json requires dataset.path".into())
                    })?,
                },
                "postgres" => DatasetSourceConfig::Postgres {
                    database_url: dataset.database_url.ok_or_else(|| {
                        ConfigError::Invalid(
                            "dataset.kind=postgres requires dataset.database_url".into(),
                        )
                    })?,
                    table: dataset
                        .table
                        .unwrap_or_else(|| DEFAULT_DATASET_TABLE.to_string()),
                },
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown dataset.kind {other:?} (expected json or postgres)"
                    )))
                }
            };
        }

        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = file.$field { self.$field = value; })*
            };
        }
        take!(
            audit_file,
            downloads_dir,
            test_fixture,
            all_runs_dir,
            test_runs_dir,
            weights_path,
            features_dir,
            comments_dir,
            logs_dir,
            clean_dirs,
            clean_ignore,
            override_weights,
            enable_logging,
            youtube_api_base,
            user_agent,
            http_timeout_secs,
            comment_delay_ms,
            comment_page_size,
        );
        if file.audit_data_name.is_some() {
            self.audit_data_name = file.audit_data_name;
        }
        if let Some(limit) = file.youtube_requests_per_minute {
            self.youtube_requests_per_minute = Some(parse_quota(limit)?);
        }
        Ok(())
    }

    pub(crate) fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            let table = match &self.dataset {
                DatasetSourceConfig::Postgres { table, .. } => table.clone(),
                DatasetSourceConfig::Json { .. } => DEFAULT_DATASET_TABLE.to_string(),
            };
            self.dataset = DatasetSourceConfig::Postgres {
                database_url: url,
                table,
            };
        }
        if let Some(path) = lookup("PSVD_DATASET_JSON").filter(|v| !v.is_empty()) {
            self.dataset = DatasetSourceConfig::Json {
                path: PathBuf::from(path),
            };
        }
        if let Some(key) = lookup("YOUTUBE_DATA_API_KEY") {
            self.youtube_api_key = Some(key);
        }
        if let Some(path) = lookup("PSVD_AUDIT_FILE").filter(|v| !v.is_empty()) {
            self.audit_file = PathBuf::from(path);
        }
        if let Some(v) = lookup("PSVD_OVERRIDE_WEIGHTS") {
            self.override_weights = parse_flag(&v);
        }
        if let Some(v) = lookup("PSVD_ENABLE_LOGGING") {
            self.enable_logging = parse_flag(&v);
        }
        if let Some(v) = lookup("PSVD_YOUTUBE_REQUESTS_PER_MINUTE") {
            let limit = v.parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "PSVD_YOUTUBE_REQUESTS_PER_MINUTE={v:?} is not a number"
                ))
            })?;
            self.youtube_requests_per_minute = Some(parse_quota(limit)?);
        }
        if let Some(v) = lookup("PSVD_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v.parse().map_err(|_| {
                ConfigError::Invalid(format!("PSVD_HTTP_TIMEOUT_SECS={v:?} is not a number"))
            })?;
        }
        Ok(())
    }
}

fn parse_quota(limit: u32) -> Result<u32, ConfigError> {
    if limit == 0 {
        return Err(ConfigError::Invalid(
            "youtube_requests_per_minute must be at least 1".into(),
        ));
    }
    Ok(limit)
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    dataset: Option<DatasetSection>,
    audit_file: Option<PathBuf>,
    audit_data_name: Option<String>,
    downloads_dir: Option<PathBuf>,
    test_fixture: Option<PathBuf>,
    all_runs_dir: Option<PathBuf>,
    test_runs_dir: Option<PathBuf>,
    weights_path: Option<PathBuf>,
    features_dir: Option<PathBuf>,
    comments_dir: Option<PathBuf>,
    logs_dir: Option<PathBuf>,
    clean_dirs: Option<Vec<PathBuf>>,
    clean_ignore: Option<Vec<String>>,
    override_weights: Option<bool>,
    enable_logging: Option<bool>,
    youtube_api_base: Option<String>,
    user_agent: Option<String>,
    http_timeout_secs: Option<u64>,
    comment_delay_ms: Option<u64>,
    comment_page_size: Option<u32>,
    youtube_requests_per_minute: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatasetSection {
    kind: String,
    path: Option<PathBuf>,
    database_url: Option<String>,
    table: Option<String>,
}
