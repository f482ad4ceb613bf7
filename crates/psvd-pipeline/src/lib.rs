//! Pipeline orchestration: target resolution, stage execution and the reuse
//! rules that make repeated invocations cheap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use psvd_adapters::{
    group_comments, parse_video_records, BranchFeatureEngineer, Classifier, CommentCollector,
    CommentSource, DataSource, DataSourceError, Downloader, FeatureEngineer, FusionModelLoader,
    FusionTrainer, JsonDataSource, ModelLoader, PgDataSource, Trainer, YouTubeClient,
    YouTubeConfig,
};
use psvd_core::{Channel, Dataset, PredictionRecord, StageTarget, VideoRecord, VideoShape};
use psvd_storage::{ArtifactStore, HttpClientConfig};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod logging;
pub mod plan;

pub use config::{ConfigError, DatasetSourceConfig, PipelineConfig};
pub use logging::LoggerHandle;
pub use plan::{PlanError, Stage, TargetSet};

pub const CRATE_NAME: &str = "psvd-pipeline";

const DATA_SOURCE_HINT: &str = "is the dataset database running? (did you start the data source?)";

/// A stage that stopped the run.
#[derive(Debug, Error)]
#[error("stage {stage} failed after {:.2}s: {error:#}", .elapsed.as_secs_f64())]
pub struct StageFailure {
    pub stage: Stage,
    pub elapsed: Duration,
    #[source]
    pub error: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no recognized targets (ignored: {})", .ignored.join(", "))]
    NoTargets { ignored: Vec<String> },
    #[error("target `{target}` requires `{requires}` in the same invocation")]
    MissingDependency {
        target: StageTarget,
        requires: StageTarget,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("data source {source_name} is unreachable: {reason}; {}", DATA_SOURCE_HINT)]
    DataSourceUnreachable { source_name: String, reason: String },
    #[error("audit source {} not found", .path.display())]
    AuditSourceNotFound { path: PathBuf },
    #[error(transparent)]
    Stage(#[from] StageFailure),
}

impl PipelineError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoTargets { .. }
            | Self::MissingDependency { .. }
            | Self::Config(_)
            | Self::AuditSourceNotFound { .. } => 2,
            Self::DataSourceUnreachable { .. } => 3,
            Self::Stage(_) => 1,
        }
    }
}

impl From<PlanError> for PipelineError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::NoTargets { ignored } => Self::NoTargets { ignored },
            PlanError::MissingDependency { target, requires } => {
                Self::MissingDependency { target, requires }
            }
        }
    }
}

#[derive(Debug, Error)]
enum StageError {
    #[error("data source {source_name} is unreachable: {reason}; {}", DATA_SOURCE_HINT)]
    DataSourceUnreachable { source_name: String, reason: String },
    #[error("audit source {} not found", .path.display())]
    AuditSourceNotFound { path: PathBuf },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    fn into_pipeline_error(self, stage: Stage, elapsed: Duration) -> PipelineError {
        match self {
            Self::DataSourceUnreachable {
                source_name,
                reason,
            } => PipelineError::DataSourceUnreachable {
                source_name,
                reason,
            },
            Self::AuditSourceNotFound { path } => PipelineError::AuditSourceNotFound { path },
            Self::Other(error) => PipelineError::Stage(StageFailure {
                stage,
                elapsed,
                error,
            }),
        }
    }
}

impl From<DataSourceError> for StageError {
    fn from(err: DataSourceError) -> Self {
        match err {
            DataSourceError::Unreachable {
                source_name,
                reason,
            } => Self::DataSourceUnreachable {
                source_name,
                reason,
            },
            other => Self::Other(anyhow::Error::new(other)),
        }
    }
}

/// The external capabilities a run depends on.
pub struct Collaborators {
    pub data_source: Box<dyn DataSource>,
    pub downloader: Arc<dyn Downloader>,
    pub comment_source: Arc<dyn CommentSource>,
    pub feature_engineer: Box<dyn FeatureEngineer>,
    pub trainer: Box<dyn Trainer>,
    pub model_loader: Box<dyn ModelLoader>,
}

impl Collaborators {
    /// Production wiring: configured dataset source, one YouTube client shared
    /// by downloads and comment collection, and the native fusion model.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let data_source: Box<dyn DataSource> = match &config.dataset {
            DatasetSourceConfig::Json { path } => {
                Box::new(JsonDataSource::new(config.resolve(path)))
            }
            DatasetSourceConfig::Postgres {
                database_url,
                table,
            } => Box::new(
                PgDataSource::new(database_url.clone(), table.clone())
                    .map_err(|err| ConfigError::Invalid(format!("{err:#}")))?,
            ),
        };

        let youtube = Arc::new(
            YouTubeClient::new(YouTubeConfig {
                api_key: config.youtube_api_key.clone(),
                base_url: config.youtube_api_base.clone(),
                comment_page_size: config.comment_page_size,
                http: HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    token_bucket: config.youtube_quota(),
                    ..Default::default()
                },
            })
            .map_err(|err| ConfigError::Invalid(format!("building HTTP client: {err:#}")))?,
        );

        let features_dir = config.resolve(&config.features_dir);
        Ok(Self {
            data_source,
            downloader: youtube.clone(),
            comment_source: youtube,
            feature_engineer: Box::new(BranchFeatureEngineer::new(features_dir.clone())),
            trainer: Box::new(FusionTrainer::new(
                features_dir,
                config.resolve(&config.weights_path),
            )),
            model_loader: Box::new(FusionModelLoader),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub elapsed: Duration,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<StageTarget>,
    pub ignored_tokens: Vec<String>,
    pub stages: Vec<StageReport>,
    /// Scores from the last predict stage, in input order.
    pub predictions: Vec<PredictionRecord>,
    pub run_artifacts: Vec<PathBuf>,
}

/// Values handed from one stage to the next within a single invocation.
#[derive(Default)]
struct RunState {
    dataset: Option<Dataset>,
    classifier: Option<Box<dyn Classifier>>,
    audit_ids: Vec<String>,
    videos: Vec<VideoRecord>,
    predictions: Vec<PredictionRecord>,
    run_artifacts: Vec<PathBuf>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
    collaborators: Collaborators,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let store = ArtifactStore::new(config.workspace_root.clone());
        Self {
            config,
            store,
            collaborators,
        }
    }

    /// Resolves `targets` into stages and runs them in order, stopping at the
    /// first failure. Nothing runs when target resolution fails.
    pub async fn run(&self, targets: &TargetSet) -> Result<RunSummary, PipelineError> {
        for token in targets.ignored() {
            warn!(token = %token, "ignoring unrecognized target");
        }
        let stages = plan::resolve(targets, self.config.override_weights)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let requested: Vec<&str> = targets.targets().map(|t| t.as_str()).collect();
        info!(
            %run_id,
            targets = %requested.join(","),
            stages = stages.len(),
            "starting pipeline run"
        );

        let mut state = RunState::default();
        let mut reports = Vec::with_capacity(stages.len());
        for stage in stages {
            reports.push(self.run_stage(stage, &mut state).await?);
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            targets: targets.targets().collect(),
            ignored_tokens: targets.ignored().to_vec(),
            stages: reports,
            predictions: state.predictions,
            run_artifacts: state.run_artifacts,
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        state: &mut RunState,
    ) -> Result<StageReport, PipelineError> {
        let description = stage.description();
        info!("Attempting to {description}...");
        let started = Instant::now();
        let outcome = self
            .execute(stage, state)
            .instrument(info_span!("stage", stage = stage.name()))
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(detail) => {
                info!(
                    detail = %detail,
                    "Completed {description} in {:.2} seconds.",
                    elapsed.as_secs_f64()
                );
                Ok(StageReport {
                    stage,
                    elapsed,
                    detail,
                })
            }
            Err(err) => {
                error!(
                    "Failed to {description} after {:.2} seconds: {err:#}",
                    elapsed.as_secs_f64()
                );
                Err(err.into_pipeline_error(stage, elapsed))
            }
        }
    }

    async fn execute(&self, stage: Stage, state: &mut RunState) -> Result<String, StageError> {
        match stage {
            Stage::Clean => self.clean().await,
            Stage::LoadData => self.load_data(state).await,
            Stage::CollectComments => self.collect_comments(state).await,
            Stage::FineTune => self.fine_tune(state),
            Stage::Train { override_weights } => self.train(state, override_weights).await,
            Stage::LoadModel => self.load_model(state).await,
            Stage::LoadAuditIds => self.load_audit_ids(state).await,
            Stage::DownloadAudit => self.download_audit(state).await,
            Stage::LoadTestFixture => self.load_test_fixture(state).await,
            Stage::Predict => self.predict(state),
            Stage::WriteResults { is_test } => self.write_results(state, is_test).await,
        }
    }

    async fn clean(&self) -> Result<String, StageError> {
        let (mut files, mut dirs, mut skipped) = (0usize, 0usize, 0usize);
        for dir in &self.config.clean_dirs {
            let report = self.store.clean(dir, &self.config.clean_ignore).await?;
            info!(
                dir = %dir.display(),
                removed_files = report.removed_files,
                removed_dirs = report.removed_dirs,
                preserved = ?report.preserved,
                "cleaned directory"
            );
            files += report.removed_files;
            dirs += report.removed_dirs;
            skipped += report.skipped.len();
        }
        Ok(format!(
            "removed {files} files and {dirs} directories, skipped {skipped}"
        ))
    }

    async fn load_data(&self, state: &mut RunState) -> Result<String, StageError> {
        let source = &self.collaborators.data_source;
        let dataset = source.load().await?;
        info!(
            source = %source.describe(),
            examples = dataset.len(),
            labels = ?dataset.labels(),
            "loaded training data"
        );
        let detail = format!("{} examples from {}", dataset.len(), dataset.source);
        state.dataset = Some(dataset);
        Ok(detail)
    }

    async fn collect_comments(&self, state: &mut RunState) -> Result<String, StageError> {
        let collector = CommentCollector::new(
            &*self.collaborators.comment_source,
            self.config.resolve(self.config.raw_comments_path()),
            self.config.comment_delay(),
        );
        let collection = collector.collect(&state.audit_ids).await?;
        let raw = collector.load_raw().await?;
        let grouped = group_comments(&raw);

        let grouped_path = self.config.resolve(self.config.grouped_comments_path());
        if let Some(parent) = grouped_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&grouped).context("serializing grouped comments")?;
        fs::write(&grouped_path, bytes)
            .await
            .with_context(|| format!("writing {}", grouped_path.display()))?;

        Ok(format!(
            "fetched {}, already had {}, failed {}; {} videos with comments",
            collection.fetched,
            collection.already_completed,
            collection.failed,
            grouped.len()
        ))
    }

    fn fine_tune(&self, state: &RunState) -> Result<String, StageError> {
        let dataset = require_dataset(state)?;
        let engineer = &self.collaborators.feature_engineer;
        for channel in Channel::ALL {
            engineer
                .prepare_inputs(dataset, channel)
                .with_context(|| format!("preparing {channel} inputs"))?;
            engineer
                .finetune(channel)
                .with_context(|| format!("fine-tuning {channel}"))?;
            debug!(channel = %channel, "branch ready");
        }
        Ok(format!("{} branches", Channel::ALL.len()))
    }

    async fn train(&self, state: &RunState, override_weights: bool) -> Result<String, StageError> {
        let weights_path = &self.config.weights_path;
        if !override_weights && self.store.exists(weights_path).await {
            info!(
                weights = %weights_path.display(),
                "weights already exist and override is disabled; skipping training"
            );
            return Ok("reused existing weights".to_string());
        }

        let dataset = require_dataset(state)?;
        let handle = self.collaborators.trainer.train(dataset)?;
        info!(
            weights = %handle.weights_path.display(),
            examples = handle.examples,
            "trained classifier"
        );
        Ok(format!(
            "trained on {} examples -> {}",
            handle.examples,
            handle.weights_path.display()
        ))
    }

    async fn load_model(&self, state: &mut RunState) -> Result<String, StageError> {
        let weights_path = self.store.resolve(&self.config.weights_path);
        if !self.store.exists(&weights_path).await {
            return Err(anyhow!(
                "no weights at {}; run the `train` target first",
                weights_path.display()
            )
            .into());
        }
        let classifier = self
            .collaborators
            .model_loader
            .load(&weights_path)
            .with_context(|| format!("loading weights from {}", weights_path.display()))?;
        state.classifier = Some(classifier);
        Ok(weights_path.display().to_string())
    }

    async fn load_audit_ids(&self, state: &mut RunState) -> Result<String, StageError> {
        let path = &self.config.audit_file;
        if !self.store.exists(path).await {
            return Err(StageError::AuditSourceNotFound {
                path: self.store.resolve(path),
            });
        }
        state.audit_ids = self.store.read_lines(path).await?;
        Ok(format!("{} audit IDs", state.audit_ids.len()))
    }

    /// Reuses the combined download file when present; otherwise downloads
    /// each ID in order, keeping an unavailable placeholder for IDs with no
    /// data, and persists the batch.
    async fn download_audit(&self, state: &mut RunState) -> Result<String, StageError> {
        let path = self.config.audit_data_path();
        if self.store.exists(&path).await {
            let bytes = self.store.read_bytes(&path).await?;
            info!(
                path = %path.display(),
                sha256 = %ArtifactStore::sha256_hex(&bytes),
                "reusing downloaded audit videos"
            );
            state.videos = parse_video_records(&bytes, VideoShape::TopLevelId)
                .with_context(|| format!("parsing {}", path.display()))?;
            return Ok(format!("reused {} videos", state.videos.len()));
        }

        let mut videos = Vec::with_capacity(state.audit_ids.len());
        let mut unavailable = 0usize;
        for video_id in &state.audit_ids {
            match self
                .collaborators
                .downloader
                .download(video_id)
                .await
                .with_context(|| format!("downloading {video_id}"))?
            {
                Some(record) => videos.push(record),
                None => {
                    warn!(video_id = %video_id, "no data returned; keeping unavailable placeholder");
                    unavailable += 1;
                    videos.push(VideoRecord::unavailable(video_id.clone()));
                }
            }
        }

        let written = self.store.write_json_array(&path, &videos).await?;
        info!(
            path = %written.path.display(),
            items = written.items,
            bytes = written.byte_size,
            "wrote downloaded audit videos"
        );
        state.videos = videos;
        Ok(format!(
            "downloaded {} videos ({unavailable} unavailable)",
            state.videos.len()
        ))
    }

    async fn load_test_fixture(&self, state: &mut RunState) -> Result<String, StageError> {
        let path = &self.config.test_fixture;
        let bytes = self.store.read_bytes(path).await?;
        state.videos = parse_video_records(&bytes, VideoShape::NestedContentDetails)
            .with_context(|| format!("parsing {}", path.display()))?;
        state.audit_ids.clear();
        Ok(format!("{} fixture videos", state.videos.len()))
    }

    fn predict(&self, state: &mut RunState) -> Result<String, StageError> {
        let classifier = state
            .classifier
            .as_deref()
            .ok_or_else(|| anyhow!("no model loaded"))?;

        let mut predictions = Vec::with_capacity(state.videos.len());
        for video in &state.videos {
            let prediction = if video.is_available() {
                let classification = classifier
                    .classify(video)
                    .with_context(|| format!("classifying {}", video.id()))?;
                PredictionRecord::from_classification(video.id(), classification)
            } else {
                PredictionRecord::unavailable(video.id())
            };
            debug!(
                video_id = %prediction.video_id,
                prediction = %prediction.prediction,
                confidence = prediction.confidence_score,
                "scored video"
            );
            predictions.push(prediction);
        }

        state.predictions = predictions;
        Ok(format!("{} predictions", state.predictions.len()))
    }

    async fn write_results(&self, state: &mut RunState, is_test: bool) -> Result<String, StageError> {
        let (dir, prefix) = if is_test {
            (&self.config.test_runs_dir, "test_run")
        } else {
            (&self.config.all_runs_dir, "run")
        };
        let path = self.store.allocate_numbered_path(dir, prefix, "json").await?;
        let written = self.store.write_json_array(&path, &state.predictions).await?;
        info!(
            path = %written.path.display(),
            items = written.items,
            "wrote run results"
        );
        state.run_artifacts.push(written.path.clone());
        Ok(written.path.display().to_string())
    }
}

fn require_dataset(state: &RunState) -> Result<&Dataset, StageError> {
    state
        .dataset
        .as_ref()
        .ok_or_else(|| anyhow!("no dataset loaded; include the `data` target").into())
}
