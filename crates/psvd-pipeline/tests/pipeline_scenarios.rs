use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use psvd_adapters::{
    Classifier, CommentSource, DataSource, DataSourceError, Downloader, FeatureEngineer,
    ModelLoader, Trainer, TrainerHandle, YouTubeError,
};
use psvd_core::{
    Channel, Classification, Dataset, LabeledVideo, PredictionRecord, StageTarget, VideoRecord,
    VideoShape,
};
use psvd_pipeline::{Collaborators, Pipeline, PipelineConfig, PipelineError, Stage, TargetSet};
use psvd_storage::ArtifactStore;
use serde_json::{json, Value as JsonValue};
use tempfile::{tempdir, TempDir};

#[derive(Clone, Default)]
struct Calls {
    loads: Arc<AtomicUsize>,
    downloads: Arc<AtomicUsize>,
    comment_requests: Arc<AtomicUsize>,
    prepares: Arc<AtomicUsize>,
    finetunes: Arc<AtomicUsize>,
    trains: Arc<AtomicUsize>,
    classifications: Arc<AtomicUsize>,
}

impl Calls {
    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct FakeDataSource {
    calls: Calls,
    reachable: bool,
}

#[async_trait]
impl DataSource for FakeDataSource {
    fn describe(&self) -> String {
        "fake:groundtruth".to_string()
    }

    async fn load(&self) -> Result<Dataset, DataSourceError> {
        self.calls.loads.fetch_add(1, Ordering::SeqCst);
        if !self.reachable {
            return Err(DataSourceError::Unreachable {
                source_name: self.describe(),
                reason: "connection refused".to_string(),
            });
        }
        let example = |id: &str, label: &str| LabeledVideo {
            id: id.to_string(),
            label: label.to_string(),
            snippet: "vaccines cause magnets".to_string(),
            tags: vec![],
            transcript: String::new(),
            comments: vec![],
        };
        Ok(Dataset {
            source: self.describe(),
            loaded_at: Utc::now(),
            examples: vec![example("t1", "pseudoscience"), example("t2", "science")],
        })
    }
}

struct FakeDownloader {
    calls: Calls,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(&self, video_id: &str) -> Result<Option<VideoRecord>> {
        self.calls.downloads.fetch_add(1, Ordering::SeqCst);
        if video_id.starts_with("gone") {
            return Ok(None);
        }
        if video_id.starts_with("boom") {
            bail!("videos.list quota exceeded");
        }
        let raw = json!({
            "id": video_id,
            "snippet": { "title": format!("video {video_id}"), "description": "" }
        });
        Ok(Some(VideoRecord::from_value(raw, VideoShape::TopLevelId)?))
    }
}

struct FakeCommentSource {
    calls: Calls,
}

#[async_trait]
impl CommentSource for FakeCommentSource {
    async fn comment_threads(&self, video_id: &str) -> Result<JsonValue, YouTubeError> {
        self.calls.comment_requests.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "items": [
                {"snippet": {"topLevelComment": {"snippet": {"textOriginal": format!("nice {video_id}")}}}}
            ]
        }))
    }
}

struct FakeFeatureEngineer {
    calls: Calls,
    broken_channel: Option<Channel>,
}

impl FeatureEngineer for FakeFeatureEngineer {
    fn prepare_inputs(&self, _dataset: &Dataset, _channel: Channel) -> Result<()> {
        self.calls.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finetune(&self, channel: Channel) -> Result<()> {
        self.calls.finetunes.fetch_add(1, Ordering::SeqCst);
        if self.broken_channel == Some(channel) {
            bail!("{channel} inputs are empty");
        }
        Ok(())
    }
}

struct FakeTrainer {
    calls: Calls,
    weights_path: std::path::PathBuf,
}

impl Trainer for FakeTrainer {
    fn train(&self, dataset: &Dataset) -> Result<TrainerHandle> {
        self.calls.trains.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = self.weights_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.weights_path, b"{\"fake\":true}")?;
        Ok(TrainerHandle {
            weights_path: self.weights_path.clone(),
            examples: dataset.len(),
            trained_at: Utc::now(),
        })
    }
}

struct FakeModelLoader {
    calls: Calls,
}

impl ModelLoader for FakeModelLoader {
    fn load(&self, _weights_path: &Path) -> Result<Box<dyn Classifier>> {
        Ok(Box::new(FakeClassifier {
            calls: self.calls.clone(),
        }))
    }
}

struct FakeClassifier {
    calls: Calls,
}

impl Classifier for FakeClassifier {
    fn classify(&self, record: &VideoRecord) -> Result<Classification> {
        self.calls.classifications.fetch_add(1, Ordering::SeqCst);
        let label = if record.id().ends_with('b') {
            "pseudoscience"
        } else {
            "science"
        };
        Ok(Classification {
            label: label.to_string(),
            confidence: 0.75,
        })
    }
}

struct Harness {
    dir: TempDir,
    calls: Calls,
    config: PipelineConfig,
    broken_channel: Option<Channel>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::defaults(dir.path());
        config.comment_delay_ms = 0;
        Self {
            dir,
            calls: Calls::default(),
            config,
            broken_channel: None,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn pipeline(&self, reachable: bool) -> Pipeline {
        let collaborators = Collaborators {
            data_source: Box::new(FakeDataSource {
                calls: self.calls.clone(),
                reachable,
            }),
            downloader: Arc::new(FakeDownloader {
                calls: self.calls.clone(),
            }),
            comment_source: Arc::new(FakeCommentSource {
                calls: self.calls.clone(),
            }),
            feature_engineer: Box::new(FakeFeatureEngineer {
                calls: self.calls.clone(),
                broken_channel: self.broken_channel,
            }),
            trainer: Box::new(FakeTrainer {
                calls: self.calls.clone(),
                weights_path: self.config.resolve(&self.config.weights_path),
            }),
            model_loader: Box::new(FakeModelLoader {
                calls: self.calls.clone(),
            }),
        };
        Pipeline::new(self.config.clone(), collaborators)
    }

    fn write(&self, relative: &str, contents: &str) {
        let path = self.root().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn write_test_fixture(&self, ids: &[&str]) {
        let items: Vec<_> = ids
            .iter()
            .map(|id| json!({"contentDetails": {"videoId": id}, "snippet": {"title": format!("clip {id}")}}))
            .collect();
        self.write("fixtures/test_videos.json", &json!({ "items": items }).to_string());
    }

    fn write_weights(&self) {
        self.write("models/pseudoscience_model_final.json", "{\"existing\":true}");
    }

    async fn read_predictions(&self, relative: &str) -> Vec<PredictionRecord> {
        ArtifactStore::new(self.root())
            .read_json_array(relative)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_target_scores_the_fixture_in_order() {
    let harness = Harness::new();
    harness.write_test_fixture(&["a", "b", "c"]);

    let summary = harness
        .pipeline(true)
        .run(&TargetSet::parse(["test"]))
        .await
        .unwrap();

    let returned: Vec<_> = summary
        .predictions
        .iter()
        .map(|p| (p.video_id.as_str(), p.prediction.as_str()))
        .collect();
    assert_eq!(
        returned,
        [("a", "science"), ("b", "pseudoscience"), ("c", "science")]
    );
    assert_eq!(
        summary.run_artifacts,
        vec![harness.root().join("runs/test_runs/test_run_0.json")]
    );
    let written = harness
        .read_predictions("runs/test_runs/test_run_0.json")
        .await;
    assert_eq!(written, summary.predictions);
    assert_eq!(Calls::count(&harness.calls.downloads), 0);
    assert_eq!(Calls::count(&harness.calls.prepares), Channel::ALL.len());
    assert_eq!(Calls::count(&harness.calls.finetunes), Channel::ALL.len());
}

#[tokio::test]
async fn repeated_test_runs_get_sequential_numbers() {
    let harness = Harness::new();
    harness.write_test_fixture(&["a"]);
    harness.write("runs/test_runs/.gitignore", "*\n");

    let pipeline = harness.pipeline(true);
    for _ in 0..3 {
        pipeline.run(&TargetSet::parse(["test"])).await.unwrap();
    }

    for n in 0..3 {
        assert!(harness
            .root()
            .join(format!("runs/test_runs/test_run_{n}.json"))
            .exists());
    }
}

#[tokio::test]
async fn existing_weights_skip_training_unless_overridden() {
    let harness = Harness::new();
    harness.write_weights();

    harness
        .pipeline(true)
        .run(&TargetSet::parse(["data", "train"]))
        .await
        .unwrap();
    assert_eq!(Calls::count(&harness.calls.trains), 0);
    assert_eq!(
        std::fs::read_to_string(harness.root().join("models/pseudoscience_model_final.json"))
            .unwrap(),
        "{\"existing\":true}"
    );

    let mut overriding = Harness::new();
    overriding.write_weights();
    overriding.config.override_weights = true;
    overriding
        .pipeline(true)
        .run(&TargetSet::parse(["data", "train"]))
        .await
        .unwrap();
    assert_eq!(Calls::count(&overriding.calls.trains), 1);
}

#[tokio::test]
async fn all_target_always_retrains() {
    let harness = Harness::new();
    harness.write_weights();
    harness.write("audit/audit_ids.txt", "v1\nv2\n");

    harness
        .pipeline(true)
        .run(&TargetSet::parse(["all"]))
        .await
        .unwrap();

    assert_eq!(Calls::count(&harness.calls.trains), 1);
    assert_eq!(Calls::count(&harness.calls.downloads), 2);
    assert!(harness.root().join("runs/all_runs/run_0.json").exists());
}

#[tokio::test]
async fn existing_download_is_reused_without_api_calls() {
    let harness = Harness::new();
    harness.write_weights();
    harness.write("audit/audit_ids.txt", "x1\nx2\n");
    let stored = "{\"items\":[{\"id\":\"x1\",\"snippet\":{\"title\":\"kept\"}},{\"id\":\"x2\"}]}";
    harness.write("audit/downloaded/audit_ids.json", stored);

    let summary = harness
        .pipeline(true)
        .run(&TargetSet::parse(["audit"]))
        .await
        .unwrap();

    assert_eq!(Calls::count(&harness.calls.downloads), 0);
    assert_eq!(
        std::fs::read_to_string(harness.root().join("audit/downloaded/audit_ids.json")).unwrap(),
        stored
    );
    assert_eq!(summary.predictions.len(), 2);
    assert_eq!(summary.predictions[1], PredictionRecord::unavailable("x2"));
    let predictions = harness.read_predictions("runs/all_runs/run_0.json").await;
    assert_eq!(predictions, summary.predictions);
}

#[tokio::test]
async fn unavailable_downloads_keep_their_slot() {
    let harness = Harness::new();
    harness.write_weights();
    harness.write("audit/audit_ids.txt", "a1\ngone1\na3\n");

    harness
        .pipeline(true)
        .run(&TargetSet::parse(["audit"]))
        .await
        .unwrap();

    let predictions = harness.read_predictions("runs/all_runs/run_0.json").await;
    let ids: Vec<_> = predictions.iter().map(|p| p.video_id.as_str()).collect();
    assert_eq!(ids, ["a1", "gone1", "a3"]);
    assert_eq!(predictions[1].prediction, "unavailable");
    assert_eq!(predictions[1].confidence_score, 0.0);
    assert_eq!(Calls::count(&harness.calls.classifications), 2);

    let persisted: Vec<JsonValue> = ArtifactStore::new(harness.root())
        .read_json_array("audit/downloaded/audit_ids.json")
        .await
        .unwrap();
    assert_eq!(persisted[1], json!({"id": "gone1"}));
}

#[tokio::test]
async fn missing_dependency_runs_nothing() {
    let harness = Harness::new();
    harness.write("runs/all_runs/old.json", "{}");

    let err = harness
        .pipeline(true)
        .run(&TargetSet::parse(["clean", "train"]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::MissingDependency {
            target: StageTarget::Train,
            requires: StageTarget::Data
        }
    ));
    assert_eq!(err.exit_code(), 2);
    assert!(harness.root().join("runs/all_runs/old.json").exists());
    assert_eq!(Calls::count(&harness.calls.loads), 0);
}

#[tokio::test]
async fn unrecognized_tokens_alone_are_rejected() {
    let harness = Harness::new();
    let err = harness
        .pipeline(true)
        .run(&TargetSet::parse(["deploy"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoTargets { .. }));
}

#[tokio::test]
async fn clean_empties_working_directories() {
    let harness = Harness::new();
    harness.write("runs/all_runs/x.json", "{}");
    harness.write("runs/all_runs/.gitignore", "*\n");
    harness.write("features/video_tags/train.txt", "__label__science a\n");

    let summary = harness
        .pipeline(true)
        .run(&TargetSet::parse(["clean", "bogus"]))
        .await
        .unwrap();

    assert_eq!(summary.ignored_tokens, ["bogus"]);
    assert_eq!(summary.stages.len(), 1);
    assert_eq!(summary.stages[0].stage, Stage::Clean);
    let remaining: Vec<_> = std::fs::read_dir(harness.root().join("runs/all_runs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(remaining, [".gitignore"]);
    assert!(!harness.root().join("features/video_tags").exists());
}

#[tokio::test]
async fn missing_audit_file_is_reported_distinctly() {
    let harness = Harness::new();
    harness.write_weights();

    let err = harness
        .pipeline(true)
        .run(&TargetSet::parse(["audit"]))
        .await
        .unwrap_err();

    match &err {
        PipelineError::AuditSourceNotFound { path } => {
            assert!(path.ends_with("audit/audit_ids.txt"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(Calls::count(&harness.calls.downloads), 0);
}

#[tokio::test]
async fn audit_without_weights_fails_at_model_load() {
    let harness = Harness::new();
    harness.write("audit/audit_ids.txt", "v1\n");

    let err = harness
        .pipeline(true)
        .run(&TargetSet::parse(["audit"]))
        .await
        .unwrap_err();

    match err {
        PipelineError::Stage(failure) => {
            assert_eq!(failure.stage, Stage::LoadModel);
            assert!(failure.to_string().contains("no weights"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

fn stored_runs(root: &Path) -> Vec<String> {
    ["runs/all_runs", "runs/test_runs"]
        .iter()
        .filter_map(|dir| std::fs::read_dir(root.join(dir)).ok())
        .flatten()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".json"))
        .collect()
}

#[tokio::test]
async fn fine_tune_failure_stops_before_training() {
    let mut harness = Harness::new();
    harness.broken_channel = Some(Channel::Tags);
    harness.write("audit/audit_ids.txt", "v1\nv2\n");

    let err = harness
        .pipeline(true)
        .run(&TargetSet::parse(["all"]))
        .await
        .unwrap_err();

    match &err {
        PipelineError::Stage(failure) => {
            assert_eq!(failure.stage, Stage::FineTune);
            assert!(failure.to_string().contains("video_tags inputs are empty"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.exit_code(), 1);
    assert_eq!(Calls::count(&harness.calls.finetunes), 2);
    assert_eq!(Calls::count(&harness.calls.trains), 0);
    assert_eq!(Calls::count(&harness.calls.downloads), 0);
    assert!(!harness
        .root()
        .join("models/pseudoscience_model_final.json")
        .exists());
    assert!(stored_runs(harness.root()).is_empty());
}

#[tokio::test]
async fn download_error_aborts_without_a_partial_batch() {
    let harness = Harness::new();
    harness.write_weights();
    harness.write("audit/audit_ids.txt", "a1\nboom2\na3\n");

    let err = harness
        .pipeline(true)
        .run(&TargetSet::parse(["audit"]))
        .await
        .unwrap_err();

    match &err {
        PipelineError::Stage(failure) => {
            assert_eq!(failure.stage, Stage::DownloadAudit);
            assert!(failure.to_string().contains("downloading boom2"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.exit_code(), 1);
    assert_eq!(Calls::count(&harness.calls.downloads), 2);
    assert_eq!(Calls::count(&harness.calls.classifications), 0);
    assert!(!harness
        .root()
        .join("audit/downloaded/audit_ids.json")
        .exists());
    assert!(stored_runs(harness.root()).is_empty());
}

#[tokio::test]
async fn unreachable_data_source_stops_the_run() {
    let harness = Harness::new();

    let err = harness
        .pipeline(false)
        .run(&TargetSet::parse(["data", "fineTune", "train"]))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::DataSourceUnreachable { .. }));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(Calls::count(&harness.calls.prepares), 0);
    assert_eq!(Calls::count(&harness.calls.trains), 0);
}

#[tokio::test]
async fn comments_target_collects_and_groups() {
    let harness = Harness::new();
    harness.write("audit/audit_ids.txt", "c1\nc2\n");

    let pipeline = harness.pipeline(true);
    pipeline
        .run(&TargetSet::parse(["comments"]))
        .await
        .unwrap();
    pipeline
        .run(&TargetSet::parse(["comments"]))
        .await
        .unwrap();

    assert_eq!(Calls::count(&harness.calls.comment_requests), 2);
    let grouped: JsonValue = serde_json::from_str(
        &std::fs::read_to_string(
            harness
                .root()
                .join("fetchedComments/groundtruth_videos_comments.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(
        grouped,
        json!([
            {"comments": ["nice c1"], "id": "c1"},
            {"comments": ["nice c2"], "id": "c2"}
        ])
    );
}
