//! Native branch/fusion model: one multinomial naive Bayes branch per input
//! channel, fused by per-branch accuracy weights.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use psvd_core::{Channel, Classification, Dataset, VideoRecord};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Classifier, FeatureEngineer, ModelLoader, Trainer, TrainerHandle};

const LABEL_PREFIX: &str = "__label__";
const MIN_BRANCH_WEIGHT: f64 = 0.05;
pub const WEIGHTS_FORMAT_VERSION: u32 = 1;

pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

fn sanitize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join("_")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchModel {
    pub channel: Channel,
    pub documents: BTreeMap<String, u64>,
    pub token_counts: BTreeMap<String, BTreeMap<String, u64>>,
    pub token_totals: BTreeMap<String, u64>,
    pub vocabulary_size: usize,
}

impl BranchModel {
    pub fn fit<'a>(channel: Channel, examples: impl IntoIterator<Item = (&'a str, Vec<String>)>) -> Self {
        let mut documents: BTreeMap<String, u64> = BTreeMap::new();
        let mut token_counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        let mut token_totals: BTreeMap<String, u64> = BTreeMap::new();
        let mut vocabulary = BTreeSet::new();

        for (label, tokens) in examples {
            *documents.entry(label.to_string()).or_default() += 1;
            let counts = token_counts.entry(label.to_string()).or_default();
            for token in tokens {
                *token_totals.entry(label.to_string()).or_default() += 1;
                *counts.entry(token.clone()).or_default() += 1;
                vocabulary.insert(token);
            }
        }

        Self {
            channel,
            documents,
            token_counts,
            token_totals,
            vocabulary_size: vocabulary.len(),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// Laplace-smoothed log posterior per label, normalized to sum to one in
    /// probability space.
    pub fn log_posteriors(&self, tokens: &[String]) -> BTreeMap<String, f64> {
        let total_docs: u64 = self.documents.values().sum();
        let label_count = self.documents.len().max(1) as f64;
        let vocab = self.vocabulary_size.max(1) as f64;

        let raw: BTreeMap<String, f64> = self
            .documents
            .iter()
            .map(|(label, docs)| {
                let prior = ((*docs as f64) + 1.0) / (total_docs as f64 + label_count);
                let total = self.token_totals.get(label).copied().unwrap_or(0) as f64;
                let counts = self.token_counts.get(label);
                let likelihood: f64 = tokens
                    .iter()
                    .map(|t| {
                        let c = counts.and_then(|m| m.get(t)).copied().unwrap_or(0) as f64;
                        ((c + 1.0) / (total + vocab)).ln()
                    })
                    .sum();
                (label.clone(), prior.ln() + likelihood)
            })
            .collect();

        log_softmax(raw)
    }

    pub fn predict(&self, tokens: &[String]) -> Option<String> {
        argmax(&self.log_posteriors(tokens)).map(|(label, _)| label.to_string())
    }
}

fn log_softmax(scores: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let max = scores.values().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return scores;
    }
    let log_sum = scores.values().map(|s| (s - max).exp()).sum::<f64>().ln() + max;
    scores.into_iter().map(|(k, v)| (k, v - log_sum)).collect()
}

fn argmax(scores: &BTreeMap<String, f64>) -> Option<(&str, f64)> {
    let mut best: Option<(&str, f64)> = None;
    for (label, score) in scores {
        if best.map_or(true, |(_, s)| *score > s) {
            best = Some((label.as_str(), *score));
        }
    }
    best
}

fn features_file(features_dir: &Path, channel: Channel) -> PathBuf {
    features_dir.join(channel.as_str()).join("train.txt")
}

fn branch_file(features_dir: &Path, channel: Channel) -> PathBuf {
    features_dir.join(channel.as_str()).join("branch.json")
}

/// Writes `value` as pretty JSON to a temp file beside `path`, then renames.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let bytes = serde_json::to_vec_pretty(value).context("serializing model")?;
    fs::write(&temp, bytes).with_context(|| format!("writing {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| {
        let _ = fs::remove_file(&temp);
        format!("renaming {} -> {}", temp.display(), path.display())
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Prepares fastText-style supervised input per channel and fits one branch
/// model from it.
#[derive(Debug, Clone)]
pub struct BranchFeatureEngineer {
    features_dir: PathBuf,
}

impl BranchFeatureEngineer {
    pub fn new(features_dir: impl Into<PathBuf>) -> Self {
        Self {
            features_dir: features_dir.into(),
        }
    }
}

impl FeatureEngineer for BranchFeatureEngineer {
    fn prepare_inputs(&self, dataset: &Dataset, channel: Channel) -> Result<()> {
        let path = features_file(&self.features_dir, channel);
        let parent = path.parent().unwrap_or(&self.features_dir);
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

        let mut out = String::new();
        for example in &dataset.examples {
            out.push_str(LABEL_PREFIX);
            out.push_str(&sanitize_label(&example.label));
            for token in tokenize(&example.channel_text(channel)) {
                out.push(' ');
                out.push_str(&token);
            }
            out.push('\n');
        }
        fs::write(&path, out).with_context(|| format!("writing {}", path.display()))?;
        debug!(channel = %channel, examples = dataset.len(), path = %path.display(), "prepared branch inputs");
        Ok(())
    }

    fn finetune(&self, channel: Channel) -> Result<()> {
        let input = features_file(&self.features_dir, channel);
        let text = fs::read_to_string(&input).with_context(|| {
            format!("reading {} (inputs must be prepared before fine-tuning)", input.display())
        })?;

        let mut rows = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let mut parts = line.split_whitespace();
            let Some(label) = parts.next().and_then(|p| p.strip_prefix(LABEL_PREFIX)) else {
                bail!("{}:{}: missing {LABEL_PREFIX} prefix", input.display(), line_no + 1);
            };
            rows.push((label.to_string(), parts.map(str::to_string).collect::<Vec<_>>()));
        }
        if rows.is_empty() {
            bail!("{} has no training rows", input.display());
        }

        let model = BranchModel::fit(channel, rows.iter().map(|(l, t)| (l.as_str(), t.clone())));
        let output = branch_file(&self.features_dir, channel);
        write_json_atomic(&output, &model)?;
        info!(
            channel = %channel,
            labels = model.documents.len(),
            vocabulary = model.vocabulary_size,
            "fine-tuned branch"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedBranch {
    pub weight: f64,
    pub model: BranchModel,
}

/// Serialized weights artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub version: u32,
    pub trained_at: DateTime<Utc>,
    pub labels: Vec<String>,
    pub branches: Vec<WeightedBranch>,
}

/// Combines the four fine-tuned branches into one weights artifact.
#[derive(Debug, Clone)]
pub struct FusionTrainer {
    features_dir: PathBuf,
    weights_path: PathBuf,
}

impl FusionTrainer {
    pub fn new(features_dir: impl Into<PathBuf>, weights_path: impl Into<PathBuf>) -> Self {
        Self {
            features_dir: features_dir.into(),
            weights_path: weights_path.into(),
        }
    }
}

impl Trainer for FusionTrainer {
    fn train(&self, dataset: &Dataset) -> Result<TrainerHandle> {
        if dataset.is_empty() {
            bail!("dataset {} has no examples", dataset.source);
        }

        // branches live on disk from an earlier `fineTune`, not in this run's state
        for channel in Channel::ALL {
            let path = branch_file(&self.features_dir, channel);
            if !path.exists() {
                bail!(
                    "no fine-tuned {channel} branch at {}; run the `fineTune` target before `train`",
                    path.display()
                );
            }
        }

        let mut branches = Vec::with_capacity(Channel::ALL.len());
        let mut labels = BTreeSet::new();
        for channel in Channel::ALL {
            let path = branch_file(&self.features_dir, channel);
            let model: BranchModel = read_json(&path)
                .with_context(|| format!("loading fine-tuned {channel} branch"))?;

            let correct = dataset
                .examples
                .iter()
                .filter(|e| {
                    model.predict(&tokenize(&e.channel_text(channel))).as_deref()
                        == Some(sanitize_label(&e.label).as_str())
                })
                .count();
            let accuracy = correct as f64 / dataset.len() as f64;
            info!(channel = %channel, accuracy, "branch accuracy on training set");

            labels.extend(model.labels().map(str::to_string));
            branches.push(WeightedBranch {
                weight: accuracy.max(MIN_BRANCH_WEIGHT),
                model,
            });
        }

        let trained_at = Utc::now();
        let weights = FusionWeights {
            version: WEIGHTS_FORMAT_VERSION,
            trained_at,
            labels: labels.into_iter().collect(),
            branches,
        };
        write_json_atomic(&self.weights_path, &weights)?;

        Ok(TrainerHandle {
            weights_path: self.weights_path.clone(),
            examples: dataset.len(),
            trained_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FusionModelLoader;

impl ModelLoader for FusionModelLoader {
    fn load(&self, weights_path: &Path) -> Result<Box<dyn Classifier>> {
        let weights: FusionWeights = read_json(weights_path)?;
        if weights.version != WEIGHTS_FORMAT_VERSION {
            bail!(
                "unsupported weights version {} in {}",
                weights.version,
                weights_path.display()
            );
        }
        if weights.branches.is_empty() || weights.labels.is_empty() {
            bail!("weights {} contain no trained branches", weights_path.display());
        }
        Ok(Box::new(FusionClassifier { weights }))
    }
}

#[derive(Debug, Clone)]
pub struct FusionClassifier {
    weights: FusionWeights,
}

impl Classifier for FusionClassifier {
    fn classify(&self, record: &VideoRecord) -> Result<Classification> {
        let mut fused: BTreeMap<String, f64> =
            self.weights.labels.iter().map(|l| (l.clone(), 0.0)).collect();

        for branch in &self.weights.branches {
            let tokens = tokenize(&record.channel_text(branch.model.channel));
            for (label, log_p) in branch.model.log_posteriors(&tokens) {
                if let Some(score) = fused.get_mut(&label) {
                    *score += branch.weight * log_p;
                }
            }
        }

        let normalized = log_softmax(fused);
        let Some((label, log_p)) = argmax(&normalized) else {
            bail!("no labels to score video {}", record.id());
        };
        Ok(Classification {
            label: label.to_string(),
            confidence: log_p.exp(),
        })
    }
}
