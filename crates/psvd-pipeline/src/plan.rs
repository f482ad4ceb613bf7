//! Turns CLI target tokens into an ordered, dependency-checked stage list.

use std::collections::BTreeSet;
use std::fmt;

use psvd_core::StageTarget;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Clean,
    LoadData,
    CollectComments,
    FineTune,
    Train { override_weights: bool },
    LoadModel,
    LoadAuditIds,
    DownloadAudit,
    LoadTestFixture,
    Predict,
    WriteResults { is_test: bool },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::LoadData => "load_data",
            Self::CollectComments => "collect_comments",
            Self::FineTune => "fine_tune",
            Self::Train { .. } => "train",
            Self::LoadModel => "load_model",
            Self::LoadAuditIds => "load_audit_ids",
            Self::DownloadAudit => "download_audit",
            Self::LoadTestFixture => "load_test_fixture",
            Self::Predict => "predict",
            Self::WriteResults { .. } => "write_results",
        }
    }

    /// Human phrasing used in the start/outcome log lines.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clean => "clean working directories",
            Self::LoadData => "load in data",
            Self::CollectComments => "collect video comments",
            Self::FineTune => "fine tune branches",
            Self::Train { .. } => "train classifier",
            Self::LoadModel => "load model",
            Self::LoadAuditIds => "load audit IDs",
            Self::DownloadAudit => "download audit videos",
            Self::LoadTestFixture => "load test fixture",
            Self::Predict => "predict",
            Self::WriteResults { is_test: true } => "write test results",
            Self::WriteResults { is_test: false } => "write results",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("no recognized targets (ignored: {})", .ignored.join(", "))]
    NoTargets { ignored: Vec<String> },
    #[error("target `{target}` requires `{requires}` in the same invocation")]
    MissingDependency {
        target: StageTarget,
        requires: StageTarget,
    },
}

/// Parsed CLI targets. Unknown tokens are kept aside so they can be reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    targets: BTreeSet<StageTarget>,
    ignored: Vec<String>,
}

impl TargetSet {
    pub fn parse<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for token in tokens {
            let token = token.as_ref();
            match StageTarget::parse(token) {
                Some(target) => {
                    set.targets.insert(target);
                }
                None => set.ignored.push(token.to_string()),
            }
        }
        set
    }

    pub fn contains(&self, target: StageTarget) -> bool {
        self.targets.contains(&target)
    }

    pub fn targets(&self) -> impl Iterator<Item = StageTarget> + '_ {
        self.targets.iter().copied()
    }

    pub fn ignored(&self) -> &[String] {
        &self.ignored
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

const DEPENDENCIES: &[(StageTarget, StageTarget)] = &[
    (StageTarget::FineTune, StageTarget::Data),
    (StageTarget::Train, StageTarget::Data),
];

/// Resolves the stage sequence for one invocation.
///
/// `all` and `test` expand to fixed sequences and suppress granular targets;
/// with both present the `all` sequence runs first. `override_weights` applies
/// to every train stage except the one inside `all`, which always retrains.
pub fn resolve(targets: &TargetSet, override_weights: bool) -> Result<Vec<Stage>, PlanError> {
    if targets.is_empty() {
        return Err(PlanError::NoTargets {
            ignored: targets.ignored.clone(),
        });
    }

    if targets.contains(StageTarget::All) || targets.contains(StageTarget::Test) {
        let mut stages = Vec::new();
        if targets.contains(StageTarget::All) {
            stages.extend([
                Stage::LoadData,
                Stage::FineTune,
                Stage::Train {
                    override_weights: true,
                },
                Stage::LoadModel,
                Stage::LoadAuditIds,
                Stage::DownloadAudit,
                Stage::Predict,
                Stage::WriteResults { is_test: false },
            ]);
        }
        if targets.contains(StageTarget::Test) {
            stages.extend([
                Stage::LoadData,
                Stage::FineTune,
                Stage::Train { override_weights },
                Stage::LoadModel,
                Stage::LoadTestFixture,
                Stage::Predict,
                Stage::WriteResults { is_test: true },
            ]);
        }
        return Ok(stages);
    }

    for (target, requires) in DEPENDENCIES {
        if targets.contains(*target) && !targets.contains(*requires) {
            return Err(PlanError::MissingDependency {
                target: *target,
                requires: *requires,
            });
        }
    }

    let mut stages = Vec::new();
    for target in StageTarget::GRANULAR {
        if !targets.contains(target) {
            continue;
        }
        let expansion: &[Stage] = match target {
            StageTarget::Clean => &[Stage::Clean],
            StageTarget::Data => &[Stage::LoadData],
            StageTarget::Comments => &[Stage::LoadAuditIds, Stage::CollectComments],
            StageTarget::FineTune => &[Stage::FineTune],
            StageTarget::Train => &[Stage::Train { override_weights }],
            StageTarget::Audit => &[
                Stage::LoadModel,
                Stage::LoadAuditIds,
                Stage::DownloadAudit,
                Stage::Predict,
                Stage::WriteResults { is_test: false },
            ],
            StageTarget::All | StageTarget::Test => &[],
        };
        for stage in expansion {
            if *stage == Stage::LoadAuditIds && stages.contains(stage) {
                continue;
            }
            stages.push(*stage);
        }
    }
    Ok(stages)
}
