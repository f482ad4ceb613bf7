use std::process::ExitCode;

use clap::Parser;
use psvd_pipeline::{
    Collaborators, LoggerHandle, Pipeline, PipelineConfig, PipelineError, RunSummary, TargetSet,
};
use psvd_storage::ArtifactStore;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "psvd")]
#[command(about = "Pseudoscientific video detection pipeline")]
struct Cli {
    /// Targets to run: clean, data, comments, fineTune, train, audit, all, test.
    #[arg(required = true, value_name = "TARGET")]
    targets: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("psvd: {err}");
            return ExitCode::from(2);
        }
    };

    let store = ArtifactStore::new(config.workspace_root.clone());
    let logger = match LoggerHandle::install(&config, &store).await {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("psvd: setting up logging: {err:#}");
            return ExitCode::from(1);
        }
    };
    if let Some(path) = logger.log_path() {
        info!(log = %path.display(), "logging to file");
    }

    let code = match run(config, &cli.targets).await {
        Ok(summary) => {
            println!(
                "run complete: run_id={} stages={} predictions={} artifacts={}",
                summary.run_id,
                summary.stages.len(),
                summary.predictions.len(),
                summary
                    .run_artifacts
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            0
        }
        Err(err) => {
            error!(exit_code = err.exit_code(), "{err}");
            err.exit_code()
        }
    };

    info!("END OF BUILD.");
    drop(logger);
    ExitCode::from(code as u8)
}

async fn run(config: PipelineConfig, tokens: &[String]) -> Result<RunSummary, PipelineError> {
    let collaborators = Collaborators::from_config(&config)?;
    let pipeline = Pipeline::new(config, collaborators);
    pipeline.run(&TargetSet::parse(tokens)).await
}
