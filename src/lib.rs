pub mod config;
pub mod models;
pub mod pipeline;
pub mod table_io;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use config::RunSettings;
use pipeline::llm::LlmClient;
use pipeline::{PipelineError, PipelineEvent, PipelineOrchestrator};
use table_io::{SavedPaths, TableIoError};

/// Install the fmt subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Table(#[from] TableIoError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(std::io::Error),
}

/// Run one batch as configured by the environment and save the results.
pub fn run() -> Result<(), RunError> {
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let settings = RunSettings::from_env()?;
    // Blocking HTTP clients must be built and dropped outside the runtime.
    let llm = settings.backend.client();
    run_with_client(&settings, llm)?;
    Ok(())
}

/// Run one batch against `llm` and save the results.
///
/// The batch runs until every record has finished its passes; per-call
/// timeouts and retry budgets bound how long that takes.
pub fn run_with_client(
    settings: &RunSettings,
    llm: Arc<dyn LlmClient>,
) -> Result<SavedPaths, RunError> {
    let pipeline_config = settings.pipeline_config()?;
    let table = table_io::load_table(&settings.input)?;

    tracing::info!(
        backend = settings.backend.name(),
        preprocess_model = %pipeline_config.preprocess.model,
        model = %pipeline_config.detect.model,
        records = table.len(),
        "Run configured"
    );

    let orchestrator = PipelineOrchestrator::new(llm, pipeline_config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(RunError::Runtime)?;

    let outcome = runtime.block_on(orchestrator.run(table, &log_progress));
    runtime.shutdown_timeout(Duration::from_secs(5));

    let report = outcome?;
    let saved = table_io::save_report(&report, &settings.output_dir)?;

    tracing::info!(
        run_id = %report.run_id,
        records = report.summary.records,
        candidates = report.summary.candidates,
        stage1_mean = ?report.summary.stage1.mean,
        stage2_mean = ?report.summary.stage2.mean,
        results = %saved.results.display(),
        "Run finished"
    );
    Ok(saved)
}

fn log_progress(event: &PipelineEvent) {
    match event {
        PipelineEvent::TaskCompleted {
            id,
            stage,
            success,
            completed,
            total,
            ..
        } => {
            tracing::debug!(record_id = %id, stage = stage.as_str(), success, completed, total, "Task completed");
        }
        PipelineEvent::RetryRecovered { id, stage, attempts } => {
            tracing::info!(record_id = %id, stage = stage.as_str(), attempts, "Request recovered");
        }
        _ => {}
    }
}
