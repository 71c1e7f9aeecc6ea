use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::llm::{
    LlmClient, OllamaClient, OpenAiClient, AZURE_DEFAULT_API_VERSION, OLLAMA_DEFAULT_URL,
};
use crate::pipeline::stage::{PromptSet, ScorePolicy, Stage};
use crate::pipeline::{BackoffPolicy, PipelineError};

/// Application-level constants
pub const APP_NAME: &str = "MP-RRED";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Concurrent service calls per stage pass.
pub const MAX_WORKERS: usize = 8;
/// Per-call timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 100;
/// Retry attempts for preprocessing and detection.
pub const RETRY_LIMIT_FIRST: u32 = 3;
/// Retry attempts for verification.
pub const RETRY_LIMIT_SECOND: u32 = 2;
pub const RETRY_SLEEP_SECS: u64 = 1;

pub const DEFAULT_PREPROCESS_MODEL: &str = "gpt-4.1-nano";
pub const DEFAULT_MODEL: &str = "o4-mini";
/// Reasoning effort for the detection and verification models.
pub const REASONING_EFFORT: &str = "high";
pub const REASONING_EFFORTS: &[&str] = &["low", "medium", "high"];

pub const RESULTS_FILE: &str = "CURRENT_RESULTS.json";
pub const FAILED_REQUESTS_FILE: &str = "failed_requests.json";
pub const RESULT_STATS_FILE: &str = "RESULT_STATS.json";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "mp_rred=info"
}

/// Get the application data directory (~/MP-RRED/).
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default output directory for batch results.
pub fn results_dir() -> PathBuf {
    app_data_dir().join("results")
}

// ═══════════════════════════════════════════════════════════
// Pipeline configuration
// ═══════════════════════════════════════════════════════════

/// How one stage is run: which model, how long to wait, how hard to retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePlan {
    pub model: String,
    pub timeout: Duration,
    /// Retry attempts after the first pass.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Sent only when set; the preprocessing model does not accept it.
    pub reasoning_effort: Option<String>,
}

impl StagePlan {
    fn first_pass(model: &str, reasoning_effort: Option<&str>) -> Self {
        Self {
            model: model.to_string(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            max_attempts: RETRY_LIMIT_FIRST,
            backoff: BackoffPolicy::exponential_secs(),
            reasoning_effort: reasoning_effort.map(str::to_string),
        }
    }
}

/// Everything a batch run needs besides the service and the table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub score_policy: ScorePolicy,
    pub prompts: PromptSet,
    pub preprocess: StagePlan,
    pub detect: StagePlan,
    pub verify: StagePlan,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: MAX_WORKERS,
            score_policy: ScorePolicy::default(),
            prompts: PromptSet::default(),
            preprocess: StagePlan::first_pass(DEFAULT_PREPROCESS_MODEL, None),
            detect: StagePlan::first_pass(DEFAULT_MODEL, Some(REASONING_EFFORT)),
            verify: StagePlan {
                model: DEFAULT_MODEL.to_string(),
                timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
                max_attempts: RETRY_LIMIT_SECOND,
                backoff: BackoffPolicy::Fixed {
                    delay: Duration::from_secs(RETRY_SLEEP_SECS),
                },
                reasoning_effort: Some(REASONING_EFFORT.to_string()),
            },
        }
    }
}

impl PipelineConfig {
    pub fn plan(&self, stage: Stage) -> &StagePlan {
        match stage {
            Stage::Preprocess => &self.preprocess,
            Stage::Detect => &self.detect,
            Stage::Verify => &self.verify,
        }
    }

    pub fn instructions(&self, stage: Stage) -> &str {
        match stage {
            Stage::Preprocess => &self.prompts.preprocess,
            Stage::Detect => &self.prompts.detect,
            Stage::Verify => &self.prompts.verify,
        }
    }

    /// Set the model for every stage at once.
    pub fn with_model(mut self, model: &str) -> Self {
        for plan in [&mut self.preprocess, &mut self.detect, &mut self.verify] {
            plan.model = model.to_string();
        }
        self
    }

    /// Reject settings no batch could run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == 0 {
            return Err(PipelineError::Configuration(
                "worker count must be at least 1".into(),
            ));
        }
        for &stage in Stage::all() {
            let plan = self.plan(stage);
            if plan.model.trim().is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "{stage} stage has no model"
                )));
            }
            if plan.timeout.is_zero() {
                return Err(PipelineError::Configuration(format!(
                    "{stage} stage timeout must be positive"
                )));
            }
            if let Some(effort) = &plan.reasoning_effort {
                if !REASONING_EFFORTS.contains(&effort.as_str()) {
                    return Err(PipelineError::Configuration(format!(
                        "{stage} stage reasoning effort '{effort}' is not one of {}",
                        REASONING_EFFORTS.join(", ")
                    )));
                }
            }
            if self.instructions(stage).trim().is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "{stage} stage has empty instructions"
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Run settings (binary)
// ═══════════════════════════════════════════════════════════

/// Which service the binary talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    OpenAi {
        api_key: String,
    },
    Azure {
        endpoint: String,
        api_key: String,
        api_version: String,
    },
    Ollama {
        host: String,
    },
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Azure { .. } => "azure",
            Self::Ollama { .. } => "ollama",
        }
    }

    /// Build the blocking service client for this backend.
    pub fn client(&self) -> Arc<dyn LlmClient> {
        match self {
            Self::OpenAi { api_key } => Arc::new(OpenAiClient::new(api_key)),
            Self::Azure {
                endpoint,
                api_key,
                api_version,
            } => Arc::new(OpenAiClient::azure(endpoint, api_key, api_version)),
            Self::Ollama { host } => Arc::new(OllamaClient::new(host)),
        }
    }
}

/// Settings for one command-line run, read from the environment.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub backend: Backend,
    pub model: Option<String>,
    pub preprocess_model: Option<String>,
    pub workers: Option<usize>,
    pub prompts: Option<PathBuf>,
    /// Detection and verification effort; `none` turns it off.
    pub reasoning_effort: Option<String>,
}

impl RunSettings {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| PipelineError::Configuration(format!("{key} is not set")))
        };

        let input = PathBuf::from(require("RRED_INPUT")?);
        let output_dir = get("RRED_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(results_dir);

        let backend = match get("RRED_BACKEND").as_deref().unwrap_or("openai") {
            "openai" => Backend::OpenAi {
                api_key: require("OPENAI_API_KEY")?,
            },
            "azure" => Backend::Azure {
                endpoint: require("AZURE_OPENAI_ENDPOINT")?,
                api_key: require("AZURE_OPENAI_API_KEY")?,
                api_version: get("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|| AZURE_DEFAULT_API_VERSION.to_string()),
            },
            "ollama" => Backend::Ollama {
                host: get("OLLAMA_HOST").unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string()),
            },
            other => {
                return Err(PipelineError::Configuration(format!(
                    "unknown RRED_BACKEND '{other}' (expected openai, azure or ollama)"
                )))
            }
        };

        let workers = match get("RRED_WORKERS") {
            Some(raw) => Some(raw.trim().parse::<usize>().map_err(|_| {
                PipelineError::Configuration(format!("RRED_WORKERS is not a number: {raw}"))
            })?),
            None => None,
        };

        Ok(Self {
            input,
            output_dir,
            backend,
            model: get("RRED_MODEL"),
            preprocess_model: get("RRED_PREPROCESS_MODEL"),
            workers,
            prompts: get("RRED_PROMPTS").map(PathBuf::from),
            reasoning_effort: get("RRED_REASONING_EFFORT").map(|v| v.trim().to_lowercase()),
        })
    }

    /// Pipeline configuration with this run's overrides applied.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, PipelineError> {
        let mut config = PipelineConfig::default();
        if let Some(model) = &self.model {
            config.detect.model = model.clone();
            config.verify.model = model.clone();
        }
        if let Some(model) = &self.preprocess_model {
            config.preprocess.model = model.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(effort) = &self.reasoning_effort {
            let effort = (effort != "none").then(|| effort.clone());
            config.detect.reasoning_effort = effort.clone();
            config.verify.reasoning_effort = effort;
        }
        if let Some(path) = &self.prompts {
            config.prompts = PromptSet::load(path)?;
        }
        config.validate()?;
        Ok(config)
    }
}
