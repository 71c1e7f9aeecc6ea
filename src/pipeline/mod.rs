pub mod error;
pub mod events;
pub mod executor; // Concurrent fan-out/fan-in of one pass
pub mod llm;
pub mod orchestrator; // Preprocess -> detect -> verify state machine
pub mod retry;
pub mod stage;

pub use error::{InvocationError, InvocationErrorKind, PipelineError};
pub use events::{NoProgress, PipelineEvent, PipelineState, ProgressSink};
pub use executor::{ConcurrentStageExecutor, StageRun};
pub use orchestrator::{PipelineOrchestrator, PipelineReport};
pub use retry::{AttemptOutcome, BackoffPolicy, RetryCoordinator, RetryRequest, RetryRun};
