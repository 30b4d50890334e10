//! Agent module - the Thought-Code-Observation loop
//!
//! - `extract` - finds runnable code in model replies
//! - `transcript` - turns, roles and prompt assembly
//! - `retry` - step-level retry policy
//! - `cycle` - the Agent/Execute state machine
//! - `store` - persistence of finished runs

pub mod cycle;
pub mod extract;
pub mod retry;
pub mod store;
pub mod transcript;

pub use cycle::{
    validate_document, AgentDecision, CycleConfig, CycleError, CycleOrchestrator, CycleOutcome,
    CycleRequest, CycleRun, CycleState, Phase, StepError,
};
pub use extract::{extract_script, strip_code_blocks};
pub use retry::{RetryBackoff, RetryPolicy};
pub use store::{RunRecord, RunStore, RunSummary};
pub use transcript::{build_prompt, Role, Turn, DEFAULT_SYSTEM_PROMPT};
