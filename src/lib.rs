//! codeact - Thought-Code-Observation agent runtime
//!
//! A model writes short Python scripts, the runtime executes them in a
//! persistent per-session interpreter, and the printed output goes back to the
//! model as an observation. Variables survive between scripts.
//!
//! # Modules
//!
//! - `session` - script sessions, their workspaces and the session registry
//! - `agent` - code extraction, the cycle orchestrator and the run store
//! - `llm` - chat model clients (Ollama, OpenAI-compatible)
//! - `config` - settings from defaults and environment
//! - `metrics` - Prometheus metrics
//! - `tracing` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use codeact::llm::{build_model, ModelSpec};
//! use codeact::{CycleOrchestrator, CycleRequest, SessionRegistry, Settings};
//!
//! let settings = Settings::from_env();
//! let model = build_model(&ModelSpec::parse("ollama:qwen3")?, &settings)?;
//! let registry = Arc::new(SessionRegistry::new(settings.registry_config()));
//! let orchestrator = CycleOrchestrator::new(model, registry, settings.cycle_config());
//!
//! let outcome = orchestrator
//!     .run(CycleRequest { task: "Sum 1..100".into(), ..Default::default() })
//!     .await?;
//! ```

pub mod agent;
pub mod config;
pub mod llm;
pub mod metrics;
pub mod session;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{CycleError, CycleOrchestrator, CycleOutcome, CycleRequest};
pub use config::Settings;
pub use session::{ExecutionResult, RunConfig, ScriptSession, SessionRegistry};
