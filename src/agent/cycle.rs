//! CycleOrchestrator - the Thought-Code-Observation state machine
//!
//! ```text
//!             ┌──────────────────────── Observation ◄──────────────┐
//!             ▼                                                    │
//!   ┌───────────────────┐  Execute { script }  ┌─────────────────┐ │
//!   │   Agent step      │ ───────────────────► │  Execute step   │─┘
//!   │ prompt → model →  │                      │ ScriptSession   │
//!   │ extract_script    │                      │ .execute(..)    │
//!   └─────────┬─────────┘                      └─────────────────┘
//!             │ Terminate (no script in reply)
//!             ▼
//!        Terminated
//! ```
//!
//! Each step is computed from an immutable view of the state and applied only
//! once it succeeds, so a retried step always sees the same inputs. Script
//! errors are observations, not step failures.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::extract::{extract_script, strip_code_blocks};
use super::retry::{Attempts, RetryFailure, RetryPolicy, Retryable};
use super::transcript::{build_prompt, Turn, DEFAULT_SYSTEM_PROMPT};
use crate::llm::{ChatModel, ModelError};
use crate::metrics::{CYCLE_RUNS, CYCLE_STEPS, MODEL_CALL_DURATION};
use crate::session::{
    Bindings, ExecutionResult, OutputSink, RunConfig, SessionError, SessionKey, SessionRegistry,
    TracingSink,
};

const DOCUMENT_EXTENSIONS: [&str; 2] = [".md", ".txt"];

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Total steps (agent + execute) allowed per run
    pub max_steps: usize,
    pub retry: RetryPolicy,
    pub system_prompt: String,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            retry: RetryPolicy::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Input for one run
#[derive(Debug, Clone, Default)]
pub struct CycleRequest {
    pub task: String,
    /// Supporting document (`.md` or `.txt`)
    pub document: Option<String>,
    pub run: RunConfig,
    /// Overrides `CycleConfig::max_steps`
    pub max_steps: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Agent,
    Execute,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Agent => f.write_str("agent"),
            Phase::Execute => f.write_str("execute"),
            Phase::Terminated => f.write_str("terminated"),
        }
    }
}

/// Everything a run carries between steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub transcript: Vec<Turn>,
    pub pending_script: Option<String>,
    /// Delta from the most recent execution
    pub bindings: Bindings,
    pub document: Option<PathBuf>,
    pub task: String,
    pub report_sections: Vec<String>,
    pub phase: Phase,
    pub steps: usize,
}

impl CycleState {
    pub fn new(task: impl Into<String>, document: Option<PathBuf>) -> Self {
        let task = task.into();
        Self {
            transcript: vec![Turn::human(task.clone())],
            pending_script: None,
            bindings: Bindings::new(),
            document,
            task,
            report_sections: Vec::new(),
            phase: Phase::Agent,
            steps: 0,
        }
    }

    fn apply_agent(&mut self, output: AgentOutput) {
        let narrative = strip_code_blocks(&output.reply);
        if !narrative.is_empty() {
            self.report_sections.push(narrative);
        }
        self.transcript.push(Turn::agent(output.reply));
        match output.decision {
            AgentDecision::Execute { script } => {
                self.pending_script = Some(script);
                self.phase = Phase::Execute;
            }
            AgentDecision::Terminate => {
                self.pending_script = None;
                self.phase = Phase::Terminated;
            }
        }
    }

    fn apply_execution(&mut self, result: Option<ExecutionResult>) {
        if let Some(result) = result {
            self.transcript.push(Turn::observation(result.output));
            self.bindings = result.bindings;
        }
        self.pending_script = None;
        self.phase = Phase::Agent;
    }

    /// Text of the last agent turn, if any
    pub fn final_reply(&self) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|turn| turn.role == super::transcript::Role::Agent)
            .map(|turn| turn.content.as_str())
    }
}

/// What the agent step decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentDecision {
    Execute { script: String },
    Terminate,
}

#[derive(Debug, Clone)]
struct AgentOutput {
    reply: String,
    decision: AgentDecision,
}

/// Failure of a single step attempt
#[derive(Debug)]
pub enum StepError {
    Model(ModelError),
    Session(SessionError),
}

impl Retryable for StepError {
    fn is_retryable(&self) -> bool {
        match self {
            StepError::Model(e) => e.is_retryable(),
            StepError::Session(e) => e.is_retryable(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Model(e) => write!(f, "{}", e),
            StepError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl From<ModelError> for StepError {
    fn from(e: ModelError) -> Self {
        StepError::Model(e)
    }
}

impl From<SessionError> for StepError {
    fn from(e: SessionError) -> Self {
        StepError::Session(e)
    }
}

/// Error type for cycle runs
#[derive(Debug)]
pub enum CycleError {
    /// Document path does not end in `.md` or `.txt`
    InvalidDocument(String),
    /// The run needed more than `max_steps` steps
    CycleLimit { max_steps: usize },
    /// A step kept failing with retryable errors
    RetriesExhausted {
        step: &'static str,
        attempts: u32,
        last: String,
    },
    /// Non-retryable model failure
    Model(ModelError),
    /// Non-retryable session failure
    Session(SessionError),
}

impl CycleError {
    fn outcome_label(&self) -> &'static str {
        match self {
            CycleError::InvalidDocument(_) => "invalid_document",
            CycleError::CycleLimit { .. } => "cycle_limit",
            CycleError::RetriesExhausted { .. } => "retries_exhausted",
            CycleError::Model(_) => "model_error",
            CycleError::Session(_) => "session_error",
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::InvalidDocument(path) => write!(
                f,
                "Invalid document path {:?}: expected a .md or .txt file",
                path
            ),
            CycleError::CycleLimit { max_steps } => {
                write!(f, "Cycle limit of {} steps reached", max_steps)
            }
            CycleError::RetriesExhausted {
                step,
                attempts,
                last,
            } => write!(
                f,
                "{} step failed after {} attempts: {}",
                step, attempts, last
            ),
            CycleError::Model(e) => write!(f, "Model error: {}", e),
            CycleError::Session(e) => write!(f, "Session error: {}", e),
        }
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CycleError::Model(e) => Some(e),
            CycleError::Session(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for CycleError {
    fn from(e: SessionError) -> Self {
        CycleError::Session(e)
    }
}

impl From<RetryFailure<StepError>> for CycleError {
    fn from(failure: RetryFailure<StepError>) -> Self {
        if failure.error.is_retryable() {
            return CycleError::RetriesExhausted {
                step: failure.step,
                attempts: failure.attempts,
                last: failure.error.to_string(),
            };
        }
        match failure.error {
            StepError::Model(e) => CycleError::Model(e),
            StepError::Session(e) => CycleError::Session(e),
        }
    }
}

/// A run in progress
#[derive(Debug, Clone)]
pub struct CycleRun {
    pub run_id: Uuid,
    pub session_key: SessionKey,
    pub run: RunConfig,
    pub max_steps: usize,
    pub started_at: DateTime<Utc>,
    pub state: CycleState,
}

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub run_id: Uuid,
    pub session_key: SessionKey,
    pub transcript: Vec<Turn>,
    pub bindings: Bindings,
    pub state: CycleState,
}

impl From<CycleRun> for CycleOutcome {
    fn from(run: CycleRun) -> Self {
        Self {
            run_id: run.run_id,
            session_key: run.session_key,
            transcript: run.state.transcript.clone(),
            bindings: run.state.bindings.clone(),
            state: run.state,
        }
    }
}

/// Trim and check the document path
pub fn validate_document(document: Option<&str>) -> Result<Option<PathBuf>, CycleError> {
    let Some(raw) = document else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let lower = trimmed.to_ascii_lowercase();
    if DOCUMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        Ok(Some(PathBuf::from(trimmed)))
    } else {
        Err(CycleError::InvalidDocument(trimmed.to_string()))
    }
}

/// Drives runs against one model and one session registry
pub struct CycleOrchestrator {
    model: Arc<dyn ChatModel>,
    registry: Arc<SessionRegistry>,
    config: CycleConfig,
}

impl CycleOrchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<SessionRegistry>,
        config: CycleConfig,
    ) -> Self {
        Self {
            model,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Run `request` to completion, logging script output
    pub async fn run(&self, request: CycleRequest) -> Result<CycleOutcome, CycleError> {
        let mut run = self.start(&request)?;
        self.drive(&mut run, &mut TracingSink).await?;
        Ok(run.into())
    }

    /// Validate the request and build the initial state
    pub fn start(&self, request: &CycleRequest) -> Result<CycleRun, CycleError> {
        let document = validate_document(request.document.as_deref()).map_err(|e| {
            CYCLE_RUNS.with_label_values(&[e.outcome_label()]).inc();
            e
        })?;
        let session_key = self.registry.key_for(&request.run)?;

        Ok(CycleRun {
            run_id: Uuid::now_v7(),
            session_key,
            run: request.run.clone(),
            max_steps: request.max_steps.unwrap_or(self.config.max_steps),
            started_at: Utc::now(),
            state: CycleState::new(request.task.clone(), document),
        })
    }

    /// Step `run` until it terminates or fails
    ///
    /// On failure `run.state` holds everything up to the last applied step.
    pub async fn drive(
        &self,
        run: &mut CycleRun,
        sink: &mut dyn OutputSink,
    ) -> Result<(), CycleError> {
        let root_span = info_span!(
            "codeact_cycle",
            run_id = %run.run_id,
            session = %run.session_key,
            model = %self.model.name(),
        );

        let result = self.drive_steps(run, sink).instrument(root_span).await;

        CYCLE_STEPS.observe(run.state.steps as f64);
        let label = match &result {
            Ok(()) => "completed",
            Err(e) => e.outcome_label(),
        };
        CYCLE_RUNS.with_label_values(&[label]).inc();
        result
    }

    async fn drive_steps(
        &self,
        run: &mut CycleRun,
        sink: &mut dyn OutputSink,
    ) -> Result<(), CycleError> {
        info!(task = %run.state.task, max_steps = run.max_steps, "Starting cycle");

        loop {
            let phase = run.state.phase;
            if phase == Phase::Terminated {
                break;
            }
            if run.state.steps >= run.max_steps {
                warn!(steps = run.state.steps, "Cycle limit reached");
                return Err(CycleError::CycleLimit {
                    max_steps: run.max_steps,
                });
            }

            let step = run.state.steps + 1;
            match phase {
                Phase::Agent => {
                    let span = info_span!("agent_step", step);
                    let output = self.retry_agent(run).instrument(span).await?;
                    run.state.apply_agent(output);
                }
                Phase::Execute => {
                    let span = info_span!("execute_step", step);
                    let result = self.retry_execute(run, sink).instrument(span).await?;
                    run.state.apply_execution(result);
                }
                Phase::Terminated => break,
            }
            run.state.steps = step;
        }

        info!(
            steps = run.state.steps,
            sections = run.state.report_sections.len(),
            "Cycle completed"
        );
        Ok(())
    }

    async fn retry_agent(&self, run: &CycleRun) -> Result<AgentOutput, CycleError> {
        let mut attempts = Attempts::new(&self.config.retry, "agent");
        loop {
            match self.agent_step(run).await {
                Ok(output) => return Ok(output),
                Err(e) => attempts.after_failure(e).await?,
            }
        }
    }

    async fn retry_execute(
        &self,
        run: &CycleRun,
        sink: &mut dyn OutputSink,
    ) -> Result<Option<ExecutionResult>, CycleError> {
        let mut attempts = Attempts::new(&self.config.retry, "execute");
        loop {
            match self.execute_step(run, &mut *sink).await {
                Ok(result) => return Ok(result),
                Err(e) => attempts.after_failure(e).await?,
            }
        }
    }

    async fn agent_step(&self, run: &CycleRun) -> Result<AgentOutput, StepError> {
        let state = &run.state;
        let document = self.absolute_document(state.document.as_deref())?;
        self.registry.resolve(&run.run, document.as_deref()).await?;

        let prompt = build_prompt(&self.config.system_prompt, &state.transcript, document.as_deref());

        let started = Instant::now();
        let llm_span = info_span!("model_call", model = %self.model.name(), messages = prompt.len());
        let reply = self.model.complete(&prompt).instrument(llm_span).await?;
        let elapsed = started.elapsed().as_secs_f64();
        MODEL_CALL_DURATION
            .with_label_values(&[self.model.name()])
            .observe(elapsed);

        let decision = match extract_script(&reply) {
            Some(script) => AgentDecision::Execute { script },
            None => AgentDecision::Terminate,
        };
        info!(
            duration_ms = (elapsed * 1000.0) as u64,
            reply_len = reply.len(),
            executes = matches!(decision, AgentDecision::Execute { .. }),
            "Model replied"
        );

        Ok(AgentOutput { reply, decision })
    }

    async fn execute_step(
        &self,
        run: &CycleRun,
        sink: &mut dyn OutputSink,
    ) -> Result<Option<ExecutionResult>, StepError> {
        let state = &run.state;
        let Some(script) = state.pending_script.as_deref() else {
            return Ok(None);
        };

        let document = self.absolute_document(state.document.as_deref())?;
        let (_, handle) = self.registry.resolve(&run.run, document.as_deref()).await?;
        let mut session = handle.lock().await;
        let result = session
            .execute_with_sink(script, &state.bindings, sink)
            .await?;
        Ok(Some(result))
    }

    fn absolute_document(&self, document: Option<&Path>) -> Result<Option<PathBuf>, StepError> {
        document
            .map(crate::session::workspace::absolutize)
            .transpose()
            .map_err(|e| StepError::Session(SessionError::Io(e)))
    }
}
