//! ScriptSession - persistent execution context for model-generated scripts
//!
//! ```text
//!  execute(script, incoming)
//!        │
//!        ▼
//!  ┌──────────────┐  merge   ┌───────────────┐  exec + table  ┌──────────────┐
//!  │   incoming   │ ───────► │ binding table │ ─────────────► │ PythonWorker │
//!  └──────────────┘          └───────────────┘                └──────┬───────┘
//!                                                                    │ stdout chunks
//!                                    ExecutionResult ◄── delta ◄─────┘ exec_result
//! ```
//!
//! The binding table only grows through the incoming merge. Whatever a script
//! defines comes back as a delta and is carried forward by the caller, so a
//! failing script never leaves partial state behind.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use super::bindings::{BindingValue, Bindings, ExcludedBinding};
use super::error::SessionError;
use super::worker::{
    Completion, OutputCapture, OutputSink, PythonWorker, TracingSink, WorkerSettings,
};
use super::workspace::{absolutize, Workspace, DOCUMENT_PATH};
use crate::metrics::{LIVE_WORKERS, SCRIPT_EXECUTIONS, SCRIPT_EXECUTION_DURATION, WORKER_STARTS};

/// Observation text for a successful script that printed nothing
pub const SUCCESS_SENTINEL: &str = "Code executed successfully.";

/// Outcome of one `execute` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured stdout, the success sentinel, or `Error: ..` text
    pub output: String,
    /// Names introduced by this call (empty on failure)
    pub bindings: Bindings,
    pub success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// New names that could not be carried forward
    pub excluded: Vec<ExcludedBinding>,
}

/// Entry in the session's execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub script: String,
    pub output: String,
    pub success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

pub struct ScriptSession {
    workspace: Workspace,
    document: Option<PathBuf>,
    /// Table state right after creation plus any constants added since
    seeded: Bindings,
    bindings: Bindings,
    history: Vec<ExecutionRecord>,
    settings: WorkerSettings,
    worker: Option<PythonWorker>,
    closed: bool,
}

impl ScriptSession {
    /// Prepare the workspace and seed the path constants
    ///
    /// No interpreter is started until the first execution.
    pub fn create(
        workspace_path: impl AsRef<Path>,
        document: Option<&Path>,
        settings: WorkerSettings,
    ) -> Result<Self, SessionError> {
        let workspace = Workspace::create(workspace_path)?;

        let mut seeded = Bindings::new();
        for (name, path) in workspace.constants() {
            seeded.insert(name, path_binding(&path));
        }
        let document = match document {
            Some(path) => {
                let path = absolutize(path)?;
                seeded.insert(DOCUMENT_PATH, path_binding(&path));
                Some(path)
            }
            None => None,
        };

        debug!(workspace = %workspace.root().display(), "Script session created");

        Ok(Self {
            workspace,
            document,
            bindings: seeded.clone(),
            seeded,
            history: Vec::new(),
            settings,
            worker: None,
            closed: false,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn document(&self) -> Option<&Path> {
        self.document.as_deref()
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Process id of the running interpreter, if one is up
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(PythonWorker::pid)
    }

    /// Point `DOCUMENT_PATH` at a new supporting document
    pub fn set_document(&mut self, document: &Path) -> Result<(), SessionError> {
        let path = absolutize(document)?;
        self.seeded.insert(DOCUMENT_PATH, path_binding(&path));
        self.bindings.insert(DOCUMENT_PATH, path_binding(&path));
        self.document = Some(path);
        Ok(())
    }

    /// Current binding table
    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Add a named constant that survives `reset`
    pub fn set_binding(&mut self, name: impl Into<String>, value: BindingValue) {
        let name = name.into();
        self.seeded.insert(name.clone(), value.clone());
        self.bindings.insert(name, value);
    }

    pub fn history(&self) -> &[ExecutionRecord] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Run `script` with stdout forwarded to the debug log
    pub async fn execute(
        &mut self,
        script: &str,
        incoming: &Bindings,
    ) -> Result<ExecutionResult, SessionError> {
        self.execute_with_sink(script, incoming, &mut TracingSink).await
    }

    /// Run `script`, streaming its stdout into `sink` as it is produced
    ///
    /// Script failures (exceptions, timeouts, a crashed or garbled interpreter)
    /// come back as an unsuccessful [`ExecutionResult`]. Errors are returned
    /// only when the script never reached the interpreter.
    pub async fn execute_with_sink(
        &mut self,
        script: &str,
        incoming: &Bindings,
        sink: &mut dyn OutputSink,
    ) -> Result<ExecutionResult, SessionError> {
        if self.closed {
            return Err(SessionError::Closed(self.workspace.root().to_path_buf()));
        }

        let span = info_span!(
            "script_execution",
            workspace = %self.workspace.root().display(),
            script_len = script.len(),
            incoming = incoming.len(),
        );
        self.run_script(script, incoming, sink).instrument(span).await
    }

    async fn run_script(
        &mut self,
        script: &str,
        incoming: &Bindings,
        sink: &mut dyn OutputSink,
    ) -> Result<ExecutionResult, SessionError> {
        self.bindings.merge(incoming);
        self.workspace.ensure_layout()?;

        let worker = match self.worker.take() {
            Some(worker) => self.worker.insert(worker),
            None => {
                let spawned = PythonWorker::spawn(&self.settings, self.workspace.root()).await?;
                WORKER_STARTS.inc();
                LIVE_WORKERS.inc();
                info!(
                    pid = ?spawned.pid(),
                    python = %spawned.python_version(),
                    "Interpreter started"
                );
                self.worker.insert(spawned)
            }
        };

        let mut capture = OutputCapture::new(self.settings.max_output_chars);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.settings.exec_timeout,
            worker.run(script, &self.bindings, &mut capture, sink),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(Completion::Finished {
                ok: true,
                bindings,
                ..
            })) => {
                let (delta, excluded) = Bindings::from_wire(bindings);
                let output = if capture.is_empty() {
                    SUCCESS_SENTINEL.to_string()
                } else {
                    capture.finish()
                };
                for skipped in &excluded {
                    debug!(
                        name = %skipped.name,
                        kind = %skipped.kind,
                        type_name = %skipped.type_name,
                        "Binding not carried forward"
                    );
                }
                ExecutionResult {
                    output,
                    bindings: delta,
                    success: true,
                    timed_out: false,
                    duration_ms,
                    excluded,
                }
            }
            Ok(Ok(Completion::Finished {
                error, traceback, ..
            })) => failed(failure_output(&error, &traceback), false, duration_ms),
            Ok(Ok(Completion::Exited)) => {
                self.discard_worker().await;
                let message = "interpreter process exited during execution";
                warn!("{}", message);
                failed(
                    with_partial_output(failure_output(message, ""), capture),
                    false,
                    duration_ms,
                )
            }
            Ok(Ok(Completion::Broken(e))) => {
                // the script may already have run
                self.discard_worker().await;
                let message = format!("lost contact with the interpreter: {}", e);
                warn!("{}", message);
                failed(
                    with_partial_output(failure_output(&message, ""), capture),
                    false,
                    duration_ms,
                )
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Could not send script, discarding worker");
                self.discard_worker().await;
                return Err(e);
            }
            Err(_) => {
                self.discard_worker().await;
                let message = format!(
                    "execution timed out after {} ms",
                    self.settings.exec_timeout.as_millis()
                );
                warn!("{}", message);
                failed(
                    with_partial_output(failure_output(&message, ""), capture),
                    true,
                    duration_ms,
                )
            }
        };

        let status = if result.success {
            "success"
        } else if result.timed_out {
            "timeout"
        } else {
            "error"
        };
        SCRIPT_EXECUTIONS.with_label_values(&[status]).inc();
        SCRIPT_EXECUTION_DURATION.observe(duration_ms as f64 / 1000.0);

        if result.success {
            info!(
                duration_ms,
                new_bindings = result.bindings.len(),
                excluded = result.excluded.len(),
                "Script succeeded"
            );
        } else {
            info!(duration_ms, timed_out = result.timed_out, "Script failed");
        }

        self.history.push(ExecutionRecord {
            script: script.to_string(),
            output: result.output.clone(),
            success: result.success,
            timed_out: result.timed_out,
            duration_ms,
            executed_at: Utc::now(),
        });

        Ok(result)
    }

    /// Restore the seeded table, clear the log and restart the interpreter
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed(self.workspace.root().to_path_buf()));
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
            LIVE_WORKERS.dec();
        }
        self.bindings = self.seeded.clone();
        self.history.clear();
        self.workspace.ensure_layout()?;
        info!(workspace = %self.workspace.root().display(), "Script session reset");
        Ok(())
    }

    /// Stop the interpreter and close the session
    ///
    /// Only the first call has any effect.
    pub async fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
            LIVE_WORKERS.dec();
        }
        info!(
            workspace = %self.workspace.root().display(),
            executions = self.history.len(),
            "Script session cleaned up"
        );
    }

    /// Names and types in the binding table, one per line
    pub fn available_variables(&self) -> String {
        if self.bindings.is_empty() {
            return "No variables defined.".to_string();
        }
        let mut lines = vec!["Available variables:".to_string()];
        for (name, value) in self.bindings.iter() {
            lines.push(format!("- {} ({}): {}", name, value.type_name(), preview(value)));
        }
        lines.join("\n")
    }

    /// Workspace layout plus session status
    pub fn workspace_info(&self) -> String {
        let mut info = self.workspace.describe();
        if let Some(document) = &self.document {
            info.push_str(&format!("\nDocument: {}", document.display()));
        }
        info.push_str(&format!("\nBindings: {}", self.bindings.len()));
        info.push_str(&format!("\nExecutions: {}", self.history.len()));
        match &self.worker {
            Some(worker) => info.push_str(&format!(
                "\nInterpreter: Python {} ({} libraries)",
                worker.python_version(),
                worker.libraries().len()
            )),
            None => info.push_str("\nInterpreter: not running"),
        }
        info
    }

    async fn discard_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.kill().await;
            LIVE_WORKERS.dec();
        }
    }
}

impl Drop for ScriptSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                workspace = %self.workspace.root().display(),
                "Script session dropped without cleanup"
            );
        }
        if self.worker.take().is_some() {
            LIVE_WORKERS.dec();
        }
    }
}

fn path_binding(path: &Path) -> BindingValue {
    BindingValue::json(path.to_string_lossy().into_owned())
}

fn failure_output(error: &str, traceback: &str) -> String {
    format!("Error: {}\n{}", error, traceback)
}

fn with_partial_output(output: String, capture: OutputCapture) -> String {
    if capture.is_empty() {
        output
    } else {
        format!("{}\nOutput before failure:\n{}", output, capture.finish())
    }
}

fn failed(output: String, timed_out: bool, duration_ms: u64) -> ExecutionResult {
    ExecutionResult {
        output,
        bindings: Bindings::new(),
        success: false,
        timed_out,
        duration_ms,
        excluded: Vec::new(),
    }
}

fn preview(value: &BindingValue) -> String {
    let text = value.to_string();
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() > 80 || text.contains('\n') {
        let short: String = first_line.chars().take(77).collect();
        format!("{}...", short)
    } else {
        first_line.to_string()
    }
}
