//! Out-of-process Python worker
//!
//! Each script session owns at most one long-lived interpreter process. The
//! host never runs model-generated code itself: it sends the script and the
//! binding table to the worker and reads back a stream of events.
//!
//! # Protocol
//!
//! JSON lines over private duplicates of the worker's stdin/stdout. Inside the
//! worker, file descriptor 1 is pointed at stderr and descriptor 0 at
//! `/dev/null`, so nothing a script does can corrupt the channel.
//!
//! ```text
//! worker → host   {"type":"ready","python":"3.12.1","libraries":[..]}
//! host → worker   {"type":"exec","code":"..","bindings":{name: {"kind":..}}}
//! worker → host   {"type":"stdout","data":".."}            (zero or more)
//! worker → host   {"type":"exec_result","ok":true,"bindings":{..}}
//! host → worker   {"type":"shutdown"}
//! ```
//!
//! Every execution starts from a fresh namespace built from the ambient
//! libraries plus the bindings sent with the request, so a failed script can
//! never leave half of its assignments behind.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::bindings::{Bindings, WireBinding};
use super::error::SessionError;

/// Python program run with `python -u -c`
const RUNNER: &str = r#"
import base64
import builtins
import contextlib
import importlib
import io
import json
import os
import pickle
import sys
import traceback
import types
from pathlib import Path

_PROTO_IN = os.fdopen(os.dup(0), "r", encoding="utf-8")
_PROTO_OUT = os.fdopen(os.dup(1), "w", encoding="utf-8")
os.dup2(2, 1)
_null = os.open(os.devnull, os.O_RDONLY)
os.dup2(_null, 0)
os.close(_null)

_WORKDIR = os.getcwd()
_INT_MIN = -(2 ** 63)
_INT_MAX = 2 ** 64 - 1


def _has_surrogate(text):
    try:
        text.encode("utf-8")
    except UnicodeEncodeError:
        return True
    return False


def _safe(text):
    return text.encode("utf-8", "backslashreplace").decode("utf-8")


def _send(message):
    _PROTO_OUT.write(json.dumps(message) + "\n")
    _PROTO_OUT.flush()


class _ChunkWriter(io.TextIOBase):
    def writable(self):
        return True

    def write(self, text):
        if not isinstance(text, str):
            raise TypeError("write() argument must be str, not " + type(text).__name__)
        if text:
            _send({"type": "stdout", "data": _safe(text)})
        return len(text)


_AMBIENT = {"Path": Path}
for _alias, _name in (
    ("json", "json"), ("math", "math"), ("os", "os"), ("re", "re"),
    ("csv", "csv"), ("statistics", "statistics"), ("datetime", "datetime"),
    ("pd", "pandas"), ("pandas", "pandas"), ("np", "numpy"), ("numpy", "numpy"),
    ("plt", "matplotlib.pyplot"), ("matplotlib", "matplotlib"),
    ("sns", "seaborn"), ("seaborn", "seaborn"),
):
    try:
        _AMBIENT[_alias] = importlib.import_module(_name)
    except Exception:
        pass


def _opaque_tag(value):
    if isinstance(value, io.IOBase):
        return "stream"
    if isinstance(value, types.ModuleType):
        return "module"
    if isinstance(value, (types.GeneratorType, types.CoroutineType, types.AsyncGeneratorType)):
        return "generator"
    if callable(value):
        return "callable"
    return None


def _is_plain(value, depth=0):
    if depth > 64:
        return False
    if value is None or isinstance(value, bool):
        return True
    if isinstance(value, str):
        return not _has_surrogate(value)
    if isinstance(value, int):
        return _INT_MIN <= value <= _INT_MAX
    if isinstance(value, float):
        return value == value and value not in (float("inf"), float("-inf"))
    if type(value) is list:
        return all(_is_plain(item, depth + 1) for item in value)
    if type(value) is dict:
        return all(
            type(k) is str and not _has_surrogate(k) and _is_plain(v, depth + 1)
            for k, v in value.items()
        )
    return False


def _short_repr(value, limit=200):
    try:
        text = repr(value)
    except Exception:
        text = "<" + type(value).__name__ + ">"
    text = _safe(text)
    return text if len(text) <= limit else text[: limit - 3] + "..."


def _encode(value):
    type_name = _safe(type(value).__name__)
    tag = _opaque_tag(value)
    if tag is not None:
        return {"kind": "opaque", "tag": tag, "type_name": type_name}
    if _is_plain(value):
        return {"kind": "json", "value": value}
    try:
        data = pickle.dumps(value)
    except Exception:
        return {"kind": "opaque", "tag": "unserializable", "type_name": type_name}
    return {
        "kind": "pickle",
        "type_name": type_name,
        "repr": _short_repr(value),
        "data": base64.b64encode(data).decode("ascii"),
    }


def _decode(entry):
    kind = entry.get("kind")
    if kind == "json":
        return entry.get("value")
    if kind == "pickle":
        return pickle.loads(base64.b64decode(entry["data"]))
    raise ValueError("unknown binding kind " + repr(kind))


def _failure(exc, skip_frames):
    tb = exc.__traceback__
    for _ in range(skip_frames):
        if tb is not None and tb.tb_next is not None:
            tb = tb.tb_next
    return {
        "type": "exec_result",
        "ok": False,
        "error": _safe(type(exc).__name__ + ": " + str(exc)),
        "traceback": _safe("".join(traceback.format_exception(type(exc), exc, tb))),
    }


def _execute(code, bindings):
    os.chdir(_WORKDIR)
    namespace = dict(_AMBIENT)
    namespace["__builtins__"] = builtins
    namespace["__name__"] = "__main__"
    for name, entry in bindings.items():
        try:
            namespace[name] = _decode(entry)
        except Exception as exc:
            result = _failure(exc, 1)
            result["error"] = "could not restore binding " + repr(name) + ": " + result["error"]
            return result
    before = set(namespace)
    try:
        with contextlib.redirect_stdout(_ChunkWriter()):
            exec(compile(code, "<script>", "exec"), namespace)
    except BaseException as exc:
        return _failure(exc, 1)
    new = {}
    for name, value in namespace.items():
        if not isinstance(name, str) or _has_surrogate(name):
            continue
        if name in before or name.startswith("__"):
            continue
        new[name] = _encode(value)
    return {"type": "exec_result", "ok": True, "bindings": new}


_send({"type": "ready", "python": sys.version.split()[0], "libraries": sorted(_AMBIENT)})

while True:
    line = _PROTO_IN.readline()
    if not line:
        break
    try:
        request = json.loads(line)
    except ValueError as exc:
        _send({"type": "exec_result", "ok": False, "error": "invalid request: " + str(exc), "traceback": ""})
        continue
    kind = request.get("type")
    if kind == "shutdown":
        break
    if kind != "exec":
        _send({"type": "exec_result", "ok": False, "error": "unknown request type " + repr(kind), "traceback": ""})
        continue
    try:
        _send(_execute(request.get("code", ""), request.get("bindings") or {}))
    except Exception as exc:
        _send(_failure(exc, 0))
"#;

/// Process-level limits applied to the interpreter before it starts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Address-space ceiling in bytes (`RLIMIT_AS`)
    pub memory_bytes: Option<u64>,
    /// CPU time ceiling in seconds (`RLIMIT_CPU`)
    pub cpu_seconds: Option<u64>,
}

impl ResourceLimits {
    /// No limits beyond the execution deadline
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// 2GB address space, 60 CPU seconds
    pub fn small() -> Self {
        Self {
            memory_bytes: Some(2 * 1024 * 1024 * 1024),
            cpu_seconds: Some(60),
        }
    }

    /// 4GB address space, 300 CPU seconds
    pub fn medium() -> Self {
        Self {
            memory_bytes: Some(4 * 1024 * 1024 * 1024),
            cpu_seconds: Some(300),
        }
    }

    /// 8GB address space, 900 CPU seconds
    pub fn large() -> Self {
        Self {
            memory_bytes: Some(8 * 1024 * 1024 * 1024),
            cpu_seconds: Some(900),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu_seconds.is_none()
    }
}

/// How workers are started and bounded
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Interpreter command, split on whitespace (e.g. "python3" or "uv run python")
    pub python_command: String,
    /// Wall-clock deadline for one execution
    pub exec_timeout: Duration,
    /// How long the interpreter may take to import its ambient libraries
    pub startup_timeout: Duration,
    /// Observation text beyond this many characters is truncated
    pub max_output_chars: usize,
    pub limits: ResourceLimits,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            python_command: "python3".to_string(),
            exec_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(60),
            max_output_chars: 20_000,
            limits: ResourceLimits::unlimited(),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Exec { code: &'a str, bindings: &'a Bindings },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerEvent {
    Ready {
        #[serde(default)]
        python: String,
        #[serde(default)]
        libraries: Vec<String>,
    },
    Stdout {
        data: String,
    },
    ExecResult {
        ok: bool,
        #[serde(default)]
        bindings: BTreeMap<String, WireBinding>,
        #[serde(default)]
        error: String,
        #[serde(default)]
        traceback: String,
    },
}

/// How one execution ended, from the worker's point of view
#[derive(Debug)]
pub(crate) enum Completion {
    Finished {
        ok: bool,
        bindings: BTreeMap<String, WireBinding>,
        error: String,
        traceback: String,
    },
    /// The interpreter died before reporting a result
    Exited,
    /// The script was sent but the reply could not be read
    Broken(SessionError),
}

/// Receives script stdout as it is produced
pub trait OutputSink: Send {
    fn write_chunk(&mut self, chunk: &str);
}

impl OutputSink for String {
    fn write_chunk(&mut self, chunk: &str) {
        self.push_str(chunk);
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_chunk(&mut self, _chunk: &str) {}
}

/// Forwards each chunk to the `debug` log
#[derive(Debug, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write_chunk(&mut self, chunk: &str) {
        debug!(chunk = %chunk.trim_end(), "script output");
    }
}

/// Bounded capture buffer for observation text
#[derive(Debug)]
pub(crate) struct OutputCapture {
    text: String,
    chars: usize,
    limit: usize,
    dropped: usize,
}

impl OutputCapture {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            limit,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &str) {
        let room = self.limit.saturating_sub(self.chars);
        let total = chunk.chars().count();
        if total <= room {
            self.text.push_str(chunk);
            self.chars += total;
        } else {
            self.text.extend(chunk.chars().take(room));
            self.chars += room;
            self.dropped += total - room;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.text.is_empty() && self.dropped == 0
    }

    pub(crate) fn finish(self) -> String {
        if self.dropped == 0 {
            self.text
        } else {
            format!(
                "{}\n... [output truncated, {} more characters]",
                self.text, self.dropped
            )
        }
    }
}

/// A running interpreter process
pub(crate) struct PythonWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    python_version: String,
    libraries: Vec<String>,
}

impl PythonWorker {
    /// Start an interpreter in `workdir` and wait for its ready message
    pub(crate) async fn spawn(
        settings: &WorkerSettings,
        workdir: &Path,
    ) -> Result<Self, SessionError> {
        let mut parts = settings.python_command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SessionError::WorkerStartup("empty interpreter command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .arg("-u")
            .arg("-c")
            .arg(RUNNER)
            .current_dir(workdir)
            .env("MPLBACKEND", "Agg")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_limits(&mut command, &settings.limits);

        let mut child = command.spawn().map_err(|source| SessionError::WorkerSpawn {
            command: settings.python_command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SessionError::WorkerStartup("failed to capture interpreter stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::WorkerStartup("failed to capture interpreter stdout".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, child.id()));
        }

        let mut worker = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            python_version: String::new(),
            libraries: Vec::new(),
        };

        match tokio::time::timeout(settings.startup_timeout, worker.next_event()).await {
            Ok(Ok(Some(WorkerEvent::Ready { python, libraries }))) => {
                debug!(
                    pid = ?worker.pid(),
                    python = %python,
                    libraries = ?libraries,
                    "Interpreter ready"
                );
                worker.python_version = python;
                worker.libraries = libraries;
                Ok(worker)
            }
            Ok(Ok(Some(other))) => Err(SessionError::Protocol(format!(
                "expected ready message, got {:?}",
                other
            ))),
            Ok(Ok(None)) => Err(SessionError::WorkerStartup(
                "interpreter exited before it was ready".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::WorkerStartup(format!(
                "no ready message within {} ms",
                settings.startup_timeout.as_millis()
            ))),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn python_version(&self) -> &str {
        &self.python_version
    }

    pub(crate) fn libraries(&self) -> &[String] {
        &self.libraries
    }

    /// Run one script, streaming stdout into `capture` and `sink`
    ///
    /// Only a failed send is an error: the script never started, so the
    /// call can be repeated. Anything that goes wrong after that is reported
    /// as [`Completion::Broken`]. Callers bound this with a deadline; the
    /// worker is unusable if the future is dropped half-way.
    pub(crate) async fn run(
        &mut self,
        code: &str,
        bindings: &Bindings,
        capture: &mut OutputCapture,
        sink: &mut dyn OutputSink,
    ) -> Result<Completion, SessionError> {
        self.send(&WorkerRequest::Exec { code, bindings }).await?;

        loop {
            let event = match self.next_event().await {
                Ok(event) => event,
                Err(e) => return Ok(Completion::Broken(e)),
            };
            match event {
                None => return Ok(Completion::Exited),
                Some(WorkerEvent::Stdout { data }) => {
                    sink.write_chunk(&data);
                    capture.push(&data);
                }
                Some(WorkerEvent::ExecResult {
                    ok,
                    bindings,
                    error,
                    traceback,
                }) => {
                    return Ok(Completion::Finished {
                        ok,
                        bindings,
                        error,
                        traceback,
                    })
                }
                Some(WorkerEvent::Ready { .. }) => {
                    return Ok(Completion::Broken(SessionError::Protocol(
                        "unexpected ready message during execution".to_string(),
                    )))
                }
            }
        }
    }

    /// Ask the interpreter to exit, killing it if it does not
    pub(crate) async fn shutdown(mut self) {
        let _ = self.send(&WorkerRequest::Shutdown).await;
        let _ = self.stdin.shutdown().await;
        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_err()
        {
            warn!(pid = ?self.pid(), "Interpreter ignored shutdown, killing");
            let _ = self.child.kill().await;
        }
    }

    /// Kill the interpreter immediately
    pub(crate) async fn kill(mut self) {
        let _ = self.child.kill().await;
    }

    async fn send(&mut self, request: &WorkerRequest<'_>) -> Result<(), SessionError> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next protocol message, or `None` once the interpreter has exited
    async fn next_event(&mut self) -> Result<Option<WorkerEvent>, SessionError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).map(Some).map_err(|e| {
                let raw: String = trimmed.chars().take(200).collect();
                SessionError::Protocol(format!(
                    "invalid message from interpreter: {}; raw={}",
                    e, raw
                ))
            });
        }
    }
}

impl Drop for PythonWorker {
    fn drop(&mut self) {
        self.child.start_kill().ok();
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid = ?pid, "interpreter stderr: {}", line);
    }
}

#[cfg(unix)]
fn apply_limits(command: &mut Command, limits: &ResourceLimits) {
    use nix::sys::resource::{setrlimit, Resource};

    if limits.is_unlimited() {
        return;
    }
    let limits = limits.clone();
    // SAFETY: the hook runs between fork and exec and only calls setrlimit,
    // which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if let Some(bytes) = limits.memory_bytes {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
            }
            if let Some(seconds) = limits.cpu_seconds {
                setrlimit(Resource::RLIMIT_CPU, seconds, seconds)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_command: &mut Command, limits: &ResourceLimits) {
    if !limits.is_unlimited() {
        warn!("Resource limits are only enforced on unix hosts");
    }
}
