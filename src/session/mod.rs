//! Script sessions: persistent, process-isolated execution contexts
//!
//! - `workspace` - on-disk directory layout and its path constants
//! - `bindings` - transferable values and the opaque-kind classification
//! - `worker` - the interpreter subprocess and its line protocol
//! - `script` - [`ScriptSession`], one binding table + one workspace
//! - `registry` - maps run identifiers to shared sessions

pub mod bindings;
pub mod error;
pub mod registry;
pub mod script;
pub mod worker;
pub mod workspace;

pub use bindings::{BindingValue, Bindings, ExcludedBinding, OpaqueKind, Transferability};
pub use error::SessionError;
pub use registry::{RegistryConfig, RunConfig, SessionHandle, SessionHook, SessionKey, SessionRegistry};
pub use script::{ExecutionRecord, ExecutionResult, ScriptSession, SUCCESS_SENTINEL};
pub use worker::{NullSink, OutputSink, ResourceLimits, TracingSink, WorkerSettings};
pub use workspace::Workspace;
