//! Integration tests for script sessions
//!
//! Everything that executes a script needs a `python3` on PATH; those tests
//! return early when it is missing.

use std::path::Path;
use std::time::Duration;

use codeact::session::workspace::{DATA_DIR, WORKSPACE_PATH};
use codeact::session::{
    BindingValue, Bindings, OpaqueKind, ScriptSession, SessionError, WorkerSettings,
    SUCCESS_SENTINEL,
};
use serde_json::json;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

macro_rules! require_python {
    () => {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
    };
}

fn session_with(dir: &Path, settings: WorkerSettings) -> ScriptSession {
    ScriptSession::create(dir.join("ws"), None, settings).unwrap()
}

fn session(dir: &Path) -> ScriptSession {
    session_with(dir, WorkerSettings::default())
}

fn json_binding(bindings: &Bindings, name: &str) -> Option<serde_json::Value> {
    bindings.get(name).and_then(BindingValue::as_json).cloned()
}

/// Creating a session twice against one path never fails and yields the layout
#[test]
fn test_setup_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let first = session(tmp.path());
    let second = session(tmp.path());

    let mut dirs: Vec<String> = std::fs::read_dir(tmp.path().join("ws"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();

    assert_eq!(dirs, vec!["data", "outputs", "reports", "visualizations"]);
    assert_eq!(first.bindings(), second.bindings());
}

/// `y = x + 1` with `{x: 1}` reports only `y`
#[tokio::test]
async fn test_delta_contains_only_new_names() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let mut incoming = Bindings::new();
    incoming.insert("x", BindingValue::json(1));
    let result = session.execute("y = x + 1", &incoming).await.unwrap();

    assert!(result.success);
    assert_eq!(result.output, SUCCESS_SENTINEL);
    assert_eq!(result.bindings.names().collect::<Vec<_>>(), vec!["y"]);
    assert_eq!(json_binding(&result.bindings, "y"), Some(json!(2)));
    assert!(session.bindings().contains("x"));
    assert!(!session.bindings().contains("y"));
    session.cleanup().await;
}

/// A raising script yields an empty delta and a failed log entry
#[tokio::test]
async fn test_failure_is_isolated() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let result = session
        .execute("a = 5\nraise ValueError('boom')", &Bindings::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(!result.timed_out);
    assert!(result.bindings.is_empty());
    assert!(result.output.starts_with("Error: ValueError: boom\n"));
    assert!(result.output.contains("Traceback"));
    assert!(!session.history().last().unwrap().success);
    assert!(!session.bindings().contains("a"));
    session.cleanup().await;
}

/// Prints arrive in order, both in the result and in the sink
#[tokio::test]
async fn test_output_capture_order() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());
    let mut mirrored = String::new();

    let result = session
        .execute_with_sink("print('first')\nprint('second')", &Bindings::new(), &mut mirrored)
        .await
        .unwrap();

    assert_eq!(result.output, "first\nsecond\n");
    assert_eq!(mirrored, "first\nsecond\n");
    session.cleanup().await;
}

/// Names carried forward through deltas stay visible in later calls
#[tokio::test]
async fn test_bindings_carry_forward() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let first = session.execute("a = [1, 2]", &Bindings::new()).await.unwrap();
    let second = session.execute("b = len(a)", &first.bindings).await.unwrap();
    let third = session.execute("c = a[0] + b", &second.bindings).await.unwrap();

    assert_eq!(json_binding(&second.bindings, "b"), Some(json!(2)));
    assert_eq!(json_binding(&third.bindings, "c"), Some(json!(3)));
    assert_eq!(session.history().len(), 3);
    session.cleanup().await;
}

/// Non-JSON values survive as pickles
#[tokio::test]
async fn test_pickled_values_round_trip() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let first = session
        .execute("s = {1, 2, 3}\nbig = 2 ** 70", &Bindings::new())
        .await
        .unwrap();
    let s = first.bindings.get("s").unwrap();
    assert!(matches!(s, BindingValue::Pickle { .. }));
    assert_eq!(s.type_name(), "set");
    assert_eq!(first.bindings.get("big").unwrap().type_name(), "int");

    let second = session
        .execute("n = len(s)\nsmall = big // 2 ** 69", &first.bindings)
        .await
        .unwrap();
    assert_eq!(json_binding(&second.bindings, "n"), Some(json!(3)));
    assert_eq!(json_binding(&second.bindings, "small"), Some(json!(2)));
    session.cleanup().await;
}

/// File handles, functions and modules are excluded from the delta
#[tokio::test]
async fn test_opaque_values_are_excluded() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let script = "\
fh = open(os.path.join(OUTPUT_DIR, 'notes.txt'), 'w')
def helper():
    return 1
import string as text_mod
gen = (i for i in range(3))
n = helper()
";
    let result = session.execute(script, &Bindings::new()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.bindings.names().collect::<Vec<_>>(), vec!["n"]);

    let kind_of = |name: &str| {
        result
            .excluded
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.kind)
    };
    assert_eq!(kind_of("fh"), Some(OpaqueKind::Stream));
    assert_eq!(kind_of("helper"), Some(OpaqueKind::Callable));
    assert_eq!(kind_of("text_mod"), Some(OpaqueKind::Module));
    assert_eq!(kind_of("gen"), Some(OpaqueKind::Generator));
    session.cleanup().await;
}

/// A runaway script times out and the session keeps working
#[tokio::test]
async fn test_timeout_then_recovery() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session_with(
        tmp.path(),
        WorkerSettings {
            exec_timeout: Duration::from_secs(1),
            ..WorkerSettings::default()
        },
    );

    let stuck = session
        .execute("import time\ntime.sleep(30)", &Bindings::new())
        .await
        .unwrap();
    assert!(!stuck.success);
    assert!(stuck.timed_out);
    assert!(stuck.output.contains("timed out"));
    assert!(session.worker_pid().is_none());

    let next = session.execute("z = 1", &Bindings::new()).await.unwrap();
    assert!(next.success);
    assert_eq!(json_binding(&next.bindings, "z"), Some(json!(1)));
    session.cleanup().await;
}

/// Neither SystemExit nor a hard exit takes the session down
#[tokio::test]
async fn test_exit_calls_are_failures() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let soft = session
        .execute("import sys\nsys.exit(3)", &Bindings::new())
        .await
        .unwrap();
    assert!(!soft.success);
    assert!(soft.output.starts_with("Error: SystemExit"));

    let hard = session
        .execute("print('bye')\nos._exit(1)", &Bindings::new())
        .await
        .unwrap();
    assert!(!hard.success);
    assert!(hard.output.contains("exited"));

    let after = session.execute("ok = True", &Bindings::new()).await.unwrap();
    assert!(after.success);
    session.cleanup().await;
}

/// Scripts run in the workspace while the host directory stays put
#[tokio::test]
async fn test_scripts_run_in_workspace() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let host_cwd = std::env::current_dir().unwrap();
    let mut session = session(tmp.path());

    let result = session
        .execute("cwd = os.getcwd()\nprint(DATA_DIR)", &Bindings::new())
        .await
        .unwrap();

    let cwd = json_binding(&result.bindings, "cwd").unwrap();
    assert_eq!(
        std::fs::canonicalize(cwd.as_str().unwrap()).unwrap(),
        std::fs::canonicalize(session.workspace().root()).unwrap()
    );
    assert_eq!(
        result.output.trim(),
        session.bindings().get(DATA_DIR).unwrap().as_json().unwrap().as_str().unwrap()
    );
    assert!(session.bindings().contains(WORKSPACE_PATH));
    assert_eq!(std::env::current_dir().unwrap(), host_cwd);
    session.cleanup().await;
}

/// Long output is cut with a marker
#[tokio::test]
async fn test_output_truncation() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session_with(
        tmp.path(),
        WorkerSettings {
            max_output_chars: 10,
            ..WorkerSettings::default()
        },
    );

    let result = session
        .execute("print('x' * 50)", &Bindings::new())
        .await
        .unwrap();
    assert!(result.output.starts_with("xxxxxxxxxx\n... [output truncated, 41 more characters]"));
    session.cleanup().await;
}

/// Deleted subdirectories are back before the next script runs
#[tokio::test]
async fn test_layout_restored_before_execution() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());
    std::fs::remove_dir(session.workspace().reports_dir()).unwrap();

    let result = session
        .execute("print(os.path.isdir(REPORTS_DIR))", &Bindings::new())
        .await
        .unwrap();
    assert_eq!(result.output, "True\n");
    session.cleanup().await;
}

/// After cleanup the session refuses to run
#[tokio::test]
async fn test_cleanup_closes_session() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    session.execute("x = 1", &Bindings::new()).await.unwrap();
    assert!(session.worker_pid().is_some());

    session.cleanup().await;
    assert!(session.worker_pid().is_none());
    assert!(matches!(
        session.execute("x = 2", &Bindings::new()).await,
        Err(SessionError::Closed(_))
    ));
}

/// A missing interpreter is an infrastructure error, not a script failure
#[tokio::test]
async fn test_missing_interpreter_is_retryable_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session_with(
        tmp.path(),
        WorkerSettings {
            python_command: "definitely-not-a-python-binary".to_string(),
            ..WorkerSettings::default()
        },
    );

    let err = session.execute("x = 1", &Bindings::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::WorkerSpawn { .. }));
    assert!(err.is_retryable());
    assert!(session.history().is_empty());
    session.cleanup().await;
}

/// A lone surrogate prints escaped and survives as a pickled binding
#[tokio::test]
async fn test_lone_surrogate_output_and_binding() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let first = session
        .execute("print('a\\ud800b')\ns = '\\ud800'", &Bindings::new())
        .await
        .unwrap();
    assert!(first.success, "{}", first.output);
    assert_eq!(first.output, "a\\ud800b\n");
    let s = first.bindings.get("s").unwrap();
    assert!(matches!(s, BindingValue::Pickle { .. }));
    assert_eq!(s.type_name(), "str");

    let second = session
        .execute("n = len(s)\nsame = s == chr(0xd800)", &first.bindings)
        .await
        .unwrap();
    assert!(second.success, "{}", second.output);
    assert_eq!(json_binding(&second.bindings, "n"), Some(json!(1)));
    assert_eq!(json_binding(&second.bindings, "same"), Some(json!(true)));
    assert_eq!(session.history().len(), 2);
    session.cleanup().await;
}

/// An unreadable reply after the script was sent is a failed run, not an error
#[tokio::test]
async fn test_garbled_reply_is_failed_observation() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    let script = "\
import sys
proto = sys.modules['__main__']._PROTO_OUT
proto.write('not json\\n')
proto.flush()
";
    let result = session.execute(script, &Bindings::new()).await.unwrap();

    assert!(!result.success);
    assert!(!result.timed_out);
    assert!(result.bindings.is_empty());
    assert!(result.output.starts_with("Error: lost contact with the interpreter"));
    assert!(!session.history().last().unwrap().success);
    assert!(session.worker_pid().is_none());

    let next = session.execute("ok = 1", &Bindings::new()).await.unwrap();
    assert!(next.success);
    assert_eq!(json_binding(&next.bindings, "ok"), Some(json!(1)));
    session.cleanup().await;
}

/// Reassigning an incoming name is not reported and leaves the table alone
#[tokio::test]
async fn test_rebinding_incoming_name_is_not_reported() {
    require_python!();
    let tmp = tempfile::tempdir().unwrap();
    let mut session = session(tmp.path());

    session.set_binding("x", BindingValue::json(1));
    let incoming = session.bindings().clone();

    let result = session.execute("x = x + 1", &incoming).await.unwrap();
    assert!(result.success);
    assert!(result.bindings.is_empty());
    assert_eq!(
        session.bindings().get("x").and_then(BindingValue::as_json),
        Some(&json!(1))
    );
    session.cleanup().await;
}
