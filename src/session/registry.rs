//! SessionRegistry - one script session per derived session key
//!
//! ```text
//!  RunConfig { session_id, thread_id, user_id, workspace_name }
//!        │
//!        ▼  session_id → thread_id → "default", with user_id or "anonymous"
//!  SessionKey { user_id, key, workspace = {base}/{user}_{key} | {base}/{name} }
//!        │
//!        ▼
//!  ┌──────────────────────────────────────────────┐
//!  │ workspace path → Arc<Mutex<ScriptSession>>   │  created on first resolve
//!  └──────────────────────────────────────────────┘
//! ```
//!
//! By default the registry never drops a session, so every key maps to a
//! single session for the life of the process. Setting `max_sessions` or
//! `idle_ttl` trades that for bounded resource use: evicted sessions are
//! cleaned up and a later resolve starts a fresh one on the same workspace.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::SessionError;
use super::script::ScriptSession;
use super::worker::WorkerSettings;
use super::workspace::absolutize;
use crate::metrics::LIVE_SESSIONS;

/// Shared handle to a registered session
pub type SessionHandle = Arc<Mutex<ScriptSession>>;

const DEFAULT_SESSION: &str = "default";
const DEFAULT_USER: &str = "anonymous";

/// Per-run identifiers used to pick a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub session_id: Option<String>,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    /// Use `{base}/{workspace_name}` instead of the derived directory
    pub workspace_name: Option<String>,
}

/// Identity of a session and where its workspace lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub key: String,
    pub workspace: PathBuf,
}

impl SessionKey {
    /// Derive the key for `run` under `base`
    ///
    /// Empty identifiers count as absent. Each identifier must be a single
    /// plain path component so the workspace stays directly under `base`.
    pub fn derive(run: &RunConfig, base: &Path) -> Result<Self, SessionError> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let key = present(&run.session_id)
            .or_else(|| present(&run.thread_id))
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());
        let user_id = present(&run.user_id).unwrap_or_else(|| DEFAULT_USER.to_string());
        check_component("session key", &key)?;
        check_component("user_id", &user_id)?;
        let workspace = match present(&run.workspace_name) {
            Some(name) => {
                check_component("workspace_name", &name)?;
                base.join(name)
            }
            None => base.join(format!("{}_{}", user_id, key)),
        };

        Ok(Self {
            user_id,
            key,
            workspace,
        })
    }
}

fn check_component(field: &'static str, value: &str) -> Result<(), SessionError> {
    let mut components = Path::new(value).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if single && !value.contains(['/', '\\', '\0']) {
        Ok(())
    } else {
        Err(SessionError::InvalidKey {
            field,
            value: value.to_string(),
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.user_id, self.key)
    }
}

/// Observer for session lifecycle events
///
/// All methods default to no-ops.
pub trait SessionHook: Send + Sync {
    fn on_create(&self, _key: &SessionKey) {}
    fn on_touch(&self, _key: &SessionKey) {}
    /// Called whenever the registry drops a session (capacity, TTL or shutdown)
    fn on_expire(&self, _key: &SessionKey) {}
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Parent directory of every workspace
    pub base_dir: PathBuf,
    pub worker: WorkerSettings,
    /// Evict the least recently used idle session beyond this many
    pub max_sessions: Option<usize>,
    /// Sessions untouched for this long are dropped by `expire_idle`
    pub idle_ttl: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("agent_workspace"),
            worker: WorkerSettings::default(),
            max_sessions: None,
            idle_ttl: None,
        }
    }
}

struct Entry {
    key: SessionKey,
    handle: SessionHandle,
    last_touched: Instant,
}

pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: Mutex<HashMap<PathBuf, Entry>>,
    hooks: Vec<Arc<dyn SessionHook>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SessionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Key for `run` with the workspace resolved to an absolute path
    pub fn key_for(&self, run: &RunConfig) -> Result<SessionKey, SessionError> {
        let base = absolutize(&self.config.base_dir)?;
        SessionKey::derive(run, &base)
    }

    /// Look up or create the session for `run`
    ///
    /// A document supplied for an existing session replaces its
    /// `DOCUMENT_PATH`.
    pub async fn resolve(
        &self,
        run: &RunConfig,
        document: Option<&Path>,
    ) -> Result<(SessionKey, SessionHandle), SessionError> {
        let key = self.key_for(run)?;
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get_mut(&key.workspace) {
            entry.last_touched = Instant::now();
            let handle = entry.handle.clone();
            drop(sessions);

            if let Some(document) = document {
                handle.lock().await.set_document(document)?;
            }
            for hook in &self.hooks {
                hook.on_touch(&key);
            }
            return Ok((key, handle));
        }

        let session = ScriptSession::create(&key.workspace, document, self.config.worker.clone())?;

        let mut evicted = Vec::new();
        if let Some(max) = self.config.max_sessions {
            while sessions.len() >= max.max(1) {
                match least_recent_idle(&sessions) {
                    Some(path) => {
                        if let Some(entry) = sessions.remove(&path) {
                            evicted.push(entry);
                        }
                    }
                    None => {
                        warn!(
                            live = sessions.len(),
                            max, "Every session is busy, exceeding max_sessions"
                        );
                        break;
                    }
                }
            }
        }

        let handle = Arc::new(Mutex::new(session));
        sessions.insert(
            key.workspace.clone(),
            Entry {
                key: key.clone(),
                handle: handle.clone(),
                last_touched: Instant::now(),
            },
        );
        LIVE_SESSIONS.set(sessions.len() as i64);
        drop(sessions);

        info!(session = %key, workspace = %key.workspace.display(), "Session created");
        self.retire(evicted).await;
        for hook in &self.hooks {
            hook.on_create(&key);
        }
        Ok((key, handle))
    }

    /// Drop sessions that have been idle longer than `idle_ttl`
    ///
    /// Returns how many were removed. Sessions currently locked by a caller
    /// are skipped.
    pub async fn expire_idle(&self) -> usize {
        let Some(ttl) = self.config.idle_ttl else {
            return 0;
        };

        let expired: Vec<Entry> = {
            let mut sessions = self.sessions.lock().await;
            let stale: Vec<PathBuf> = sessions
                .iter()
                .filter(|(_, entry)| {
                    entry.last_touched.elapsed() >= ttl && entry.handle.try_lock().is_ok()
                })
                .map(|(path, _)| path.clone())
                .collect();
            let expired = stale
                .iter()
                .filter_map(|path| sessions.remove(path))
                .collect();
            LIVE_SESSIONS.set(sessions.len() as i64);
            expired
        };

        let count = expired.len();
        if count > 0 {
            debug!(count, "Expiring idle sessions");
        }
        self.retire(expired).await;
        count
    }

    /// Remove and clean up the session for `run`, if there is one
    pub async fn remove(&self, run: &RunConfig) -> Result<bool, SessionError> {
        let key = self.key_for(run)?;
        let entry = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions.remove(&key.workspace);
            LIVE_SESSIONS.set(sessions.len() as i64);
            entry
        };
        match entry {
            Some(entry) => {
                self.retire(vec![entry]).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clean up every session
    pub async fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut sessions = self.sessions.lock().await;
            let entries = sessions.drain().map(|(_, entry)| entry).collect();
            LIVE_SESSIONS.set(0);
            entries
        };
        if !entries.is_empty() {
            info!(count = entries.len(), "Shutting down sessions");
        }
        self.retire(entries).await;
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Keys of all live sessions, ordered by workspace path
    pub async fn keys(&self) -> Vec<SessionKey> {
        let sessions = self.sessions.lock().await;
        let mut keys: Vec<SessionKey> = sessions.values().map(|e| e.key.clone()).collect();
        keys.sort_by(|a, b| a.workspace.cmp(&b.workspace));
        keys
    }

    async fn retire(&self, entries: Vec<Entry>) {
        for entry in entries {
            entry.handle.lock().await.cleanup().await;
            debug!(session = %entry.key, "Session retired");
            for hook in &self.hooks {
                hook.on_expire(&entry.key);
            }
        }
    }
}

fn least_recent_idle(sessions: &HashMap<PathBuf, Entry>) -> Option<PathBuf> {
    sessions
        .iter()
        .filter(|(_, entry)| entry.handle.try_lock().is_ok())
        .min_by_key(|(_, entry)| entry.last_touched)
        .map(|(path, _)| path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::bindings::BindingValue;
    use crate::session::workspace::DOCUMENT_PATH;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run(thread: &str, user: &str) -> RunConfig {
        RunConfig {
            thread_id: Some(thread.to_string()),
            user_id: Some(user.to_string()),
            ..Default::default()
        }
    }

    fn registry(base: &Path) -> SessionRegistry {
        SessionRegistry::new(RegistryConfig {
            base_dir: base.to_path_buf(),
            ..Default::default()
        })
    }

    #[derive(Default)]
    struct CountingHook {
        created: AtomicUsize,
        touched: AtomicUsize,
        expired: AtomicUsize,
    }

    impl SessionHook for CountingHook {
        fn on_create(&self, _key: &SessionKey) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        fn on_touch(&self, _key: &SessionKey) {
            self.touched.fetch_add(1, Ordering::SeqCst);
        }
        fn on_expire(&self, _key: &SessionKey) {
            self.expired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_key_from_thread_and_user() {
        let key = SessionKey::derive(&run("t1", "u1"), Path::new("/base")).unwrap();
        assert_eq!(key.key, "t1");
        assert_eq!(key.workspace, PathBuf::from("/base/u1_t1"));
        assert_eq!(key.to_string(), "u1_t1");
    }

    #[test]
    fn test_key_prefers_session_id() {
        let config = RunConfig {
            session_id: Some("s9".into()),
            thread_id: Some("t1".into()),
            ..Default::default()
        };
        let key = SessionKey::derive(&config, Path::new("/base")).unwrap();
        assert_eq!(key.workspace, PathBuf::from("/base/anonymous_s9"));
    }

    #[test]
    fn test_key_defaults_and_override() {
        let key = SessionKey::derive(&RunConfig::default(), Path::new("/base")).unwrap();
        assert_eq!(key.workspace, PathBuf::from("/base/anonymous_default"));

        let blank = RunConfig {
            session_id: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(SessionKey::derive(&blank, Path::new("/base")).unwrap().key, "default");

        let named = RunConfig {
            workspace_name: Some("w".into()),
            ..run("t1", "u1")
        };
        assert_eq!(
            SessionKey::derive(&named, Path::new("/base")).unwrap().workspace,
            PathBuf::from("/base/w")
        );
    }

    #[test]
    fn test_key_rejects_paths_outside_base() {
        let escapes = [
            RunConfig {
                user_id: Some("/tmp/evil".into()),
                ..run("t1", "u1")
            },
            RunConfig {
                workspace_name: Some("/etc".into()),
                ..Default::default()
            },
            RunConfig {
                workspace_name: Some("..".into()),
                ..Default::default()
            },
            RunConfig {
                thread_id: Some("../../x".into()),
                ..Default::default()
            },
            RunConfig {
                session_id: Some("a\\b".into()),
                ..Default::default()
            },
        ];
        for config in &escapes {
            match SessionKey::derive(config, Path::new("/base")) {
                Err(SessionError::InvalidKey { .. }) => {}
                other => panic!("{:?} was accepted: {:?}", config, other),
            }
        }

        let dotted = RunConfig {
            user_id: Some("jane.doe".into()),
            ..run("t1", "u1")
        };
        assert_eq!(
            SessionKey::derive(&dotted, Path::new("/base")).unwrap().workspace,
            PathBuf::from("/base/jane.doe_t1")
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_escaping_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        let config = RunConfig {
            workspace_name: Some("../outside".into()),
            ..Default::default()
        };

        let Err(err) = registry.resolve(&config, None).await else {
            panic!("escaping workspace was accepted");
        };
        assert!(matches!(err, SessionError::InvalidKey { field: "workspace_name", .. }));
        assert!(!err.is_retryable());
        assert!(registry.is_empty().await);
        assert!(!tmp.path().parent().unwrap().join("outside").exists());
    }

    #[tokio::test]
    async fn test_resolve_reuses_session() {
        let tmp = tempfile::tempdir().unwrap();
        let hook = Arc::new(CountingHook::default());
        let registry = registry(tmp.path()).with_hook(hook.clone());

        let (key, first) = registry.resolve(&run("t1", "u1"), None).await.unwrap();
        let (_, second) = registry.resolve(&run("t1", "u1"), None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(key.workspace.join("visualizations").is_dir());
        assert_eq!(registry.len().await, 1);
        assert_eq!(hook.created.load(Ordering::SeqCst), 1);
        assert_eq!(hook.touched.load(Ordering::SeqCst), 1);

        registry.shutdown().await;
        assert!(first.lock().await.is_closed());
        assert_eq!(hook.expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_document_updated_on_existing_session() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());

        let (_, handle) = registry.resolve(&run("t1", "u1"), None).await.unwrap();
        assert!(!handle.lock().await.bindings().contains(DOCUMENT_PATH));

        registry
            .resolve(&run("t1", "u1"), Some(Path::new("/docs/brief.md")))
            .await
            .unwrap();
        assert_eq!(
            handle.lock().await.bindings().get(DOCUMENT_PATH),
            Some(&BindingValue::json("/docs/brief.md"))
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(RegistryConfig {
            base_dir: tmp.path().to_path_buf(),
            max_sessions: Some(1),
            ..Default::default()
        });

        let (_, first) = registry.resolve(&run("a", "u"), None).await.unwrap();
        let (_, second) = registry.resolve(&run("b", "u"), None).await.unwrap();

        assert!(first.lock().await.is_closed());
        assert!(!second.lock().await.is_closed());
        assert_eq!(registry.keys().await.len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_expire_idle_respects_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let unbounded = registry(tmp.path());
        unbounded.resolve(&run("a", "u"), None).await.unwrap();
        assert_eq!(unbounded.expire_idle().await, 0);
        unbounded.shutdown().await;

        let bounded = SessionRegistry::new(RegistryConfig {
            base_dir: tmp.path().to_path_buf(),
            idle_ttl: Some(Duration::ZERO),
            ..Default::default()
        });
        let (_, handle) = bounded.resolve(&run("a", "u"), None).await.unwrap();
        assert_eq!(bounded.expire_idle().await, 1);
        assert!(bounded.is_empty().await);
        assert!(handle.lock().await.is_closed());
    }

    #[tokio::test]
    async fn test_remove_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        let (_, handle) = registry.resolve(&run("a", "u"), None).await.unwrap();

        assert!(registry.remove(&run("a", "u")).await.unwrap());
        assert!(!registry.remove(&run("a", "u")).await.unwrap());
        assert!(handle.lock().await.is_closed());
    }
}
