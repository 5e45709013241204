//! Registry of apps and sessions
//!
//! [`AppsState`] is the host's single entry point: handlers resolve
//! sessions, create tabs and look them up here. Every registry read or
//! write runs on the registry strand, which also owns all session state.

use data_encoding::BASE64URL_NOPAD;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use strand_kit::{Strand, StrandTask, TimerThread};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app::{App, AppRecord};
use crate::error::HostError;
use crate::event_queue::DEFAULT_QUEUE_BUDGET;
use crate::metrics::HostMetrics;
use crate::server_tab::{ServerTab, TabContext, TimeoutPolicy};
use crate::session::SessionRecord;
use crate::tab_status::{TabStatus, TabStatusListener, TabStatusQueue};
use crate::users::{UserChange, UserDirectory};

/// Bytes of randomness in a session key; encodes to 16 characters
const SESSION_KEY_BYTES: usize = 12;
const SESSION_KEY_LEN: usize = 16;

pub struct AppsStateOptions {
    pub policy: TimeoutPolicy,
    pub queue_budget: usize,
    pub users: UserDirectory,
    pub metrics: Arc<HostMetrics>,
    /// Receives tab lifecycle notifications, in order, off the tab strands
    pub status_listener: Option<Arc<dyn TabStatusListener>>,
    /// Source of session keys
    pub rng: Box<dyn RngCore + Send>,
}

impl Default for AppsStateOptions {
    fn default() -> Self {
        Self {
            policy: TimeoutPolicy::default(),
            queue_budget: DEFAULT_QUEUE_BUDGET,
            users: UserDirectory::new(),
            metrics: Arc::new(HostMetrics::new()),
            status_listener: None,
            rng: Box::new(StdRng::from_os_rng()),
        }
    }
}

#[derive(Clone)]
pub struct AppsState {
    inner: Arc<AppsInner>,
}

struct AppsInner {
    ctx: Arc<TabContext>,
    registry: Mutex<Registry>,
}

struct Registry {
    apps: HashMap<String, AppRecord>,
    sessions: HashMap<String, SessionRecord>,
    rng: Box<dyn RngCore + Send>,
}

impl Registry {
    fn mint_key(&mut self) -> String {
        let mut bytes = [0u8; SESSION_KEY_BYTES];
        self.rng.fill_bytes(&mut bytes);
        BASE64URL_NOPAD.encode(&bytes)
    }
}

struct NoStatus;

impl TabStatusListener for NoStatus {
    fn new_tab(&self, _: &str, _: &str, _: &str, _: &str) {}
    fn tab_closed(&self, _: &str, _: &str) {}
    fn update_tab_status(&self, _: TabStatus) {}
}

/// App names are non-empty runs of ASCII letters, digits, `-`, `.` and `_`
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

/// Whether a cookie value is shaped like a key this host mints
pub fn is_valid_session_key(key: &str) -> bool {
    key.len() == SESSION_KEY_LEN && BASE64URL_NOPAD.decode(key.as_bytes()).is_ok()
}

impl AppsState {
    /// Must be called inside a tokio runtime: the registry strand, the
    /// timer driver and the user-change watcher are spawned here.
    pub fn new(options: AppsStateOptions) -> Self {
        let status: Arc<dyn TabStatusListener> = match options.status_listener {
            Some(listener) => Arc::new(TabStatusQueue::new(listener)),
            None => Arc::new(NoStatus),
        };
        let ctx = Arc::new(TabContext {
            registry: Strand::new("registry"),
            timer: TimerThread::new(),
            policy: options.policy,
            queue_budget: options.queue_budget,
            status,
            users: options.users,
            metrics: options.metrics,
        });
        let inner = Arc::new(AppsInner {
            ctx,
            registry: Mutex::new(Registry {
                apps: HashMap::new(),
                sessions: HashMap::new(),
                rng: options.rng,
            }),
        });
        tokio::spawn(watch_users(
            Arc::downgrade(&inner),
            inner.ctx.users.subscribe(),
        ));
        Self { inner }
    }

    pub fn users(&self) -> &UserDirectory {
        &self.inner.ctx.users
    }

    pub fn metrics(&self) -> &Arc<HostMetrics> {
        &self.inner.ctx.metrics
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.inner.ctx.policy
    }

    fn on_registry<T, F>(&self, action: F) -> StrandTask<T>
    where
        F: FnOnce(&mut Registry, &Arc<TabContext>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.ctx.registry.schedule_exclusive(move || {
            let mut registry = inner.lock();
            action(&mut registry, &inner.ctx)
        })
    }

    pub async fn add_app(&self, name: &str, app: Arc<dyn App>) -> Result<AppRecord, HostError> {
        if !is_valid_app_name(name) {
            return Err(HostError::InvalidAppName(name.to_string()));
        }
        let name = name.to_string();
        self.on_registry(move |registry, _| {
            if registry.apps.contains_key(&name) {
                return Err(HostError::DuplicateApp(name));
            }
            let record = AppRecord::new(&name, app);
            registry.apps.insert(name.clone(), record.clone());
            info!(app = %name, "app registered");
            Ok(record)
        })
        .await?
    }

    /// Resolve a session cookie, minting a fresh session when the cookie is
    /// missing, malformed or unknown
    pub async fn find_or_create_session(
        &self,
        cookie: Option<&str>,
    ) -> Result<SessionRecord, HostError> {
        let cookie = cookie
            .filter(|key| is_valid_session_key(key))
            .map(str::to_string);
        let session = self
            .on_registry(move |registry, ctx| {
                if let Some(session) = cookie.and_then(|key| registry.sessions.get(&key).cloned()) {
                    return session;
                }
                let key = registry.mint_key();
                if registry.sessions.contains_key(&key) {
                    panic!("session key collision on {key}; the random source is broken");
                }
                let session = SessionRecord::new(key.clone(), ctx.clone());
                registry.sessions.insert(key.clone(), session.clone());
                ctx.metrics.session_created();
                debug!(session = %key, "session created");
                session
            })
            .await?;
        Ok(session)
    }

    pub async fn get_session(&self, key: &str) -> Result<Option<SessionRecord>, HostError> {
        let key = key.to_string();
        Ok(self
            .on_registry(move |registry, _| registry.sessions.get(&key).cloned())
            .await?)
    }

    pub async fn get_app(&self, name: &str) -> Result<Option<AppRecord>, HostError> {
        let name = name.to_string();
        Ok(self
            .on_registry(move |registry, _| registry.apps.get(&name).cloned())
            .await?)
    }

    pub async fn get_tab(
        &self,
        session_key: &str,
        tab_id: &str,
    ) -> Result<Option<ServerTab>, HostError> {
        let (session_key, tab_id) = (session_key.to_string(), tab_id.to_string());
        Ok(self
            .on_registry(move |registry, _| {
                registry
                    .sessions
                    .get(&session_key)
                    .and_then(|session| session.get_tab_now(&tab_id))
            })
            .await?)
    }

    /// Open a tab of `app_name` in an existing session. The session first
    /// switches to `user_id` (empty for anonymous).
    pub async fn create_tab(
        &self,
        session_key: &str,
        app_name: &str,
        user_id: &str,
    ) -> Result<ServerTab, HostError> {
        let (session_key, app_name, user_id) = (
            session_key.to_string(),
            app_name.to_string(),
            user_id.to_string(),
        );
        self.on_registry(move |registry, _| {
            let app = registry
                .apps
                .get(&app_name)
                .cloned()
                .ok_or(HostError::UnknownApp(app_name))?;
            let session = registry
                .sessions
                .get(&session_key)
                .cloned()
                .ok_or(HostError::UnknownSession)?;
            Ok(session.create_tab_now(&app, &user_id))
        })
        .await?
    }

    /// Remove a tab on the client's request; runs the same path as expiry
    pub async fn close_tab(&self, session_key: &str, tab_id: &str) -> Result<(), HostError> {
        let (session_key, tab_id) = (session_key.to_string(), tab_id.to_string());
        self.on_registry(move |registry, _| {
            let session = registry
                .sessions
                .get(&session_key)
                .ok_or(HostError::UnknownSession)?;
            if session.remove_tab_now(&tab_id) {
                Ok(())
            } else {
                Err(HostError::UnknownTab(tab_id))
            }
        })
        .await?
    }

    pub async fn session_count(&self) -> Result<usize, HostError> {
        Ok(self
            .on_registry(|registry, _| registry.sessions.len())
            .await?)
    }

    /// Registered app names, sorted
    pub async fn app_names(&self) -> Result<Vec<String>, HostError> {
        Ok(self
            .on_registry(|registry, _| {
                let mut names: Vec<String> = registry.apps.keys().cloned().collect();
                names.sort();
                names
            })
            .await?)
    }

    fn refresh_users(&self, changed: Option<String>) -> StrandTask<()> {
        self.on_registry(move |registry, _| {
            for session in registry.sessions.values() {
                session.refresh_user_now(changed.as_deref());
            }
        })
    }
}

impl AppsInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Push user record changes to the sessions signed in as that user
async fn watch_users(state: Weak<AppsInner>, mut changes: broadcast::Receiver<UserChange>) {
    loop {
        let changed = match changes.recv().await {
            Ok(change) => Some(change.user_id),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "user change stream lagged, refreshing every session");
                None
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = state.upgrade() else {
            break;
        };
        drop(AppsState { inner }.refresh_users(changed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RecordingApp, settle, test_options, test_state};

    #[test]
    fn test_app_name_rules() {
        for good in ["echo", "chat-room", "v1.2_beta", "A"] {
            assert!(is_valid_app_name(good), "{good}");
        }
        for bad in ["", "has space", "slash/name", "ünïcode", "semi;colon"] {
            assert!(!is_valid_app_name(bad), "{bad}");
        }
    }

    #[test]
    fn test_session_key_shape() {
        assert!(is_valid_session_key("AAAAAAAAAAAAAAAA"));
        assert!(is_valid_session_key("abc-_0123456789Z"));
        assert!(!is_valid_session_key("short"));
        assert!(!is_valid_session_key("AAAAAAAAAAAAAAA="));
        assert!(!is_valid_session_key("AAAAAAAAAAAAAAA+"));
    }

    #[tokio::test]
    async fn test_add_app_rejects_bad_and_duplicate_names() {
        let state = test_state(test_options());
        state.add_app("echo", RecordingApp::new()).await.unwrap();

        assert!(matches!(
            state.add_app("echo", RecordingApp::new()).await,
            Err(HostError::DuplicateApp(name)) if name == "echo"
        ));
        assert!(matches!(
            state.add_app("bad name", RecordingApp::new()).await,
            Err(HostError::InvalidAppName(_))
        ));
        assert_eq!(state.app_names().await.unwrap(), vec!["echo"]);
        assert!(state.get_app("echo").await.unwrap().is_some());
        assert!(state.get_app("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_or_create_session_reuses_known_keys() {
        let state = test_state(test_options());

        let session = state.find_or_create_session(None).await.unwrap();
        assert!(is_valid_session_key(session.key()));

        let again = state
            .find_or_create_session(Some(session.key()))
            .await
            .unwrap();
        assert!(again.ptr_eq(&session));

        let fresh = state.find_or_create_session(Some("garbage")).await.unwrap();
        assert!(!fresh.ptr_eq(&session));

        let unknown = state
            .find_or_create_session(Some("AAAAAAAAAAAAAAAA"))
            .await
            .unwrap();
        assert_ne!(unknown.key(), "AAAAAAAAAAAAAAAA");

        assert_eq!(state.session_count().await.unwrap(), 3);
        assert_eq!(state.metrics().snapshot().sessions.created, 3);
    }

    #[tokio::test]
    async fn test_seeded_rng_mints_predictable_keys() {
        let first = test_state(test_options());
        let second = test_state(test_options());
        let a = first.find_or_create_session(None).await.unwrap();
        let b = second.find_or_create_session(None).await.unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_tab_errors() {
        let state = test_state(test_options());
        state.add_app("recording", RecordingApp::new()).await.unwrap();
        let session = state.find_or_create_session(None).await.unwrap();

        assert!(matches!(
            state.create_tab(session.key(), "missing", "").await,
            Err(HostError::UnknownApp(_))
        ));
        assert!(matches!(
            state.create_tab("nosuchsession000", "recording", "").await,
            Err(HostError::UnknownSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_tab_runs_close_path_once() {
        let state = test_state(test_options());
        let app = RecordingApp::new();
        state.add_app("recording", app.clone()).await.unwrap();
        let session = state.find_or_create_session(None).await.unwrap();
        let tab = state
            .create_tab(session.key(), "recording", "")
            .await
            .unwrap();

        state.close_tab(session.key(), tab.tab_id()).await.unwrap();
        assert!(matches!(
            state.close_tab(session.key(), tab.tab_id()).await,
            Err(HostError::UnknownTab(_))
        ));
        assert!(state
            .get_tab(session.key(), tab.tab_id())
            .await
            .unwrap()
            .is_none());

        settle().await;
        assert_eq!(app.closed_count("1"), 1);
        let snapshot = state.metrics().snapshot();
        assert_eq!(snapshot.tabs.created, 1);
        assert_eq!(snapshot.tabs.closed, 1);
        assert_eq!(snapshot.tabs.active, 0);
    }
}
