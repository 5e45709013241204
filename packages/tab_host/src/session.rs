//! Browser sessions and the tabs they own
//!
//! All session state belongs to the registry strand. Methods ending in
//! `_now` assume they already run there; the rest schedule themselves onto
//! it and hand back a [`StrandTask`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use strand_kit::StrandTask;
use tracing::{debug, info};

use crate::app::AppRecord;
use crate::server_tab::{ServerTab, TabContext};

#[derive(Clone)]
pub struct SessionRecord {
    inner: Arc<SessionInner>,
}

/// Non-owning session reference held by tabs
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<SessionRecord> {
        self.0.upgrade().map(|inner| SessionRecord { inner })
    }
}

struct SessionInner {
    key: String,
    ctx: Arc<TabContext>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    user_id: String,
    tabs: HashMap<String, ServerTab>,
    counter: u64,
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("key", &self.inner.key)
            .finish()
    }
}

impl SessionRecord {
    pub(crate) fn new(key: String, ctx: Arc<TabContext>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                key,
                ctx,
                state: Mutex::default(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Whether both handles refer to the same session
    pub fn ptr_eq(&self, other: &SessionRecord) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn context(&self) -> &Arc<TabContext> {
        &self.inner.ctx
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_registry<T, F>(&self, action: F) -> StrandTask<T>
    where
        F: FnOnce(&SessionRecord) -> T + Send + 'static,
        T: Send + 'static,
    {
        let session = self.clone();
        self.inner
            .ctx
            .registry
            .schedule_exclusive(move || action(&session))
    }

    pub fn user_id(&self) -> StrandTask<String> {
        self.on_registry(|session| session.user_id_now())
    }

    pub fn get_tab(&self, tab_id: &str) -> StrandTask<Option<ServerTab>> {
        let tab_id = tab_id.to_string();
        self.on_registry(move |session| session.get_tab_now(&tab_id))
    }

    /// Live tab ids in creation order
    pub fn tab_ids(&self) -> StrandTask<Vec<String>> {
        self.on_registry(|session| session.tab_ids_now())
    }

    pub fn switch_user(&self, user_id: &str) -> StrandTask<()> {
        let user_id = user_id.to_string();
        self.on_registry(move |session| session.switch_user_now(&user_id))
    }

    /// Remove a tab and run its close path. Returns whether it was present.
    pub fn notify_tab_expired(&self, tab_id: &str) -> StrandTask<bool> {
        let tab_id = tab_id.to_string();
        self.on_registry(move |session| session.remove_tab_now(&tab_id))
    }

    pub(crate) fn user_id_now(&self) -> String {
        self.lock().user_id.clone()
    }

    pub(crate) fn get_tab_now(&self, tab_id: &str) -> Option<ServerTab> {
        self.lock().tabs.get(tab_id).cloned()
    }

    pub(crate) fn tab_ids_now(&self) -> Vec<String> {
        let mut ids: Vec<(u64, String)> = self
            .lock()
            .tabs
            .keys()
            .map(|id| (id.parse().unwrap_or(u64::MAX), id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Open a tab for `app`, first switching the session to `user_id`
    pub(crate) fn create_tab_now(&self, app: &AppRecord, user_id: &str) -> ServerTab {
        self.switch_user_now(user_id);

        let (tab_id, current) = {
            let mut state = self.lock();
            state.counter += 1;
            (state.counter.to_string(), state.user_id.clone())
        };
        let (_, user) = self.inner.ctx.users.resolve(&current);

        self.inner
            .ctx
            .status
            .new_tab(&self.inner.key, &tab_id, &current, app.name());
        let tab = ServerTab::open(self, &tab_id, app, &current, user);
        self.lock().tabs.insert(tab_id.clone(), tab.clone());
        self.inner.ctx.metrics.tab_created();
        info!(session = %self.inner.key, tab = %tab_id, app = %app.name(), "tab created");
        tab
    }

    /// Change the session's user; tabs hear about it only if the identity
    /// actually changed
    pub(crate) fn switch_user_now(&self, requested: &str) {
        let (user_id, user) = self.inner.ctx.users.resolve(requested);
        let tabs: Vec<ServerTab> = {
            let mut state = self.lock();
            if state.user_id == user_id {
                return;
            }
            state.user_id = user_id.clone();
            state.tabs.values().cloned().collect()
        };
        info!(session = %self.inner.key, user = %user_id, "session switched user");
        for tab in tabs {
            drop(tab.change_user(user_id.clone(), user.clone()));
        }
    }

    /// Re-read the session's user from the directory after it changed.
    /// `None` refreshes regardless of which user changed.
    pub(crate) fn refresh_user_now(&self, changed: Option<&str>) {
        let current = self.user_id_now();
        if current.is_empty() || changed.is_some_and(|id| id != current) {
            return;
        }
        let (user_id, user) = self.inner.ctx.users.resolve(&current);
        let tabs: Vec<ServerTab> = {
            let mut state = self.lock();
            state.user_id = user_id.clone();
            state.tabs.values().cloned().collect()
        };
        debug!(session = %self.inner.key, user = %current, "refreshing user record");
        for tab in tabs {
            drop(tab.change_user(user_id.clone(), user.clone()));
        }
    }

    pub(crate) fn remove_tab_now(&self, tab_id: &str) -> bool {
        let removed = self.lock().tabs.remove(tab_id);
        match removed {
            Some(tab) => {
                drop(tab.tab_closed());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::{AppEvent, RecordingApp, settle, test_state};
    use crate::users::User;

    #[tokio::test(start_paused = true)]
    async fn test_tab_ids_count_up_per_session() {
        let state = test_state(Default::default());
        let app = RecordingApp::new();
        state.add_app("recording", app.clone()).await.unwrap();

        let first = state.find_or_create_session(None).await.unwrap();
        let second = state.find_or_create_session(None).await.unwrap();
        for _ in 0..3 {
            state.create_tab(first.key(), "recording", "").await.unwrap();
        }
        let other = state.create_tab(second.key(), "recording", "").await.unwrap();

        assert_eq!(first.tab_ids().await.unwrap(), vec!["1", "2", "3"]);
        assert_eq!(other.tab_id(), "1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_user_fans_out_only_on_change() {
        let state = test_state(Default::default());
        state.users().set_user(User::new("ada", "Ada Lovelace"));
        let app = RecordingApp::new();
        state.add_app("recording", app.clone()).await.unwrap();

        let session = state.find_or_create_session(None).await.unwrap();
        state.create_tab(session.key(), "recording", "").await.unwrap();
        state.create_tab(session.key(), "recording", "").await.unwrap();

        session.switch_user("ada").await.unwrap();
        session.switch_user("ada").await.unwrap();
        settle().await;

        let changes: Vec<_> = app
            .events()
            .into_iter()
            .filter(|e| matches!(e, AppEvent::ChangeUser { .. }))
            .collect();
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&AppEvent::ChangeUser {
            tab_id: "1".into(),
            user: Some("ada".into())
        }));
        assert_eq!(session.user_id().await.unwrap(), "ada");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_user_is_anonymous() {
        let state = test_state(Default::default());
        let session = state.find_or_create_session(None).await.unwrap();

        session.switch_user("nobody").await.unwrap();
        assert_eq!(session.user_id().await.unwrap(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_tab_sees_session_user() {
        let state = test_state(Default::default());
        state.users().set_user(User::new("ada", "Ada Lovelace"));
        let app = RecordingApp::new();
        state.add_app("recording", app.clone()).await.unwrap();

        let session = state.find_or_create_session(None).await.unwrap();
        state.create_tab(session.key(), "recording", "ada").await.unwrap();
        settle().await;

        assert_eq!(
            app.events()[0],
            AppEvent::Created {
                tab_id: "1".into(),
                user: Some("ada".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_record_change_reaches_tabs() {
        let state = test_state(Default::default());
        state.users().set_user(User::new("ada", "Ada"));
        let app = RecordingApp::new();
        state.add_app("recording", app.clone()).await.unwrap();

        let session = state.find_or_create_session(None).await.unwrap();
        state.create_tab(session.key(), "recording", "ada").await.unwrap();
        settle().await;

        state.users().set_user(User::new("ada", "Ada Lovelace"));
        settle().await;
        assert!(app.events().contains(&AppEvent::ChangeUser {
            tab_id: "1".into(),
            user: Some("ada".into())
        }));

        state.users().remove_user("ada");
        settle().await;
        assert!(app.events().contains(&AppEvent::ChangeUser {
            tab_id: "1".into(),
            user: None
        }));
        assert_eq!(session.user_id().await.unwrap(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_tab_expired_is_idempotent() {
        let state = test_state(Default::default());
        let app = RecordingApp::new();
        state.add_app("recording", app.clone()).await.unwrap();

        let session = state.find_or_create_session(None).await.unwrap();
        state.create_tab(session.key(), "recording", "").await.unwrap();

        assert!(session.notify_tab_expired("1").await.unwrap());
        assert!(!session.notify_tab_expired("1").await.unwrap());
        settle().await;
        assert_eq!(app.closed_count("1"), 1);
        assert!(session.get_tab("1").await.unwrap().is_none());
    }
}
