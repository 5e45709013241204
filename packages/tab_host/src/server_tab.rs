//! One browser tab's live connection
//!
//! A [`ServerTab`] owns an [`EventQueue`], a maintenance timer entry and the
//! scheduler for its app-side handle. Each tab has its own strand; every
//! operation that touches the queue is submitted there, so requests arriving
//! concurrently from any connection are applied one at a time.
//!
//! Two clocks run per tab, both measured from the last read:
//! - with a poll attached, the poll is answered (possibly with `[]`) once it
//!   has waited `max_poll_duration`
//! - with no poll attached, the tab expires after `max_age_without_listener`

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use strand_kit::{Deadline, Strand, StrandError, StrandTask, TimerCallback, TimerThread};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::app::{AppRecord, AppTabScheduler, CookieAttributes, TabProxy, format_cookie};
use crate::event_queue::{AddRequestOutcome, EventQueue, PollId, PollRequest};
use crate::metrics::HostMetrics;
use crate::session::{SessionRecord, WeakSession};
use crate::tab_status::{TabStatus, TabStatusListener};
use crate::users::{User, UserDirectory};

/// How long polls and idle tabs may live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub max_age_without_listener: Duration,
    pub max_poll_duration: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            max_age_without_listener: Duration::from_secs(10),
            max_poll_duration: Duration::from_secs(10),
        }
    }
}

/// Services shared by every session and tab of one host
pub(crate) struct TabContext {
    /// Owns the app/session registry and all session state
    pub(crate) registry: Strand,
    pub(crate) timer: TimerThread,
    pub(crate) policy: TimeoutPolicy,
    pub(crate) queue_budget: usize,
    pub(crate) status: Arc<dyn TabStatusListener>,
    pub(crate) users: UserDirectory,
    pub(crate) metrics: Arc<HostMetrics>,
}

#[derive(Clone)]
pub struct ServerTab {
    inner: Arc<TabInner>,
}

/// Non-owning tab reference held by [`TabProxy`]
#[derive(Clone)]
pub(crate) struct WeakServerTab(Weak<TabInner>);

impl WeakServerTab {
    pub(crate) fn upgrade(&self) -> Option<ServerTab> {
        self.0.upgrade().map(|inner| ServerTab { inner })
    }

    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(Weak::new())
    }
}

struct TabInner {
    session_key: String,
    tab_id: String,
    app_name: String,
    strand: Strand,
    ctx: Arc<TabContext>,
    session: WeakSession,
    app_tab: AppTabScheduler,
    timer: TimerCallback,
    state: Mutex<TabState>,
}

struct TabState {
    queue: EventQueue,
    last_read: Instant,
    last_read_at: DateTime<Utc>,
    user_id: String,
    closed: bool,
}

impl TabState {
    fn mark_read(&mut self) {
        self.last_read = Instant::now();
        self.last_read_at = Utc::now();
    }
}

impl std::fmt::Debug for ServerTab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTab")
            .field("session_key", &self.inner.session_key)
            .field("tab_id", &self.inner.tab_id)
            .field("app", &self.inner.app_name)
            .finish()
    }
}

impl ServerTab {
    /// Build a tab bound to `app` and start its maintenance clock.
    /// Runs on the registry strand as part of session tab creation.
    pub(crate) fn open(
        session: &SessionRecord,
        tab_id: &str,
        app: &AppRecord,
        user_id: &str,
        user: Option<User>,
    ) -> Self {
        let ctx = session.context().clone();
        let inner = Arc::new_cyclic(|weak: &Weak<TabInner>| {
            let weak = weak.clone();
            let timer = ctx.timer.register_callback(move || {
                if let Some(inner) = weak.upgrade() {
                    ServerTab { inner }.schedule_maintenance();
                }
            });
            TabInner {
                session_key: session.key().to_string(),
                tab_id: tab_id.to_string(),
                app_name: app.name().to_string(),
                strand: Strand::new(format!("tab:{}/{}", session.key(), tab_id)),
                ctx: ctx.clone(),
                session: session.downgrade(),
                app_tab: AppTabScheduler::new(app),
                timer,
                state: Mutex::new(TabState {
                    queue: EventQueue::new(ctx.queue_budget),
                    last_read: Instant::now(),
                    last_read_at: Utc::now(),
                    user_id: user_id.to_string(),
                    closed: false,
                }),
            }
        });

        let tab = ServerTab { inner };
        {
            let state = tab.inner.lock();
            tab.inner.reschedule_maintenance(&state);
        }
        let proxy = TabProxy::new(tab.downgrade(), &tab.inner.session_key, &tab.inner.tab_id);
        tab.inner.app_tab.create(proxy, user);
        tab
    }

    pub fn session_key(&self) -> &str {
        &self.inner.session_key
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub(crate) fn downgrade(&self) -> WeakServerTab {
        WeakServerTab(Arc::downgrade(&self.inner))
    }

    /// Queue an event for the browser
    pub fn send(&self, kind: &str, value: Value) -> StrandTask<()> {
        let kind = kind.to_string();
        self.on_strand(move |tab, state| {
            if state.closed {
                debug!(tab = %tab.tab_id, kind = %kind, "send to closed tab ignored");
                return;
            }
            state.queue.append(&kind, value);
            tab.ctx.metrics.event_sent();
            if state.queue.queue_size() == 0 {
                state.mark_read();
            }
            tab.reschedule_maintenance(state);
            tab.publish_status(state);
        })
    }

    /// Attach a long-poll request. Dropping the returned guard (the client
    /// went away) cancels the request.
    pub fn serve(&self, request: PollRequest) -> PollGuard {
        let id = request.id();
        drop(self.on_strand(move |tab, state| {
            if state.closed {
                debug!(tab = %tab.tab_id, "poll on closed tab dropped");
                return;
            }
            match state.queue.add_request(request) {
                AddRequestOutcome::Clash => tab.ctx.metrics.poll_clash(),
                _ => {
                    state.mark_read();
                    tab.reschedule_maintenance(state);
                }
            }
            tab.publish_status(state);
        }));
        PollGuard {
            tab: Some(self.clone()),
            id,
        }
    }

    pub fn cancel_request(&self, id: PollId) -> StrandTask<()> {
        self.on_strand(move |tab, state| {
            if state.queue.cancel_request(id) {
                debug!(tab = %tab.tab_id, "long poll cancelled");
                tab.reschedule_maintenance(state);
                tab.publish_status(state);
            }
        })
    }

    /// Switch the owning session to another user; every tab in the session
    /// hears about it.
    pub fn switch_user(&self, user_id: &str) -> StrandTask<()> {
        let user_id = user_id.to_string();
        self.on_strand(move |tab, _| {
            if let Some(session) = tab.session.upgrade() {
                drop(session.switch_user(&user_id));
            }
        })
    }

    /// Deliver a cookie to the browser as a `set-cookie` event
    pub fn set_cookie(
        &self,
        name: &str,
        value: &str,
        attributes: &CookieAttributes,
    ) -> StrandTask<()> {
        self.send(
            "set-cookie",
            Value::String(format_cookie(name, value, attributes)),
        )
    }

    pub fn reload_page(&self) -> StrandTask<()> {
        self.send("refresh-browser", Value::Null)
    }

    /// Hand a client message to the app
    pub fn receive(&self, value: Value) {
        self.inner.app_tab.receive(value);
    }

    /// Close the tab the same way expiry does. Returns whether the tab was
    /// still registered.
    pub async fn close(&self) -> Result<bool, StrandError> {
        match self.inner.session.upgrade() {
            Some(session) => session.notify_tab_expired(&self.inner.tab_id).await,
            None => {
                self.tab_closed().await?;
                Ok(false)
            }
        }
    }

    pub fn queue_size(&self) -> StrandTask<usize> {
        self.on_strand(|_, state| state.queue.queue_size())
    }

    pub fn has_listener(&self) -> StrandTask<bool> {
        self.on_strand(|_, state| state.queue.has_listener())
    }

    pub fn is_closed(&self) -> StrandTask<bool> {
        self.on_strand(|_, state| state.closed)
    }

    pub(crate) fn change_user(&self, user_id: String, user: Option<User>) -> StrandTask<()> {
        self.on_strand(move |tab, state| {
            if state.closed {
                return;
            }
            state.user_id = user_id;
            tab.app_tab.change_user(user);
            tab.publish_status(state);
        })
    }

    /// Final teardown, run once the session has dropped the tab
    pub(crate) fn tab_closed(&self) -> StrandTask<()> {
        self.on_strand(|tab, state| {
            if state.closed {
                return;
            }
            state.closed = true;
            drop(state.queue.take_listener());
            tab.app_tab.tab_closed();
            drop(tab.timer.dispose());
            tab.ctx.status.tab_closed(&tab.session_key, &tab.tab_id);
            tab.ctx.metrics.tab_closed();
            info!(
                session = %tab.session_key,
                tab = %tab.tab_id,
                app = %tab.app_name,
                "tab closed"
            );
        })
    }

    fn schedule_maintenance(&self) {
        drop(self.on_strand(|tab, state| tab.do_maintenance(state)));
    }

    fn on_strand<T, F>(&self, action: F) -> StrandTask<T>
    where
        F: FnOnce(&TabInner, &mut TabState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.strand.schedule_exclusive(move || {
            let mut state = inner.lock();
            action(&inner, &mut state)
        })
    }
}

impl TabInner {
    fn lock(&self) -> MutexGuard<'_, TabState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn maintenance_deadline(&self, state: &TabState) -> Deadline {
        let wait = if state.queue.has_listener() {
            self.ctx.policy.max_poll_duration
        } else {
            self.ctx.policy.max_age_without_listener
        };
        Deadline::offset(state.last_read, wait)
    }

    fn reschedule_maintenance(&self, state: &TabState) {
        if !state.closed {
            drop(self.timer.reschedule(self.maintenance_deadline(state)));
        }
    }

    fn do_maintenance(&self, state: &mut TabState) {
        if state.closed {
            return;
        }
        let now = Instant::now();
        if state.queue.has_listener() {
            if Deadline::offset(state.last_read, self.ctx.policy.max_poll_duration).is_due(now) {
                debug!(tab = %self.tab_id, "long poll hit its maximum duration");
                state.queue.complete_now();
                state.mark_read();
                self.publish_status(state);
            }
        } else if Deadline::offset(state.last_read, self.ctx.policy.max_age_without_listener)
            .is_due(now)
        {
            info!(session = %self.session_key, tab = %self.tab_id, "tab expired without a listener");
            state.mark_read();
            if let Some(session) = self.session.upgrade() {
                drop(session.notify_tab_expired(&self.tab_id));
            }
        }
        self.reschedule_maintenance(state);
    }

    fn publish_status(&self, state: &TabState) {
        self.ctx.status.update_tab_status(TabStatus {
            session_key: self.session_key.clone(),
            tab_id: self.tab_id.clone(),
            user_id: state.user_id.clone(),
            queue_length: state.queue.queue_size(),
            last_read: state.last_read_at,
            has_listener: state.queue.has_listener(),
        });
    }
}

/// Keeps an attached poll registered; dropping it cancels the poll
pub struct PollGuard {
    tab: Option<ServerTab>,
    id: PollId,
}

impl PollGuard {
    pub fn id(&self) -> PollId {
        self.id
    }

    /// The poll was answered; skip the cancellation on drop
    pub fn disarm(mut self) {
        self.tab = None;
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        if let Some(tab) = self.tab.take() {
            drop(tab.cancel_request(self.id));
        }
    }
}
