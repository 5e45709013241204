//! Applications and the per-tab handles they see
//!
//! An [`App`] is registered once under a name and gets a strand of its own.
//! Every call into app code for any of its tabs goes through that strand
//! via [`AppTabScheduler`], so an app never sees two of its callbacks at
//! once and slow app code never holds up tab bookkeeping.

use axum::body::Bytes;
use axum::http::{Method, StatusCode};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use strand_kit::{Strand, StrandTask};
use tracing::debug;

use crate::server_tab::WeakServerTab;
use crate::users::User;

/// A registered application
pub trait App: Send + Sync + 'static {
    /// Called on the app's strand when a client opens a tab
    fn create_tab(&self, tab: TabProxy, user: Option<User>) -> Box<dyn AppTab>;

    /// Called on the app's strand for `/{app}/...` requests
    fn serve_web_request(&self, request: WebRequest) -> WebResponse {
        debug!(method = %request.method, path = ?request.path, "app serves no web requests");
        WebResponse::not_found()
    }
}

/// An HTTP request addressed to one app, with the app name stripped
#[derive(Debug, Clone)]
pub struct WebRequest {
    pub method: Method,
    /// Path segments after the app name
    pub path: Vec<String>,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
    pub session_key: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl WebResponse {
    pub fn new(status: StatusCode, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            body: body.into(),
        }
    }

    pub fn json(value: &Value) -> Self {
        Self::new(StatusCode::OK, "application/json", value.to_string())
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", "not found")
    }
}

/// App-side state for one tab; always called on the app's strand
pub trait AppTab: Send + 'static {
    fn change_user(&mut self, user: Option<User>);
    fn receive(&mut self, value: Value);
    fn tab_closed(&mut self);
}

/// An app plus the strand its callbacks run on
#[derive(Clone)]
pub struct AppRecord {
    name: Arc<str>,
    app: Arc<dyn App>,
    strand: Strand,
}

impl AppRecord {
    pub fn new(name: &str, app: Arc<dyn App>) -> Self {
        Self {
            name: Arc::from(name),
            app,
            strand: Strand::new(format!("app:{name}")),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    /// Hand a web request to the app on its strand
    pub fn serve_web_request(&self, request: WebRequest) -> StrandTask<WebResponse> {
        let app = self.app.clone();
        self.strand
            .schedule_exclusive(move || app.serve_web_request(request))
    }
}

impl std::fmt::Debug for AppRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRecord").field("name", &self.name).finish()
    }
}

type AppTabSlot = Arc<Mutex<Option<Box<dyn AppTab>>>>;

/// Dispatches one tab's app callbacks onto the app's strand
pub(crate) struct AppTabScheduler {
    record: AppRecord,
    slot: AppTabSlot,
    closed: AtomicBool,
}

impl AppTabScheduler {
    pub(crate) fn new(record: &AppRecord) -> Self {
        Self {
            record: record.clone(),
            slot: Arc::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Ask the app to create its side of the tab. Runs ahead of any other
    /// callback for this tab because it is queued first.
    pub(crate) fn create(&self, tab: TabProxy, user: Option<User>) {
        let app = self.record.app.clone();
        let slot = self.slot.clone();
        drop(self.record.strand.schedule_exclusive(move || {
            let app_tab = app.create_tab(tab, user);
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(app_tab);
        }));
    }

    pub(crate) fn change_user(&self, user: Option<User>) {
        self.dispatch(move |tab| tab.change_user(user));
    }

    pub(crate) fn receive(&self, value: Value) {
        self.dispatch(move |tab| tab.receive(value));
    }

    /// Delivered at most once; later callbacks are dropped
    pub(crate) fn tab_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slot = self.slot.clone();
        drop(self.record.strand.schedule_exclusive(move || {
            let app_tab = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(mut app_tab) = app_tab {
                app_tab.tab_closed();
            }
        }));
    }

    fn dispatch(&self, call: impl FnOnce(&mut dyn AppTab) + Send + 'static) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(app = %self.record.name, "tab already closed, dropping app callback");
            return;
        }
        let slot = self.slot.clone();
        drop(self.record.strand.schedule_exclusive(move || {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(app_tab) = slot.as_mut() {
                call(app_tab.as_mut());
            }
        }));
    }
}

/// Optional attributes for [`TabProxy::set_cookie`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieAttributes {
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

/// Render a cookie the way `document.cookie` accepts it
pub fn format_cookie(name: &str, value: &str, attributes: &CookieAttributes) -> String {
    let mut cookie = format!("{name}={value}");
    if let Some(domain) = &attributes.domain {
        cookie.push_str(&format!("; Domain={domain}"));
    }
    if let Some(path) = &attributes.path {
        cookie.push_str(&format!("; Path={path}"));
    }
    if let Some(expires) = &attributes.expires {
        cookie.push_str(&format!(
            "; Expires={}",
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
    }
    if attributes.secure {
        cookie.push_str("; Secure");
    }
    if attributes.http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie
}

/// What an app holds to talk to its browser tab
///
/// The proxy does not keep the tab alive; once the tab is gone every call
/// is silently ignored.
#[derive(Clone)]
pub struct TabProxy {
    tab: WeakServerTab,
    session_key: Arc<str>,
    tab_id: Arc<str>,
}

impl TabProxy {
    pub(crate) fn new(tab: WeakServerTab, session_key: &str, tab_id: &str) -> Self {
        Self {
            tab,
            session_key: Arc::from(session_key),
            tab_id: Arc::from(tab_id),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Queue a plain `"event"` for the browser
    pub fn send(&self, value: Value) {
        self.send_event("event", value);
    }

    pub fn send_event(&self, kind: &str, value: Value) {
        if let Some(tab) = self.tab.upgrade() {
            drop(tab.send(kind, value));
        }
    }

    pub fn set_cookie(&self, name: &str, value: &str, attributes: &CookieAttributes) {
        if let Some(tab) = self.tab.upgrade() {
            drop(tab.set_cookie(name, value, attributes));
        }
    }

    /// Ask the browser to reload the page
    pub fn reload_page(&self) {
        if let Some(tab) = self.tab.upgrade() {
            drop(tab.reload_page());
        }
    }

    /// Switch the whole session to another user
    pub fn switch_user(&self, user_id: &str) {
        if let Some(tab) = self.tab.upgrade() {
            drop(tab.switch_user(user_id));
        }
    }
}
