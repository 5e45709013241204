use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::{App, AppTab, TabProxy};
use crate::apps_state::{AppsState, AppsStateOptions};
use crate::tab_status::{TabStatus, TabStatusListener};
use crate::users::User;

/// Options with a seeded key source so tests mint predictable sessions
pub fn test_options() -> AppsStateOptions {
    AppsStateOptions {
        rng: Box::new(StdRng::seed_from_u64(7)),
        ..Default::default()
    }
}

pub fn test_state(options: AppsStateOptions) -> AppsState {
    AppsState::new(options)
}

/// Let every strand drain. Under a paused clock the runtime only moves time
/// forward once all tasks are idle, so this returns after pending hops ran.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Created { tab_id: String, user: Option<String> },
    ChangeUser { tab_id: String, user: Option<String> },
    Received { tab_id: String, value: Value },
    Closed { tab_id: String },
}

/// App that records every callback it gets
#[derive(Default)]
pub struct RecordingApp {
    events: Arc<Mutex<Vec<AppEvent>>>,
    proxies: Mutex<Vec<TabProxy>>,
}

impl RecordingApp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AppEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn closed_count(&self, tab_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, AppEvent::Closed { tab_id: id } if id == tab_id))
            .count()
    }

    pub fn proxy(&self, tab_id: &str) -> Option<TabProxy> {
        self.proxies
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.tab_id() == tab_id)
            .cloned()
    }
}

struct RecordingTab {
    tab_id: String,
    events: Arc<Mutex<Vec<AppEvent>>>,
}

impl AppTab for RecordingTab {
    fn change_user(&mut self, user: Option<User>) {
        self.events.lock().unwrap().push(AppEvent::ChangeUser {
            tab_id: self.tab_id.clone(),
            user: user.map(|u| u.id),
        });
    }

    fn receive(&mut self, value: Value) {
        self.events.lock().unwrap().push(AppEvent::Received {
            tab_id: self.tab_id.clone(),
            value,
        });
    }

    fn tab_closed(&mut self) {
        self.events.lock().unwrap().push(AppEvent::Closed {
            tab_id: self.tab_id.clone(),
        });
    }
}

impl App for RecordingApp {
    fn create_tab(&self, tab: TabProxy, user: Option<User>) -> Box<dyn AppTab> {
        self.events.lock().unwrap().push(AppEvent::Created {
            tab_id: tab.tab_id().to_string(),
            user: user.map(|u| u.id),
        });
        let tab_id = tab.tab_id().to_string();
        self.proxies.lock().unwrap().push(tab);
        Box::new(RecordingTab {
            tab_id,
            events: self.events.clone(),
        })
    }
}

/// Status listener that keeps everything it hears
#[derive(Default)]
pub struct RecordingStatus {
    new_tabs: Mutex<Vec<(String, String)>>,
    closed: Mutex<Vec<(String, String)>>,
    updates: Mutex<Vec<TabStatus>>,
}

impl RecordingStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn new_tabs(&self) -> Vec<(String, String)> {
        self.new_tabs.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<(String, String)> {
        self.closed.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<TabStatus> {
        self.updates.lock().unwrap().clone()
    }
}

impl TabStatusListener for RecordingStatus {
    fn new_tab(&self, session_key: &str, tab_id: &str, _user_id: &str, _app_name: &str) {
        self.new_tabs
            .lock()
            .unwrap()
            .push((session_key.to_string(), tab_id.to_string()));
    }

    fn tab_closed(&self, session_key: &str, tab_id: &str) {
        self.closed
            .lock()
            .unwrap()
            .push((session_key.to_string(), tab_id.to_string()));
    }

    fn update_tab_status(&self, status: TabStatus) {
        self.updates.lock().unwrap().push(status);
    }
}
