//! Tab status notifications for operational monitoring

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use strand_kit::Strand;

/// Queue state of one tab after a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabStatus {
    pub session_key: String,
    pub tab_id: String,
    pub user_id: String,
    pub queue_length: usize,
    pub last_read: DateTime<Utc>,
    pub has_listener: bool,
}

/// Observer of tab lifecycle and queue state
///
/// Calls arrive from tab strands; implementations must not block.
/// Wrap slow observers in a [`TabStatusQueue`].
pub trait TabStatusListener: Send + Sync {
    fn new_tab(&self, session_key: &str, tab_id: &str, user_id: &str, app_name: &str);
    fn tab_closed(&self, session_key: &str, tab_id: &str);
    fn update_tab_status(&self, status: TabStatus);
}

/// Forwards notifications to another listener on a strand of its own,
/// preserving their order
pub struct TabStatusQueue {
    strand: Strand,
    listener: Arc<dyn TabStatusListener>,
}

impl TabStatusQueue {
    pub fn new(listener: Arc<dyn TabStatusListener>) -> Self {
        Self {
            strand: Strand::new("tab-status"),
            listener,
        }
    }

    fn forward(&self, notify: impl FnOnce(&dyn TabStatusListener) + Send + 'static) {
        let listener = self.listener.clone();
        drop(
            self.strand
                .schedule_exclusive(move || notify(listener.as_ref())),
        );
    }
}

impl TabStatusListener for TabStatusQueue {
    fn new_tab(&self, session_key: &str, tab_id: &str, user_id: &str, app_name: &str) {
        let (session_key, tab_id, user_id, app_name) = (
            session_key.to_string(),
            tab_id.to_string(),
            user_id.to_string(),
            app_name.to_string(),
        );
        self.forward(move |l| l.new_tab(&session_key, &tab_id, &user_id, &app_name));
    }

    fn tab_closed(&self, session_key: &str, tab_id: &str) {
        let (session_key, tab_id) = (session_key.to_string(), tab_id.to_string());
        self.forward(move |l| l.tab_closed(&session_key, &tab_id));
    }

    fn update_tab_status(&self, status: TabStatus) {
        self.forward(move |l| l.update_tab_status(status));
    }
}

/// Row of the live tab table served at `/status/tabs`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabSnapshot {
    pub session_key: String,
    pub tab_id: String,
    pub app_name: String,
    pub user_id: String,
    pub queue_length: usize,
    pub has_listener: bool,
    pub last_read: Option<DateTime<Utc>>,
}

/// Listener that keeps a table of live tabs
#[derive(Default)]
pub struct TabStatusBoard {
    tabs: Mutex<BTreeMap<(String, String), TabSnapshot>>,
}

impl TabStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<TabSnapshot> {
        self.tabs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tabs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TabStatusListener for TabStatusBoard {
    fn new_tab(&self, session_key: &str, tab_id: &str, user_id: &str, app_name: &str) {
        self.tabs.lock().unwrap_or_else(PoisonError::into_inner).insert(
            (session_key.to_string(), tab_id.to_string()),
            TabSnapshot {
                session_key: session_key.to_string(),
                tab_id: tab_id.to_string(),
                app_name: app_name.to_string(),
                user_id: user_id.to_string(),
                queue_length: 0,
                has_listener: false,
                last_read: None,
            },
        );
    }

    fn tab_closed(&self, session_key: &str, tab_id: &str) {
        self.tabs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(session_key.to_string(), tab_id.to_string()));
    }

    fn update_tab_status(&self, status: TabStatus) {
        let mut tabs = self.tabs.lock().unwrap_or_else(PoisonError::into_inner);
        // updates racing a close are dropped
        if let Some(row) = tabs.get_mut(&(status.session_key, status.tab_id)) {
            row.user_id = status.user_id;
            row.queue_length = status.queue_length;
            row.has_listener = status.has_listener;
            row.last_read = Some(status.last_read);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(tab_id: &str, queue_length: usize) -> TabStatus {
        TabStatus {
            session_key: "s1".into(),
            tab_id: tab_id.into(),
            user_id: "ada".into(),
            queue_length,
            last_read: Utc::now(),
            has_listener: true,
        }
    }

    #[test]
    fn test_board_tracks_lifecycle() {
        let board = TabStatusBoard::new();
        board.new_tab("s1", "1", "", "echo");
        board.new_tab("s1", "2", "", "echo");
        board.update_tab_status(status("1", 3));
        assert_eq!(board.len(), 2);

        let rows = board.snapshot();
        assert_eq!(rows[0].tab_id, "1");
        assert_eq!(rows[0].queue_length, 3);
        assert_eq!(rows[0].user_id, "ada");
        assert!(rows[0].has_listener);
        assert!(rows[1].last_read.is_none());

        board.tab_closed("s1", "1");
        board.update_tab_status(status("1", 9));
        let rows = board.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tab_id, "2");
    }

    #[tokio::test]
    async fn test_queue_forwards_in_order() {
        let board = Arc::new(TabStatusBoard::new());
        let queue = TabStatusQueue::new(board.clone());

        queue.new_tab("s1", "1", "", "echo");
        queue.update_tab_status(status("1", 1));
        queue.update_tab_status(status("1", 2));
        queue.tab_closed("s1", "1");
        queue.new_tab("s1", "2", "", "echo");

        queue.strand.schedule_exclusive(|| ()).await.unwrap();
        let rows = board.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tab_id, "2");
        assert_eq!(rows[0].queue_length, 0);
    }
}
