//! User directory
//!
//! Identity plumbing only: tabs learn who is using them, nothing here
//! decides what a user may do.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            icon_url: None,
        }
    }
}

/// A user record was added, replaced or removed
#[derive(Debug, Clone)]
pub struct UserChange {
    pub user_id: String,
    pub old: Option<User>,
    pub new: Option<User>,
}

/// Shared map of known users; clones see the same directory
#[derive(Clone)]
pub struct UserDirectory {
    users: Arc<RwLock<HashMap<String, User>>>,
    changes: broadcast::Sender<UserChange>,
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDirectory {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            users: Arc::default(),
            changes,
        }
    }

    /// Insert or replace a user, returning the previous record
    pub fn set_user(&self, user: User) -> Option<User> {
        let old = self
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.id.clone(), user.clone());
        self.notify(UserChange {
            user_id: user.id.clone(),
            old: old.clone(),
            new: Some(user),
        });
        old
    }

    pub fn remove_user(&self, id: &str) -> Option<User> {
        let old = self
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if old.is_some() {
            self.notify(UserChange {
                user_id: id.to_string(),
                old: old.clone(),
                new: None,
            });
        }
        old
    }

    pub fn get(&self, id: &str) -> Option<User> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Resolve a requested user id. Empty or unknown ids resolve to the
    /// anonymous identity: `("", None)`.
    pub fn resolve(&self, id: &str) -> (String, Option<User>) {
        if id.is_empty() {
            return (String::new(), None);
        }
        match self.get(id) {
            Some(user) => (user.id.clone(), Some(user)),
            None => {
                debug!(user_id = %id, "unknown user id, treating as anonymous");
                (String::new(), None)
            }
        }
    }

    pub fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: UserChange) {
        // no subscribers is fine
        let _ = self.changes.send(change);
    }
}
