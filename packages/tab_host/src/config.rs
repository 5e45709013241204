use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::event_queue::DEFAULT_QUEUE_BUDGET;
use crate::server_tab::TimeoutPolicy;

// =============================================================================
// File config (figment-deserialized from defaults / tab-host.toml / env vars)
// =============================================================================
//
//   tab-host.toml:   [tabs]
//                    max_poll_duration_secs = 30
//
//   env var:         TAB_HOST_TABS__MAX_POLL_DURATION_SECS=30
//
//   (double underscore = nesting, single underscore stays in field names)

pub const DEFAULT_CONFIG_FILE: &str = "tab-host.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub tabs: TabsFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Listen address (lives under `[server]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Tab lifetime knobs (lives under `[tabs]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabsFileConfig {
    #[serde(default = "default_max_age_without_listener_secs")]
    pub max_age_without_listener_secs: u64,
    #[serde(default = "default_max_poll_duration_secs")]
    pub max_poll_duration_secs: u64,
    #[serde(default = "default_queue_budget_bytes")]
    pub queue_budget_bytes: usize,
}

impl Default for TabsFileConfig {
    fn default() -> Self {
        Self {
            max_age_without_listener_secs: default_max_age_without_listener_secs(),
            max_poll_duration_secs: default_max_poll_duration_secs(),
            queue_budget_bytes: default_queue_budget_bytes(),
        }
    }
}

/// Cookie names (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_user_cookie_name")]
    pub user_cookie_name: String,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            user_cookie_name: default_user_cookie_name(),
        }
    }
}

fn default_max_age_without_listener_secs() -> u64 {
    10
}
fn default_max_poll_duration_secs() -> u64 {
    10
}
fn default_queue_budget_bytes() -> usize {
    DEFAULT_QUEUE_BUDGET
}
fn default_cookie_name() -> String {
    "tabhost_session".to_string()
}
fn default_user_cookie_name() -> String {
    "tabhost_user".to_string()
}

/// Build a figment that layers: defaults → tab-host.toml → TAB_HOST_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TAB_HOST_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub policy: TimeoutPolicy,
    pub queue_budget: usize,
    /// Cookie carrying the session key
    pub cookie_name: String,
    /// Cookie naming the signed-in user, read when a tab is created
    pub user_cookie_name: String,
}

impl HostConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc
                .server
                .host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: fc.server.port.unwrap_or(8080),
            policy: TimeoutPolicy::from_file(&fc.tabs),
            queue_budget: fc.tabs.queue_budget_bytes,
            cookie_name: fc.session.cookie_name.clone(),
            user_cookie_name: fc.session.user_cookie_name.clone(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl TimeoutPolicy {
    pub fn from_file(fc: &TabsFileConfig) -> Self {
        Self {
            max_age_without_listener: Duration::from_secs(fc.max_age_without_listener_secs),
            max_poll_duration: Duration::from_secs(fc.max_poll_duration_secs),
        }
    }
}
