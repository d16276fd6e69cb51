use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    codec::DEFAULT_MAX_FRAME_SIZE,
    error::{Error, ErrorKind, Result},
};

/// Connection selection policy used by the invoker registry.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    RoundRobin,
    Random,
    First,
}

/// What an application does when discovery reports that a server's data
/// blob changed.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ChildUpdatePolicy {
    /// Log the event and keep the existing connection untouched.
    #[default]
    Ignore,
    /// Re-read the declared interfaces and rebuild the connection if they changed.
    Refresh,
}

/// Runtime-wide client settings.
///
/// Every field has a default, so `{}` is a valid configuration document.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Bounded wait of a single call. Also the period of the timeout sweeper.
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    #[serde_inline_default(true)]
    pub auto_reconnect: bool,
    #[serde_inline_default(Some(Duration::from_secs(30)))]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Option<Duration>,
    #[serde_inline_default(Some(Duration::from_secs(50)))]
    #[serde(with = "humantime_serde")]
    pub read_idle_timeout: Option<Duration>,
    #[serde_inline_default(DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
    #[serde_inline_default(false)]
    pub use_msgpack: bool,
    #[serde_inline_default(SelectorKind::RoundRobin)]
    pub selector: SelectorKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Settings of one discovery-driven application.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct AppConfig {
    pub name: String,
    #[serde_inline_default(None)]
    pub version: Option<String>,
    #[serde_inline_default(ChildUpdatePolicy::Ignore)]
    pub child_update: ChildUpdatePolicy,
}

impl AppConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            child_update: ChildUpdatePolicy::default(),
        }
    }

    /// Discovery path listing the servers of this application.
    #[must_use]
    pub fn servers_path(&self) -> String {
        format!("/{}/servers", self.name)
    }
}

macro_rules! impl_json_loading {
    ($ty:ty) => {
        impl $ty {
            /// # Errors
            pub fn from_json_str(json: &str) -> Result<Self> {
                Ok(serde_json::from_str(json)?)
            }

            /// # Errors
            pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
                let path = path.as_ref();
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::new(
                        ErrorKind::InvalidArgument,
                        format!("read config {}: {e}", path.display()),
                    )
                })?;
                Self::from_json_str(&content)
            }
        }
    };
}

impl_json_loading!(ClientConfig);
impl_json_loading!(AppConfig);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.max_frame_size, 1 << 20);
        assert_eq!(config.selector, SelectorKind::RoundRobin);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_partial_config() {
        let config = ClientConfig::from_json_str(
            r#"{"call_timeout": "500ms", "heartbeat_interval": null, "selector": "random"}"#,
        )
        .unwrap();
        assert_eq!(config.call_timeout, Duration::from_millis(500));
        assert_eq!(config.heartbeat_interval, None);
        assert_eq!(config.selector, SelectorKind::Random);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));

        let app = AppConfig::from_json_str(r#"{"name": "order", "child_update": "refresh"}"#)
            .unwrap();
        assert_eq!(app.servers_path(), "/order/servers");
        assert_eq!(app.child_update, ChildUpdatePolicy::Refresh);
        assert_eq!(app.version, None);

        assert!(AppConfig::from_json_str("{}").is_err());
    }
}
