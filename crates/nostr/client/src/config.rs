//! TOML configuration for a pool and its relays.
//!
//! ```toml
//! publish_timeout_ms = 5000
//! eose_timeout_ms = 5000
//!
//! [connection]
//! connect_timeout_ms = 2000
//! watchdog_interval_ms = 60000
//! keep_alive_timeout_ms = 60000
//!
//! [[relays]]
//! url = "wss://relay.example"
//! read = true
//! write = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::pool::PoolConfig;
use crate::relay::RelayConfig;
use crate::relay_url::RelayUrl;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub publish_timeout_ms: u64,
    pub eose_timeout_ms: u64,
    pub connection: ConnectionSection,
    pub relays: Vec<RelayEntry>,
}

/// Timing shared by every relay connection. A zero watchdog interval disables it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSection {
    pub connect_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub keep_alive_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayEntry {
    pub url: RelayUrl,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub write: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FileConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            publish_timeout_ms: millis(pool.publish_timeout),
            eose_timeout_ms: millis(pool.eose_timeout),
            connection: ConnectionSection::default(),
            relays: Vec::new(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            connect_timeout_ms: millis(relay.connect_timeout),
            watchdog_interval_ms: millis(relay.watchdog_interval),
            keep_alive_timeout_ms: millis(relay.keep_alive_timeout),
        }
    }
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|error| ClientError::Config(format!("{}: {}", path.display(), error)))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|error| ClientError::Config(error.to_string()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            relay_config: self.connection.relay_config(true, true),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            eose_timeout: Duration::from_millis(self.eose_timeout_ms),
        }
    }

    /// One connection configuration per listed relay.
    pub fn relay_configs(&self) -> Vec<(RelayUrl, RelayConfig)> {
        self.relays
            .iter()
            .map(|entry| {
                (
                    entry.url.clone(),
                    self.connection.relay_config(entry.read, entry.write),
                )
            })
            .collect()
    }
}

impl ConnectionSection {
    fn relay_config(&self, read: bool, write: bool) -> RelayConfig {
        RelayConfig {
            read,
            write,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
            keep_alive_timeout: Duration::from_millis(self.keep_alive_timeout_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() -> Result<()> {
        let config = FileConfig::from_toml_str("")?;
        assert_eq!(config, FileConfig::default());

        let pool = config.pool_config();
        assert_eq!(pool.publish_timeout, Duration::from_secs(5));
        assert_eq!(pool.eose_timeout, Duration::from_secs(5));
        assert_eq!(pool.relay_config.connect_timeout, Duration::from_secs(2));
        assert_eq!(pool.relay_config.watchdog_interval, Duration::from_secs(60));
        assert_eq!(pool.relay_config.keep_alive_timeout, Duration::from_secs(60));
        assert!(config.relay_configs().is_empty());
        Ok(())
    }

    #[test]
    fn parses_relays_and_timings() -> Result<()> {
        let config = FileConfig::from_toml_str(
            r#"
publish_timeout_ms = 1500
eose_timeout_ms = 2500

[connection]
connect_timeout_ms = 500
watchdog_interval_ms = 0

[[relays]]
url = "wss://relay.one/?b=2&a=1"

[[relays]]
url = "ws://relay.two:7000"
write = false
"#,
        )?;

        assert_eq!(config.pool_config().publish_timeout, Duration::from_millis(1500));
        assert_eq!(config.pool_config().eose_timeout, Duration::from_millis(2500));

        let relays = config.relay_configs();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].0.as_str(), "wss://relay.one?a=1&b=2");
        assert!(relays[0].1.read && relays[0].1.write);
        assert_eq!(relays[0].1.connect_timeout, Duration::from_millis(500));
        assert!(relays[0].1.watchdog_interval.is_zero());
        assert_eq!(relays[0].1.keep_alive_timeout, Duration::from_secs(60));
        assert_eq!(relays[1].0.as_str(), "ws://relay.two:7000");
        assert!(relays[1].1.read && !relays[1].1.write);
        Ok(())
    }

    #[test]
    fn rejects_bad_input() {
        for text in [
            "[[relays]]\nurl = \"https://not-a-relay\"\n",
            "unknown_key = 1\n",
            "publish_timeout_ms = \"soon\"\n",
        ] {
            assert!(
                matches!(FileConfig::from_toml_str(text), Err(ClientError::Config(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn loads_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "[[relays]]\nurl = \"wss://file.test\"\nread = false")?;

        let config = FileConfig::from_path(file.path())?;
        assert_eq!(config.relays.len(), 1);
        assert!(!config.relays[0].read);

        assert!(matches!(
            FileConfig::from_path(Path::new("/definitely/not/here.toml")),
            Err(ClientError::Io(_))
        ));
        Ok(())
    }
}
