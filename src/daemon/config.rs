//! Configuration loaded from `~/.config/sigline/config.toml`.

use color_eyre::eyre::{Result, eyre};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Account phone number, e.g. "+15555550000".
    pub username: String,

    /// Command that starts signal-cli in daemon mode. `%u` is replaced by
    /// the username.
    #[serde(default = "default_daemon_command")]
    pub daemon_command: String,

    /// `dbus-send` executable.
    #[serde(default = "default_dbus_send")]
    pub dbus_send: String,

    /// Where conversation history is kept. No history is saved when unset.
    #[serde(default)]
    pub history_file: Option<PathBuf>,

    /// Override for the computed cap on concurrent background commands.
    #[serde(default)]
    pub max_concurrent_processes: Option<usize>,

    /// How long a typing indicator stays up without a refresh.
    #[serde(default = "default_typing_ttl")]
    pub typing_ttl_secs: u64,

    /// Interval between checks for the daemon's D-Bus service at startup.
    #[serde(default = "default_startup_poll")]
    pub startup_poll_secs: u64,

    /// Append logs here instead of stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Whether inbound reactions count as unread messages.
    #[serde(default)]
    pub notify_on_reactions: bool,
}

fn default_daemon_command() -> String {
    "signal-cli -u %u daemon".into()
}

fn default_dbus_send() -> String {
    "dbus-send".into()
}

fn default_typing_ttl() -> u64 {
    10
}

fn default_startup_poll() -> u64 {
    1
}

/// `~/.config/sigline/config.toml`, or `None` when the platform has no
/// config directory.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sigline").join("config.toml"))
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                eyre!(
                    "No config found at {}\n\n\
                     Create it with at least your account number:\n\n\
                     username = \"+15555550000\"\n",
                    path.display()
                )
            } else {
                eyre!("failed to read {}: {e}", path.display())
            }
        })?;
        let config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| eyre!("failed to parse {}: {e}", path.display()))?;
        if config.username.trim().is_empty() {
            color_eyre::eyre::bail!("{}: username must not be empty", path.display());
        }
        Ok(config)
    }

    /// The daemon command line, split into words with `%u` substituted.
    pub fn daemon_argv(&self) -> Vec<String> {
        self.daemon_command
            .split_whitespace()
            .map(|word| word.replace("%u", &self.username))
            .collect()
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_ttl_secs)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_secs(self.startup_poll_secs.max(1))
    }
}
