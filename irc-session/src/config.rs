//! Connection configuration, identity profiles and server addresses.
//!
//! Config files are TOML. Every key is optional; missing keys fall back to the
//! defaults below. The default location is `~/.config/irc-session/connection.toml`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Lower bound applied to the reconnect delay.
pub const MIN_RECONNECT_DELAY_MS: u64 = 1000;

/// Port used when an `irc://` address does not carry one.
pub const DEFAULT_PORT: u16 = 6667;
/// Port used when an `ircs://` address does not carry one.
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// Behaviour switches for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Sent with QUIT on a user disconnect.
    pub quit_message: String,
    /// Sent with QUIT when reconnecting.
    pub reconnect_message: String,
    /// Sent with PART when a joined channel is closed.
    pub part_message: String,
    /// Used when kicking without an explicit reason.
    pub kick_message: String,
    /// Schedule a reconnect when the socket closes unexpectedly.
    pub reconnect_on_disconnect: bool,
    /// Schedule a reconnect when the connection attempt itself fails.
    pub reconnect_on_connect_failure: bool,
    /// Delay before a scheduled reconnect, clamped to [`MIN_RECONNECT_DELAY_MS`].
    pub reconnect_delay_ms: u64,
    pub close_channels_on_quit: bool,
    pub close_channels_on_disconnect: bool,
    pub close_queries_on_quit: bool,
    pub close_queries_on_disconnect: bool,
    /// Rejoin channels that were lost to a disconnect once registered again.
    pub rejoin_channels: bool,
    /// Focus joined channels even when they were requested in the background.
    pub hide_channels: bool,
    /// Period of the WHO refresh timer.
    pub who_interval_ms: u64,
    /// Whether the WHO refresh timer actually sends WHO.
    pub send_who: bool,
    /// Number of topics remembered per channel.
    pub topic_history_size: usize,
    /// Reconnect once the server has not answered a ping for this long.
    pub ping_timeout_ms: u64,
    /// How long `connect` waits for a previous transport to close.
    pub disconnect_wait_ms: u64,
    /// Answer VERSION, PING and CLIENTINFO CTCP requests.
    pub ctcp_auto_reply: bool,
    /// Version string used in CTCP VERSION replies.
    pub version: String,
    /// Regular expressions matched against `nick!ident@host`.
    pub ignore_list: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            quit_message: "Leaving".to_string(),
            reconnect_message: "Reconnecting".to_string(),
            part_message: "Leaving".to_string(),
            kick_message: "Kicked".to_string(),
            reconnect_on_disconnect: false,
            reconnect_on_connect_failure: false,
            reconnect_delay_ms: 30_000,
            close_channels_on_quit: false,
            close_channels_on_disconnect: false,
            close_queries_on_quit: false,
            close_queries_on_disconnect: false,
            rejoin_channels: true,
            hide_channels: false,
            who_interval_ms: 60_000,
            send_who: false,
            topic_history_size: 10,
            ping_timeout_ms: 60_000,
            disconnect_wait_ms: 5_000,
            ctcp_auto_reply: true,
            version: format!("irc-session {}", env!("CARGO_PKG_VERSION")),
            ignore_list: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("irc-session")
            .join("connection.toml")
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        for pattern in &config.ignore_list {
            if let Err(source) = regex::Regex::new(pattern) {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                });
            }
        }
        Ok(config)
    }

    /// Reconnect delay with the floor applied.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(MIN_RECONNECT_DELAY_MS))
    }

    pub fn who_interval(&self) -> Duration {
        Duration::from_millis(self.who_interval_ms.max(1))
    }

    pub fn disconnect_wait(&self) -> Duration {
        Duration::from_millis(self.disconnect_wait_ms)
    }
}

/// The identity presented to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Nicknames in order of preference; the first is tried first.
    pub nicknames: Vec<String>,
    /// Username (ident). Falls back to the first nickname.
    #[serde(default)]
    pub ident: Option<String>,
    #[serde(default = "default_realname")]
    pub realname: String,
}

fn default_realname() -> String {
    "irc-session user".to_string()
}

impl Profile {
    pub fn new(nick: &str) -> Self {
        Self {
            nicknames: vec![nick.to_string()],
            ident: None,
            realname: default_realname(),
        }
    }

    pub fn primary_nickname(&self) -> &str {
        self.nicknames.first().map(String::as_str).unwrap_or("user")
    }

    pub fn ident(&self) -> &str {
        self.ident.as_deref().unwrap_or_else(|| self.primary_nickname())
    }

    /// The nickname to try after `current` was rejected, if the profile has one.
    pub fn next_nickname(&self, current: &str, equals: impl Fn(&str, &str) -> bool) -> Option<&str> {
        let position = self.nicknames.iter().position(|n| equals(n, current))?;
        self.nicknames
            .get(position + 1)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }
}

/// Where to connect: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    url: Url,
}

impl ServerAddress {
    /// Parse `irc://host:port`, `ircs://host` and so on.
    ///
    /// A bare `host[:port]` is taken to mean `irc://`.
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let candidate = if address.contains("://") {
            address.to_string()
        } else {
            format!("irc://{address}")
        };
        let url = Url::parse(&candidate).map_err(|e| ConfigError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidAddress {
                address: address.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(if self.is_secure() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        })
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme().eq_ignore_ascii_case("ircs")
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// Channels named in the path (`irc://host/#a,#b`).
    pub fn channels(&self) -> Vec<String> {
        let path = self.url.path().trim_start_matches('/');
        let fragment = self.url.fragment().map(|f| format!("#{f}")).unwrap_or_default();
        let joined = format!("{path}{fragment}");
        joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host(), self.port())
    }
}
