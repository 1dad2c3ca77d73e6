// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server configuration with layered sources.
//!
//! Values resolve in precedence order: CLI flag, then `STRAND_*` environment
//! variable, then a `strand.{json,yaml,yml}` config file (searched upward from
//! the working directory, then `~/.config/strand/`), then the built-in
//! default. List-valued keys (`sdk-url`, `event-key`) are comma-split when
//! they arrive as a single string.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, ServerError};

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface the HTTP API binds to.
    pub host: String,
    /// Port the HTTP API binds to.
    pub port: u16,
    /// SDK endpoints to discover functions from.
    pub sdk_urls: Vec<String>,
    /// Accepted event keys. Empty accepts any key.
    pub event_keys: Vec<String>,
    /// Hex signing key for SDK request signatures. Empty disables signing.
    pub signing_key: String,
    /// Postgres connection string for the registry. None selects SQLite.
    pub postgres_uri: Option<String>,
    /// Redis connection string for queue and state backends.
    pub redis_uri: String,
    /// Directory holding the SQLite registry database.
    pub sqlite_dir: PathBuf,
    /// Concurrent queue workers.
    pub queue_workers: usize,
    /// Queue poll interval.
    pub tick: Duration,
    /// Interval between SDK re-discovery syncs.
    pub poll_interval: Duration,
    /// Default retry interval applied to functions that set none.
    pub retry_interval: Option<u64>,
    /// Skip SDK discovery entirely.
    pub no_discovery: bool,
    /// Sync SDKs once at startup instead of continuously.
    pub no_poll: bool,
    /// Use in-memory queue and state backends instead of Redis.
    pub in_memory: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8288,
            sdk_urls: Vec::new(),
            event_keys: Vec::new(),
            signing_key: String::new(),
            postgres_uri: None,
            redis_uri: "redis://127.0.0.1:6379".to_string(),
            sqlite_dir: PathBuf::from(".strand"),
            queue_workers: 100,
            tick: Duration::from_millis(150),
            poll_interval: Duration::from_secs(5),
            retry_interval: None,
            no_discovery: false,
            no_poll: false,
            in_memory: false,
        }
    }
}

impl ServerConfig {
    /// Resolve configuration from all sources, with `flags` on top.
    pub fn resolve(flags: ConfigOverlay) -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| ServerError::Config(format!("cannot determine working directory: {e}")))?;
        let file = ConfigOverlay::from_file_search(&cwd)?.unwrap_or_default();
        let env = ConfigOverlay::from_env()?;
        let overlay = file.merge(env).merge(flags);
        Self::from_overlay(overlay)
    }

    fn from_overlay(o: ConfigOverlay) -> Result<Self> {
        let d = Self::default();
        let queue_workers = o.queue_workers.unwrap_or(d.queue_workers);
        if queue_workers == 0 {
            return Err(ServerError::Config("queue-workers must be at least 1".into()));
        }
        Ok(Self {
            host: o.host.unwrap_or(d.host),
            port: o.port.unwrap_or(d.port),
            sdk_urls: o.sdk_url.unwrap_or_default(),
            event_keys: o.event_key.unwrap_or_default(),
            signing_key: o.signing_key.unwrap_or(d.signing_key),
            postgres_uri: o.postgres_uri,
            redis_uri: o.redis_uri.unwrap_or(d.redis_uri),
            sqlite_dir: o.sqlite_dir.unwrap_or(d.sqlite_dir),
            queue_workers,
            tick: o.tick.map(Duration::from_millis).unwrap_or(d.tick),
            poll_interval: o.poll_interval.map(Duration::from_secs).unwrap_or(d.poll_interval),
            retry_interval: o.retry_interval,
            no_discovery: o.no_discovery.unwrap_or(false),
            no_poll: o.no_poll.unwrap_or(false),
            in_memory: o.in_memory.unwrap_or(false),
        })
    }
}

/// A partial configuration from a single source. `None` means "not set here".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigOverlay {
    /// Bind host.
    pub host: Option<String>,
    /// Bind port.
    pub port: Option<u16>,
    /// SDK endpoints, as a list or comma-joined string.
    #[serde(deserialize_with = "string_list")]
    pub sdk_url: Option<Vec<String>>,
    /// Accepted event keys, as a list or comma-joined string.
    #[serde(deserialize_with = "string_list")]
    pub event_key: Option<Vec<String>>,
    /// Hex signing key.
    pub signing_key: Option<String>,
    /// Postgres registry URI.
    pub postgres_uri: Option<String>,
    /// Redis URI.
    pub redis_uri: Option<String>,
    /// SQLite registry directory.
    pub sqlite_dir: Option<PathBuf>,
    /// Queue worker count.
    pub queue_workers: Option<usize>,
    /// Queue poll interval in milliseconds.
    pub tick: Option<u64>,
    /// SDK re-discovery interval in seconds.
    pub poll_interval: Option<u64>,
    /// Default retry interval in seconds.
    pub retry_interval: Option<u64>,
    /// Skip SDK discovery.
    pub no_discovery: Option<bool>,
    /// Sync SDKs only once.
    pub no_poll: Option<bool>,
    /// Use in-memory backends.
    pub in_memory: Option<bool>,
}

impl ConfigOverlay {
    /// Apply `higher` over `self`, keeping `self` values only where `higher`
    /// leaves them unset.
    pub fn merge(self, higher: Self) -> Self {
        Self {
            host: higher.host.or(self.host),
            port: higher.port.or(self.port),
            sdk_url: higher.sdk_url.or(self.sdk_url),
            event_key: higher.event_key.or(self.event_key),
            signing_key: higher.signing_key.or(self.signing_key),
            postgres_uri: higher.postgres_uri.or(self.postgres_uri),
            redis_uri: higher.redis_uri.or(self.redis_uri),
            sqlite_dir: higher.sqlite_dir.or(self.sqlite_dir),
            queue_workers: higher.queue_workers.or(self.queue_workers),
            tick: higher.tick.or(self.tick),
            poll_interval: higher.poll_interval.or(self.poll_interval),
            retry_interval: higher.retry_interval.or(self.retry_interval),
            no_discovery: higher.no_discovery.or(self.no_discovery),
            no_poll: higher.no_poll.or(self.no_poll),
            in_memory: higher.in_memory.or(self.in_memory),
        }
    }

    /// Read the `STRAND_*` environment variables for every config key.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_string("STRAND_HOST"),
            port: env_parse("STRAND_PORT")?,
            sdk_url: env_string("STRAND_SDK_URL").map(|v| split_list(&v)),
            event_key: env_string("STRAND_EVENT_KEY").map(|v| split_list(&v)),
            signing_key: env_string("STRAND_SIGNING_KEY"),
            postgres_uri: env_string("STRAND_POSTGRES_URI"),
            redis_uri: env_string("STRAND_REDIS_URI"),
            sqlite_dir: env_string("STRAND_SQLITE_DIR").map(PathBuf::from),
            queue_workers: env_parse("STRAND_QUEUE_WORKERS")?,
            tick: env_parse("STRAND_TICK")?,
            poll_interval: env_parse("STRAND_POLL_INTERVAL")?,
            retry_interval: env_parse("STRAND_RETRY_INTERVAL")?,
            no_discovery: env_bool("STRAND_NO_DISCOVERY")?,
            no_poll: env_bool("STRAND_NO_POLL")?,
            in_memory: env_bool("STRAND_IN_MEMORY")?,
        })
    }

    /// Search for a config file starting at `start` and walking up, then in
    /// `~/.config/strand/`. Returns `None` when no file exists.
    pub fn from_file_search(start: &Path) -> Result<Option<Self>> {
        for dir in start.ancestors() {
            if let Some(overlay) = Self::from_dir(dir)? {
                return Ok(Some(overlay));
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            let dir = Path::new(&home).join(".config").join("strand");
            if let Some(overlay) = Self::from_dir(&dir)? {
                return Ok(Some(overlay));
            }
        }
        Ok(None)
    }

    fn from_dir(dir: &Path) -> Result<Option<Self>> {
        for name in ["strand.json", "strand.yaml", "strand.yml"] {
            let path = dir.join(name);
            if path.is_file() {
                return Self::from_file(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Parse a single config file by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("cannot read {}: {e}", path.display())))?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json {
            serde_json::from_str(&raw)
                .map_err(|e| ServerError::Config(format!("invalid {}: {e}", path.display())))
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|e| ServerError::Config(format!("invalid {}: {e}", path.display())))
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ServerError::Config(format!("invalid value for {key}"))),
        None => Ok(None),
    }
}

fn env_bool(key: &'static str) -> Result<Option<bool>> {
    match env_string(key).as_deref() {
        None => Ok(None),
        Some("1") | Some("true") => Ok(Some(true)),
        Some("0") | Some("false") => Ok(Some(false)),
        Some(_) => Err(ServerError::Config(format!("invalid boolean for {key}"))),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

/// Accepts either a plain string (comma-split) or a list of strings.
fn string_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(|v| match v {
        OneOrMany::One(s) => split_list(&s),
        OneOrMany::Many(items) => items,
    }))
}
