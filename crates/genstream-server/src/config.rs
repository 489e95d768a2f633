//! Server configuration and YAML loading.
//!
//! Configuration is built in two layers: an optional YAML file read by
//! [`ConfigLoader`], then command line flags applied through the `with_*`
//! setters on [`ServerConfig`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ServerError};

/// Maximum number of events retained per session before trimming.
pub const DEFAULT_MAX_EVENTS: usize = 1000;
/// Age after which a session's event log is evicted regardless of state.
pub const DEFAULT_MAX_EVENT_AGE: Duration = Duration::from_secs(40 * 60);
/// Interval of the eviction sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How long a finished session stays resumable.
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_secs(5 * 60);
/// Wall-clock ceiling for one generation.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(16 * 60);
/// Idle time after which a keepalive is sent on a client channel.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the session server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Enable request logging
    pub enable_logging: bool,
    /// Keep-alive interval for SSE connections
    pub sse_keepalive_interval: Duration,
    /// Idle interval before a WebSocket ping frame is sent
    pub heartbeat_interval: Duration,
    /// Events retained per session
    pub max_events: usize,
    /// Maximum age of a session's event log
    pub max_event_age: Duration,
    /// Eviction sweep interval
    pub cleanup_interval: Duration,
    /// Retention of a finished session's log
    pub completion_grace: Duration,
    /// Wall-clock ceiling per session
    pub session_timeout: Duration,
    /// Signal the session's abort handle when an SSE stream is dropped
    pub cancel_on_stream_disconnect: bool,
    /// Derive phase events from message text and tool names
    pub phase_inference: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            enable_cors: true,
            cors_origins: None,
            enable_logging: true,
            sse_keepalive_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_events: DEFAULT_MAX_EVENTS,
            max_event_age: DEFAULT_MAX_EVENT_AGE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            completion_grace: DEFAULT_COMPLETION_GRACE,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            cancel_on_stream_disconnect: false,
            phase_inference: true,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    /// Enable or disable CORS.
    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    /// Set allowed CORS origins.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = if origins.is_empty() {
            None
        } else {
            Some(origins)
        };
        self
    }

    /// Enable or disable request logging.
    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    /// Set SSE keep-alive interval.
    pub fn with_sse_keepalive(mut self, interval: Duration) -> Self {
        self.sse_keepalive_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_max_event_age(mut self, age: Duration) -> Self {
        self.max_event_age = age;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_completion_grace(mut self, grace: Duration) -> Self {
        self.completion_grace = grace;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_cancel_on_stream_disconnect(mut self, enable: bool) -> Self {
        self.cancel_on_stream_disconnect = enable;
        self
    }

    pub fn with_phase_inference(mut self, enable: bool) -> Self {
        self.phase_inference = enable;
        self
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_events < 2 {
            return Err(ServerError::config_error(
                "max_events must be at least 2",
            ));
        }
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("sse_keepalive_interval", self.sse_keepalive_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("max_event_age", self.max_event_age),
            ("session_timeout", self.session_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ServerError::config_error(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// On-disk representation of the server configuration.
///
/// Every field is optional; durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub cors: Option<bool>,
    pub cors_origins: Option<Vec<String>>,
    pub logging: Option<bool>,
    pub heartbeat_secs: Option<u64>,
    pub sse_keepalive_secs: Option<u64>,
    pub max_events: Option<usize>,
    pub max_event_age_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub completion_grace_secs: Option<u64>,
    pub session_timeout_secs: Option<u64>,
    pub cancel_on_stream_disconnect: Option<bool>,
    pub phase_inference: Option<bool>,
}

impl FileConfig {
    /// Overlay the values present in the file onto `config`.
    pub fn apply(self, mut config: ServerConfig) -> Result<ServerConfig> {
        if let Some(bind) = self.bind {
            config = config.with_bind_addr_str(&bind)?;
        }
        if let Some(cors) = self.cors {
            config.enable_cors = cors;
        }
        if let Some(origins) = self.cors_origins {
            config = config.with_cors_origins(origins);
        }
        if let Some(logging) = self.logging {
            config.enable_logging = logging;
        }
        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sse_keepalive_secs {
            config.sse_keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(max_events) = self.max_events {
            config.max_events = max_events;
        }
        if let Some(secs) = self.max_event_age_secs {
            config.max_event_age = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cleanup_interval_secs {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.completion_grace_secs {
            config.completion_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.session_timeout_secs {
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Some(enable) = self.cancel_on_stream_disconnect {
            config.cancel_on_stream_disconnect = enable;
        }
        if let Some(enable) = self.phase_inference {
            config.phase_inference = enable;
        }
        Ok(config)
    }
}

/// Loads [`ServerConfig`] from YAML.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
        let path = path.as_ref();

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ServerError::config_error(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<ServerConfig> {
        let file: FileConfig = serde_yaml::from_str(content)
            .map_err(|e| ServerError::config_error(format!("Failed to parse YAML config: {}", e)))?;

        let config = file.apply(ServerConfig::default())?;
        config.validate()?;
        Ok(config)
    }
}
