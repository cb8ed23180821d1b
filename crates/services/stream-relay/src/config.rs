//! Configuration for the stream relay gateway
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the stream relay gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Lookup endpoint configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Relay port range
    #[serde(default)]
    pub ports: PortConfig,

    /// Session refresh and eviction policy
    #[serde(default)]
    pub session: SessionPolicy,

    /// Upstream stream metadata source
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Relay pipeline settings
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Lookup endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Public-facing query port
    #[serde(default = "default_query_port")]
    pub query_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_query_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            query_port: default_query_port(),
        }
    }
}

/// Port range handed out to relays: `start_port+1 ..= start_port+max_ports`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    #[serde(default = "default_max_ports")]
    pub max_ports: u16,

    /// Hand ports of dead, replaced relays out again
    #[serde(default = "default_true")]
    pub reuse_released: bool,
}

fn default_start_port() -> u16 {
    6000
}

fn default_max_ports() -> u16 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            max_ports: default_max_ports(),
            reuse_released: true,
        }
    }
}

/// Session refresh and eviction policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicy {
    /// Idle time after which a session is re-validated on lookup
    #[serde(default = "default_refresh_period")]
    pub refresh_period_minutes: u64,

    /// Idle time after which the sweep evicts a session
    #[serde(default = "default_refresh_period")]
    pub idle_ttl_minutes: u64,

    /// Interval between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Grace period between SIGTERM and SIGKILL on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_refresh_period() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    3
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            refresh_period_minutes: default_refresh_period(),
            idle_ttl_minutes: default_refresh_period(),
            sweep_interval_seconds: default_sweep_interval(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl SessionPolicy {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_minutes.saturating_mul(60))
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_minutes.saturating_mul(60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Upstream stream metadata source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// URL template, `{identifier}` is replaced with the looked-up identifier
    #[serde(default = "default_url_template")]
    pub url_template: String,

    /// Request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,

    /// Variants whose lowest bitrate exceeds this are not relayed
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: f64,
}

fn default_url_template() -> String {
    "http://usher.justin.tv/find/{identifier}.json?type=any".to_string()
}

fn default_upstream_timeout() -> u64 {
    5
}

fn default_max_bitrate() -> f64 {
    5000.0
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            timeout_seconds: default_upstream_timeout(),
            max_bitrate: default_max_bitrate(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// Relay pipeline settings
///
/// The output format is fixed per deployment, never per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Shell used to run the puller | transcoder pipeline
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Stream puller executable
    #[serde(default = "default_puller")]
    pub puller: String,

    /// Transcoder/server executable
    #[serde(default = "default_transcoder")]
    pub transcoder: String,

    /// Player SWF URL presented to the upstream
    #[serde(default = "default_swf_url")]
    pub swf_url: String,

    /// Page URL presented to the upstream
    #[serde(default = "default_page_url")]
    pub page_url: String,

    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,

    #[serde(default = "default_mux")]
    pub mux: String,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_puller() -> String {
    "rtmpdump".to_string()
}

fn default_transcoder() -> String {
    "vlc".to_string()
}

fn default_swf_url() -> String {
    "http://www-cdn.jtvnw.net/widgets/live_site_player.swf".to_string()
}

fn default_page_url() -> String {
    "http://www.twitch.tv/".to_string()
}

fn default_audio_codec() -> String {
    "mp3".to_string()
}

fn default_audio_bitrate_kbps() -> u32 {
    72
}

fn default_mux() -> String {
    "ts".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            puller: default_puller(),
            transcoder: default_transcoder(),
            swf_url: default_swf_url(),
            page_url: default_page_url(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            mux: default_mux(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply `RELAY_*` overrides read through `lookup` on top of the defaults
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>, target: &mut T) {
            if let Some(v) = value.and_then(|v| v.parse().ok()) {
                *target = v;
            }
        }

        let mut config = Config::default();

        // Server
        if let Some(host) = lookup("RELAY_HOST") {
            config.server.host = host;
        }
        parsed(lookup("RELAY_QUERY_PORT"), &mut config.server.query_port);

        // Ports
        parsed(lookup("RELAY_START_PORT"), &mut config.ports.start_port);
        parsed(lookup("RELAY_MAX_PORTS"), &mut config.ports.max_ports);
        parsed(lookup("RELAY_REUSE_PORTS"), &mut config.ports.reuse_released);

        // Session
        parsed(
            lookup("RELAY_REFRESH_PERIOD_MINUTES"),
            &mut config.session.refresh_period_minutes,
        );
        parsed(
            lookup("RELAY_IDLE_TTL_MINUTES"),
            &mut config.session.idle_ttl_minutes,
        );
        parsed(
            lookup("RELAY_SWEEP_INTERVAL_SECONDS"),
            &mut config.session.sweep_interval_seconds,
        );

        // Upstream
        if let Some(template) = lookup("RELAY_UPSTREAM_URL") {
            config.upstream.url_template = template;
        }
        parsed(
            lookup("RELAY_UPSTREAM_TIMEOUT_SECONDS"),
            &mut config.upstream.timeout_seconds,
        );
        parsed(lookup("RELAY_MAX_BITRATE"), &mut config.upstream.max_bitrate);

        // Relay
        if let Some(puller) = lookup("RELAY_PULLER") {
            config.relay.puller = puller;
        }
        if let Some(transcoder) = lookup("RELAY_TRANSCODER") {
            config.relay.transcoder = transcoder;
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
            tracing::warn!(
                path = %p.as_ref().display(),
                "Config file not found, falling back to environment"
            );
        }
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject port ranges that do not fit in `u16`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.max_ports == 0 {
            return Err(ConfigError::Invalid("ports.max_ports must be > 0".to_string()));
        }
        if self
            .ports
            .start_port
            .checked_add(self.ports.max_ports)
            .is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "port range {}+{} exceeds 65535",
                self.ports.start_port, self.ports.max_ports
            )));
        }
        if !self.upstream.url_template.contains("{identifier}") {
            return Err(ConfigError::Invalid(
                "upstream.url_template must contain {identifier}".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
