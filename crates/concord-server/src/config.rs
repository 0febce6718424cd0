//! Server configuration.
//!
//! Configuration is layered:
//! - built-in defaults
//! - a TOML file (`--config <path>`, or the first of the search paths)
//! - environment variables (`CONCORD__PORT`, `CONCORD__ROUTER__CALL_TIMEOUT_MS`, ...)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use concord_core::{RouterConfig, TicketAuthenticator};
use concord_protocol::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};

const SEARCH_PATHS: [&str; 3] = [
    "concord.toml",
    "/etc/concord/concord.toml",
    "~/.config/concord/concord.toml",
];

const ENV_PREFIX: &str = "CONCORD";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for HTTP and WebSocket.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub router: RouterSection,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Enabled serializers: `json`, `msgpack`.
    #[serde(default = "default_serializers")]
    pub serializers: Vec<String>,

    /// Port for WAMP RawSocket over TCP. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rawsocket_port: Option<u16>,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Router behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_ms: u64,

    /// Default call timeout; 0 disables it.
    #[serde(default)]
    pub call_timeout_ms: u64,

    /// Expose the `wamp.session.*` and `wamp.registration.*` meta API.
    #[serde(default = "default_true")]
    pub meta_api: bool,
}

/// A ticket principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub authid: String,
    pub ticket: String,
    #[serde(default = "default_role")]
    pub role: String,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require WAMP-Ticket authentication.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub principals: Vec<Principal>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_serializers() -> Vec<String> {
    vec!["json".to_string(), "msgpack".to_string()]
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_auth_timeout() -> u64 {
    30_000
}

fn default_role() -> String {
    "user".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            router: RouterSection::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            serializers: default_serializers(),
            rawsocket_port: None,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            auth_timeout_ms: default_auth_timeout(),
            call_timeout_ms: 0,
            meta_api: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// First existing file among the search paths.
fn find_config_file() -> Option<PathBuf> {
    SEARCH_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
        .find(|path| path.exists())
}

impl Config {
    /// Load configuration from a file (explicit or found on the search
    /// path) with environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let file = match explicit {
            Some(path) => Some(PathBuf::from(
                shellexpand::tilde(&path.to_string_lossy()).into_owned(),
            )),
            None => find_config_file(),
        };

        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            tracing::info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Toml)
                    .required(explicit.is_some()),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("transport.serializers"),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse configuration")
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    /// Address for the HTTP/WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Address for the RawSocket listener, if enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn rawsocket_addr(&self) -> Result<Option<SocketAddr>> {
        self.transport
            .rawsocket_port
            .map(|port| {
                format!("{}:{}", self.host, port)
                    .parse()
                    .with_context(|| format!("Invalid RawSocket address {}:{}", self.host, port))
            })
            .transpose()
    }

    /// Binding names for the enabled serializers.
    ///
    /// # Errors
    ///
    /// Returns an error on an unknown serializer name.
    pub fn bindings(&self) -> Result<Vec<String>> {
        self.transport
            .serializers
            .iter()
            .map(|name| match name.as_str() {
                "json" | "msgpack" => Ok(PROTOCOL_VERSION.subprotocol(name)),
                other => anyhow::bail!("Unknown serializer '{other}'"),
            })
            .collect()
    }

    /// Router settings.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            handshake_timeout: Duration::from_millis(self.router.handshake_timeout_ms),
            auth_timeout: Duration::from_millis(self.router.auth_timeout_ms),
            call_timeout: (self.router.call_timeout_ms > 0)
                .then(|| Duration::from_millis(self.router.call_timeout_ms)),
            meta_api: self.router.meta_api,
            ..RouterConfig::default()
        }
    }

    /// The ticket authenticator, if authentication is enabled.
    #[must_use]
    pub fn authenticator(&self) -> Option<TicketAuthenticator> {
        if !self.auth.enabled {
            return None;
        }
        let mut authenticator = TicketAuthenticator::new();
        for principal in &self.auth.principals {
            authenticator.add_principal(
                principal.authid.as_str(),
                principal.ticket.as_str(),
                principal.role.as_str(),
            );
        }
        Some(authenticator)
    }
}
