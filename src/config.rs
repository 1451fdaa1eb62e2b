//! Configuration parsing and validation.
//!
//! ```toml
//! [client]
//! name = "provider-session"
//! health_check_seconds = 3
//!
//! [servers.files]
//! command = "files-provider"
//! args = ["--root", "/srv"]
//! env = { FILES_READONLY = "1" }
//! request_timeout_seconds = 30
//! shutdown_grace_seconds = 5
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::protocol::model::{
    ClientCapabilities, Implementation, RootsCapability, DEFAULT_PROTOCOL_VERSION,
};
use crate::{AppError, Result};

/// Launch parameters for one provider process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Executable to launch.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the provider.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory; inherits the host's when absent.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Keep the full host environment instead of the allowlist.
    #[serde(default)]
    pub inherit_env: bool,
    /// Default per-request deadline.
    #[serde(
        rename = "request_timeout_seconds",
        default = "default_request_timeout",
        deserialize_with = "de_seconds"
    )]
    pub request_timeout: Duration,
    /// Time allowed between interrupt and force-kill on close.
    #[serde(
        rename = "shutdown_grace_seconds",
        default = "default_shutdown_grace",
        deserialize_with = "de_seconds"
    )]
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Launch parameters for `command` with every knob at its default.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            inherit_env: false,
            request_timeout: default_request_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }

    /// Replace the argument list.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default per-request deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn validate(&mut self, name: &str) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(AppError::Config(format!(
                "servers.{name}.command must not be empty"
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(AppError::Config(format!(
                "servers.{name}.request_timeout_seconds must be greater than zero"
            )));
        }
        if let Some(dir) = &self.workdir {
            let canonical = dir.canonicalize().map_err(|err| {
                AppError::Config(format!("servers.{name}.workdir invalid: {err}"))
            })?;
            self.workdir = Some(canonical);
        }
        Ok(())
    }
}

/// Identity and capabilities this client presents during `initialize`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Client name reported in `clientInfo`.
    #[serde(default = "default_client_name")]
    pub name: String,
    /// Client version reported in `clientInfo`.
    #[serde(default = "default_client_version")]
    pub version: String,
    /// Protocol revision requested from providers.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Advertise the `roots` capability.
    #[serde(default)]
    pub roots: bool,
    /// Advertise the `sampling` capability.
    #[serde(default)]
    pub sampling: bool,
    /// Deadline for each session's ping during a manager health check.
    #[serde(
        rename = "health_check_seconds",
        default = "default_health_check",
        deserialize_with = "de_seconds"
    )]
    pub health_check_timeout: Duration,
}

impl ClientConfig {
    /// `clientInfo` payload.
    #[must_use]
    pub fn implementation(&self) -> Implementation {
        Implementation {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    /// `capabilities` payload.
    #[must_use]
    pub fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            sampling: self.sampling.then(|| serde_json::json!({})),
            roots: self.roots.then(RootsCapability::default),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
            protocol_version: default_protocol_version(),
            roots: false,
            sampling: false,
            health_check_timeout: default_health_check(),
        }
    }
}

/// Top-level configuration parsed from a TOML file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Client identity and capabilities.
    #[serde(default)]
    pub client: ClientConfig,
    /// Providers keyed by registration name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.client.name.trim().is_empty() {
            return Err(AppError::Config("client.name must not be empty".into()));
        }
        if self.client.health_check_timeout.is_zero() {
            return Err(AppError::Config(
                "client.health_check_seconds must be greater than zero".into(),
            ));
        }
        for (name, server) in &mut self.servers {
            server.validate(name)?;
        }
        Ok(())
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_health_check() -> Duration {
    Duration::from_secs(3)
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").into()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.into()
}

/// Read a non-negative, possibly fractional, number of seconds.
fn de_seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
