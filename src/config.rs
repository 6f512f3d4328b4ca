//! Gateway configuration, loaded once from the environment at boot.

use std::path::PathBuf;
use std::time::Duration;

/// Minimum length of the credential-vault master key.
pub const MIN_MASTER_KEY_LEN: usize = 32;

/// Gateway configuration.
///
/// Every knob is environment-driven (see the README table); the struct is
/// built once in the supervisor and passed explicitly to the components that
/// need it. There is no ambient global.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token gating every non-health endpoint. Required.
    pub api_token: String,

    /// TCP port for the HTTP/WebSocket listener.
    pub port: u16,

    /// Bind address for the listener.
    pub host: String,

    /// Default tracing filter directive (e.g. "info", "aperture=debug").
    pub log_level: String,

    /// Hard cap on concurrently live sessions.
    pub max_concurrent_sessions: usize,

    /// Idle timeout after which a session is ended.
    pub session_idle_timeout: Duration,

    /// Maximum inbound frame size in bytes, measured pre-parse.
    pub max_message_size_bytes: usize,

    /// Timeout applied to runtime operations that await backend completion.
    pub rpc_request_timeout: Duration,

    /// Token-bucket capacity per remote within one rate window.
    pub rate_limit_max: u32,

    /// Rate-limit window length.
    pub rate_limit_window: Duration,

    /// Hosted mode: no human is available for interactive/browser logins.
    pub hosted_mode: bool,

    /// Whether backends may attempt interactive auth flows.
    pub allow_interactive_auth: bool,

    /// Vault master key. `None` disables the vault (inline keys only).
    pub credentials_master_key: Option<String>,

    /// Path of the encrypted credential file.
    pub credentials_store_path: PathBuf,

    /// Path of the SQLite database.
    pub database_path: PathBuf,

    /// Claude SDK binary. Resolved on `PATH` when not absolute.
    pub claude_sdk_bin: PathBuf,

    /// Pi SDK binary. Resolved on `PATH` when not absolute.
    pub pi_sdk_bin: PathBuf,

    /// Deadline for backend disposal during shutdown or terminate.
    pub shutdown_deadline: Duration,
}

/// A configuration problem that prevents startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The gateway bearer token is not set.
    #[error("APERTURE_API_TOKEN is required but not set")]
    MissingApiToken,

    /// An environment variable holds a value that does not parse.
    #[error("invalid value for {name}: '{value}'")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `APERTURE_API_TOKEN` is absent or any numeric
    /// variable fails to parse. A short master key is a warning, not an
    /// error: the vault is disabled and inline keys still work.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    ///
    /// The indirection keeps the parsing logic testable without mutating
    /// process-wide environment state.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_token = lookup("APERTURE_API_TOKEN")
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingApiToken)?;

        let credentials_master_key = match lookup("CREDENTIALS_MASTER_KEY") {
            Some(key) if key.len() >= MIN_MASTER_KEY_LEN => Some(key),
            Some(key) if !key.is_empty() => {
                tracing::warn!(
                    length = key.len(),
                    minimum = MIN_MASTER_KEY_LEN,
                    "CREDENTIALS_MASTER_KEY is too short; credential vault disabled"
                );
                None
            }
            _ => None,
        };

        let base_dir = default_base_dir();

        Ok(Self {
            api_token,
            port: parse_var(lookup, "PORT", 8080)?,
            host: string_var(lookup, "HOST", "0.0.0.0"),
            log_level: string_var(lookup, "LOG_LEVEL", "info"),
            max_concurrent_sessions: parse_var(lookup, "MAX_CONCURRENT_SESSIONS", 50)?,
            session_idle_timeout: Duration::from_millis(parse_var(
                lookup,
                "SESSION_IDLE_TIMEOUT_MS",
                600_000,
            )?),
            max_message_size_bytes: parse_var(lookup, "MAX_MESSAGE_SIZE_BYTES", 262_144)?,
            rpc_request_timeout: Duration::from_millis(parse_var(
                lookup,
                "RPC_REQUEST_TIMEOUT_MS",
                300_000,
            )?),
            rate_limit_max: parse_var(lookup, "RATE_LIMIT_MAX", 100)?,
            rate_limit_window: Duration::from_millis(parse_var(
                lookup,
                "RATE_LIMIT_WINDOW_MS",
                60_000,
            )?),
            hosted_mode: parse_var(lookup, "HOSTED_MODE", true)?,
            allow_interactive_auth: parse_var(lookup, "ALLOW_INTERACTIVE_AUTH", false)?,
            credentials_master_key,
            credentials_store_path: lookup("CREDENTIALS_STORE_PATH")
                .map_or_else(|| base_dir.join("credentials.bin"), PathBuf::from),
            database_path: lookup("APERTURE_DB_PATH")
                .map_or_else(|| base_dir.join("aperture.sqlite"), PathBuf::from),
            claude_sdk_bin: PathBuf::from(string_var(lookup, "CLAUDE_SDK_BIN", "claude")),
            pi_sdk_bin: PathBuf::from(string_var(lookup, "PI_SDK_BIN", "pi")),
            shutdown_deadline: Duration::from_millis(parse_var(
                lookup,
                "SHUTDOWN_DEADLINE_MS",
                10_000,
            )?),
        })
    }

    /// Whether the credential vault is enabled.
    #[must_use]
    pub fn vault_enabled(&self) -> bool {
        self.credentials_master_key.is_some()
    }

    /// Socket address string for the listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn string_var(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn parse_var<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        _ => Ok(default),
    }
}

/// Base directory for gateway state (`~/.aperture`, or the working directory
/// when no home is resolvable).
fn default_base_dir() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from(".aperture"), |h| h.join(".aperture"))
}
