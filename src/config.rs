//! Application configuration management.
//!
//! Each role (server, client) gets one validated configuration object built
//! from four layers, later layers overriding earlier ones:
//!
//! 1. Built-in defaults, selected by [`Profile`]
//! 2. Environment variables prefixed with `SCANRELAY_` (a `.env` file is loaded first)
//! 3. An optional JSON config file (`SCANRELAY_CONFIG_FILE` or [`ConfigLoader::with_file`])
//! 4. Explicit overrides passed by the caller
//!
//! Environment variables are deserialized with `envy`, the file with `serde_json`.
//! Secret-shaped values are wrapped in [`Secret`] so that `Debug`, `Display` and
//! `Serialize` never print them.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize, Serializer};
use url::Url;

use crate::{
    models::{api_key::KeyEnvironment, command::ExecutionMode},
    storage::{PoolSettings, RetryPolicy},
};

/// Prefix shared by every environment variable the loader reads.
pub const ENV_PREFIX: &str = "SCANRELAY_";

const CONFIG_FILE_VAR: &str = "SCANRELAY_CONFIG_FILE";
const MIN_AUTH_SECRET_LEN: usize = 32;
const MAX_POOL_SIZE: usize = 1024;
const MIN_DURATION_MS: u64 = 1;
const MAX_DURATION_MS: u64 = 60 * 60 * 1000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("failed to read config file {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("setting `{field}` = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("setting `{field}` is not a valid URI: {reason}")]
    InvalidUri { field: &'static str, reason: String },

    #[error("setting `{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A value that must never appear in logs or error messages.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the wrapped value. Callers must not log the result.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> Serialize for Secret<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

/// Named deployment profile. Profiles only change defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Dev,
    Integration,
    Prod,
}

impl Profile {
    /// API-key environment that keys must carry under this profile.
    pub fn key_environment(self) -> KeyEnvironment {
        match self {
            Profile::Dev => KeyEnvironment::Dev,
            Profile::Integration => KeyEnvironment::Int,
            Profile::Prod => KeyEnvironment::Prod,
        }
    }
}

impl FromStr for Profile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Profile::Dev),
            "integration" | "int" => Ok(Profile::Integration),
            "prod" | "production" => Ok(Profile::Prod),
            other => Err(ConfigError::Invalid {
                field: "profile",
                reason: format!("unknown profile `{other}`"),
            }),
        }
    }
}

/// Server-role settings as they appear in one configuration layer.
///
/// Every field is optional: a layer only sets what it knows about.
/// Durations are expressed in milliseconds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerOverrides {
    pub profile: Option<Profile>,
    pub environment: Option<KeyEnvironment>,
    pub bind_addr: Option<String>,
    pub database_uri: Option<Secret<String>>,
    pub auth_secret: Option<Secret<String>>,
    pub api_keys_file: Option<PathBuf>,
    pub max_pool_size: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub statement_timeout_ms: Option<u64>,
    pub unhealthy_threshold: Option<u32>,
    pub retry_max_attempts: Option<u32>,
    pub retry_initial_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_max_total_wait_ms: Option<u64>,
    pub chunk_size: Option<usize>,
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_refill_per_sec: Option<f64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub replay_buffer_messages: Option<usize>,
    pub replay_window_ms: Option<u64>,
    pub connection_queue: Option<usize>,
    pub operation_timeout_ms: Option<u64>,
    pub operation_retention_ms: Option<u64>,
    pub progress_buffer: Option<usize>,
    pub scan_command: Option<String>,
    pub generate_iac_command: Option<String>,
    pub generate_spec_command: Option<String>,
    pub deploy_command: Option<String>,
}

/// Client-role settings as they appear in one configuration layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientOverrides {
    pub profile: Option<Profile>,
    pub mode: Option<ExecutionMode>,
    pub server_url: Option<String>,
    pub api_key: Option<Secret<String>>,
    pub request_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub progress_buffer: Option<usize>,
    pub operation_timeout_ms: Option<u64>,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub profile: Profile,
    /// API keys must carry this environment prefix.
    pub environment: KeyEnvironment,
    pub bind_addr: String,
    pub database_uri: Secret<String>,
    /// HMAC key material used to hash and verify API keys.
    pub auth_secret: Secret<String>,
    pub api_keys_file: Option<PathBuf>,
    pub max_pool_size: usize,
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    /// Upper bound on one batch against the database.
    pub statement_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: f64,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub replay_buffer_messages: usize,
    pub replay_window: Duration,
    pub connection_queue: usize,
    pub operation_timeout: Duration,
    pub operation_retention: Duration,
    pub progress_buffer: usize,
    pub scan_command: Option<String>,
    pub generate_iac_command: Option<String>,
    pub generate_spec_command: Option<String>,
    pub deploy_command: Option<String>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ClientConfig {
    pub profile: Profile,
    /// Mode used when the caller does not pass one explicitly.
    pub mode: ExecutionMode,
    pub server_url: Option<String>,
    pub api_key: Option<Secret<String>>,
    pub request_timeout: Duration,
    /// Per-read wait on the progress stream. Cancellation is checked between reads.
    pub read_timeout: Duration,
    /// Silence on the progress stream longer than this is treated as a disconnect.
    pub idle_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub progress_buffer: usize,
    pub operation_timeout: Duration,
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Apply `Some` fields of a layer on top of the current value.
macro_rules! layer {
    ($target:expr, $layer:expr, { $($field:ident),* $(,)? }) => {
        $( if let Some(value) = $layer.$field.clone() { $target.$field = value.into(); } )*
    };
}

macro_rules! layer_ms {
    ($target:expr, $layer:expr, { $($field:ident => $dest:ident),* $(,)? }) => {
        $( if let Some(value) = $layer.$field { $target.$dest = ms(value); } )*
    };
}

impl ServerConfig {
    /// Built-in defaults for a profile. Secrets and the database URI are empty
    /// and must be provided by a later layer (except the dev profile's database,
    /// which defaults to the in-memory backend).
    pub fn defaults(profile: Profile) -> Self {
        let (pool, acquire, op_timeout) = match profile {
            Profile::Dev => (4, 2_000, 10 * 60_000),
            Profile::Integration => (10, 5_000, 30 * 60_000),
            Profile::Prod => (32, 10_000, 60 * 60_000),
        };
        let database_uri = match profile {
            Profile::Dev => "memory://local".to_string(),
            Profile::Integration | Profile::Prod => String::new(),
        };

        Self {
            profile,
            environment: profile.key_environment(),
            bind_addr: "0.0.0.0:8080".to_string(),
            database_uri: Secret::new(database_uri),
            auth_secret: Secret::new(String::new()),
            api_keys_file: None,
            max_pool_size: pool,
            acquire_timeout: ms(acquire),
            health_check_interval: ms(30_000),
            probe_timeout: ms(2_000),
            statement_timeout: ms(30_000),
            unhealthy_threshold: 3,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: ms(100),
                max_delay: ms(2_000),
                max_total_wait: ms(10_000),
            },
            chunk_size: 500,
            rate_limit_capacity: 60,
            rate_limit_refill_per_sec: 1.0,
            heartbeat_interval: ms(15_000),
            idle_timeout: ms(45_000),
            replay_buffer_messages: 1_024,
            replay_window: ms(5 * 60_000),
            connection_queue: 256,
            operation_timeout: ms(op_timeout),
            operation_retention: ms(15 * 60_000),
            progress_buffer: 128,
            scan_command: None,
            generate_iac_command: None,
            generate_spec_command: None,
            deploy_command: None,
        }
    }

    fn apply(&mut self, layer: &ServerOverrides) {
        layer!(self, layer, {
            environment, bind_addr, database_uri, auth_secret, max_pool_size,
            unhealthy_threshold, chunk_size, rate_limit_capacity,
            rate_limit_refill_per_sec, replay_buffer_messages, connection_queue,
            progress_buffer,
        });
        if let Some(path) = layer.api_keys_file.clone() {
            self.api_keys_file = Some(path);
        }
        for (dest, value) in [
            (&mut self.scan_command, &layer.scan_command),
            (&mut self.generate_iac_command, &layer.generate_iac_command),
            (&mut self.generate_spec_command, &layer.generate_spec_command),
            (&mut self.deploy_command, &layer.deploy_command),
        ] {
            if value.is_some() {
                dest.clone_from(value);
            }
        }
        if let Some(attempts) = layer.retry_max_attempts {
            self.retry.max_attempts = attempts;
        }
        layer_ms!(self.retry, layer, {
            retry_initial_delay_ms => initial_delay,
            retry_max_delay_ms => max_delay,
            retry_max_total_wait_ms => max_total_wait,
        });
        layer_ms!(self, layer, {
            acquire_timeout_ms => acquire_timeout,
            health_check_interval_ms => health_check_interval,
            probe_timeout_ms => probe_timeout,
            statement_timeout_ms => statement_timeout,
            heartbeat_interval_ms => heartbeat_interval,
            idle_timeout_ms => idle_timeout,
            replay_window_ms => replay_window,
            operation_timeout_ms => operation_timeout,
            operation_retention_ms => operation_retention,
        });
    }

    /// Check required fields, numeric bounds and URI shapes.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uri = self.database_uri.expose();
        if uri.trim().is_empty() {
            return Err(ConfigError::Missing("database_uri"));
        }
        let parsed = Url::parse(uri).map_err(|e| ConfigError::InvalidUri {
            field: "database_uri",
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql" | "memory") {
            return Err(ConfigError::InvalidUri {
                field: "database_uri",
                reason: format!("unsupported scheme `{}`", parsed.scheme()),
            });
        }

        let secret = self.auth_secret.expose();
        if secret.is_empty() {
            return Err(ConfigError::Missing("auth_secret"));
        }
        if secret.len() < MIN_AUTH_SECRET_LEN {
            return Err(ConfigError::Invalid {
                field: "auth_secret",
                reason: format!("must be at least {MIN_AUTH_SECRET_LEN} bytes"),
            });
        }

        check_range("max_pool_size", self.max_pool_size as u64, 1, MAX_POOL_SIZE as u64)?;
        check_range("chunk_size", self.chunk_size as u64, 1, 100_000)?;
        check_range("unhealthy_threshold", self.unhealthy_threshold.into(), 1, 100)?;
        check_range("retry_max_attempts", self.retry.max_attempts.into(), 1, 20)?;
        check_range("rate_limit_capacity", self.rate_limit_capacity.into(), 1, 1_000_000)?;
        check_range("replay_buffer_messages", self.replay_buffer_messages as u64, 1, 1_000_000)?;
        check_range("connection_queue", self.connection_queue as u64, 1, 65_536)?;
        check_range("progress_buffer", self.progress_buffer as u64, 1, 65_536)?;
        if !(self.rate_limit_refill_per_sec.is_finite() && self.rate_limit_refill_per_sec > 0.0) {
            return Err(ConfigError::Invalid {
                field: "rate_limit_refill_per_sec",
                reason: "must be a positive number".to_string(),
            });
        }

        for (field, value) in [
            ("acquire_timeout_ms", self.acquire_timeout),
            ("health_check_interval_ms", self.health_check_interval),
            ("probe_timeout_ms", self.probe_timeout),
            ("statement_timeout_ms", self.statement_timeout),
            ("retry_initial_delay_ms", self.retry.initial_delay),
            ("retry_max_delay_ms", self.retry.max_delay),
            ("retry_max_total_wait_ms", self.retry.max_total_wait),
            ("heartbeat_interval_ms", self.heartbeat_interval),
            ("idle_timeout_ms", self.idle_timeout),
            ("replay_window_ms", self.replay_window),
            ("operation_retention_ms", self.operation_retention),
        ] {
            check_duration(field, value)?;
        }
        // operation_timeout may exceed an hour; only forbid zero.
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "operation_timeout_ms",
                value: 0,
                min: MIN_DURATION_MS,
                max: u64::MAX,
            });
        }
        if self.idle_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid {
                field: "idle_timeout_ms",
                reason: "must be longer than heartbeat_interval_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Database URI with any password removed, safe for logs.
    pub fn redacted_database_uri(&self) -> String {
        redact_uri(self.database_uri.expose())
    }

    /// Connection-pool settings derived from this configuration.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.max_pool_size,
            acquire_timeout: self.acquire_timeout,
            health_check_interval: self.health_check_interval,
            probe_timeout: self.probe_timeout,
            statement_timeout: self.statement_timeout,
            unhealthy_threshold: self.unhealthy_threshold,
            retry: self.retry,
        }
    }
}

impl ClientConfig {
    pub fn defaults(profile: Profile) -> Self {
        let (request, idle) = match profile {
            Profile::Dev => (10_000, 30_000),
            Profile::Integration => (15_000, 45_000),
            Profile::Prod => (30_000, 60_000),
        };
        Self {
            profile,
            mode: ExecutionMode::Local,
            server_url: None,
            api_key: None,
            request_timeout: ms(request),
            read_timeout: ms(1_000),
            idle_timeout: ms(idle),
            reconnect_attempts: 5,
            reconnect_delay: ms(500),
            progress_buffer: 128,
            operation_timeout: ms(60 * 60_000),
        }
    }

    fn apply(&mut self, layer: &ClientOverrides) {
        layer!(self, layer, { mode, reconnect_attempts, progress_buffer });
        if let Some(url) = layer.server_url.clone() {
            self.server_url = Some(url);
        }
        if let Some(key) = layer.api_key.clone() {
            self.api_key = Some(key);
        }
        layer_ms!(self, layer, {
            request_timeout_ms => request_timeout,
            read_timeout_ms => read_timeout,
            idle_timeout_ms => idle_timeout,
            reconnect_delay_ms => reconnect_delay,
            operation_timeout_ms => operation_timeout,
        });
    }

    /// Validate the client configuration.
    ///
    /// Remote settings are only required when the default mode is remote; a
    /// local-default client may still be given remote settings for explicit
    /// per-call remote execution.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.server_url {
            let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidUri {
                field: "server_url",
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidUri {
                    field: "server_url",
                    reason: format!("unsupported scheme `{}`", parsed.scheme()),
                });
            }
        }
        if self.mode == ExecutionMode::Remote {
            if self.server_url.is_none() {
                return Err(ConfigError::Missing("server_url"));
            }
            if self.api_key.as_ref().is_none_or(|k| k.expose().is_empty()) {
                return Err(ConfigError::Missing("api_key"));
            }
        }
        check_range("reconnect_attempts", self.reconnect_attempts.into(), 0, 100)?;
        check_range("progress_buffer", self.progress_buffer as u64, 1, 65_536)?;
        for (field, value) in [
            ("request_timeout_ms", self.request_timeout),
            ("read_timeout_ms", self.read_timeout),
            ("idle_timeout_ms", self.idle_timeout),
            ("reconnect_delay_ms", self.reconnect_delay),
        ] {
            check_duration(field, value)?;
        }
        if self.read_timeout > self.idle_timeout {
            return Err(ConfigError::Invalid {
                field: "read_timeout_ms",
                reason: "must not exceed idle_timeout_ms".to_string(),
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn check_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
    check_range(field, millis, MIN_DURATION_MS, MAX_DURATION_MS)
}

/// Strip the password from a URI. Unparseable input is fully redacted.
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                // Only fails for cannot-be-a-base URLs, which have no password.
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "[REDACTED]".to_string(),
    }
}

/// Layered configuration loader.
///
/// The environment is captured once at construction so that tests can supply
/// their own variables without touching the process environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    vars: Vec<(String, String)>,
    file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Capture the process environment, loading `.env` first if present.
    pub fn from_env() -> Self {
        // Missing .env is fine
        dotenvy::dotenv().ok();
        Self::with_vars(std::env::vars())
    }

    /// Use an explicit set of variables instead of the process environment.
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Vec<(String, String)> =
            vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let file = vars
            .iter()
            .find(|(k, _)| k == CONFIG_FILE_VAR)
            .map(|(_, v)| PathBuf::from(v));
        Self { vars, file }
    }

    /// Read the JSON config file at `path` as the file layer.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn env_layer<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let vars = self
            .vars
            .iter()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX) && k != CONFIG_FILE_VAR)
            .cloned();
        Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
    }

    fn file_layer<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        match &self.file {
            Some(path) => read_json(path),
            None => Ok(T::default()),
        }
    }

    /// Build and validate the server configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a layer cannot be read or the merged result
    /// fails validation.
    pub fn load_server(&self, overrides: ServerOverrides) -> Result<ServerConfig, ConfigError> {
        let env: ServerOverrides = self.env_layer()?;
        let file: ServerOverrides = self.file_layer()?;
        let profile = overrides
            .profile
            .or(file.profile)
            .or(env.profile)
            .unwrap_or_default();

        let mut config = ServerConfig::defaults(profile);
        for layer in [&env, &file, &overrides] {
            config.apply(layer);
        }
        config.validate()?;
        Ok(config)
    }

    /// Build and validate the client configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a layer cannot be read or the merged result
    /// fails validation.
    pub fn load_client(&self, overrides: ClientOverrides) -> Result<ClientConfig, ConfigError> {
        let env: ClientOverrides = self.env_layer()?;
        let file: ClientOverrides = self.file_layer()?;
        let profile = overrides
            .profile
            .or(file.profile)
            .or(env.profile)
            .unwrap_or_default();

        let mut config = ClientConfig::defaults(profile);
        for layer in [&env, &file, &overrides] {
            config.apply(layer);
        }
        config.validate()?;
        Ok(config)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
