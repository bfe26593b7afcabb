//! Configuration parsing and validation for chatrelay.
//!
//! Configuration comes from an optional TOML file layered over environment
//! variables. The file may reference the environment with `${VAR}`; fields it
//! leaves out fall back to the conventional variables `OPENROUTER_API_KEY`,
//! `SITE_URL` and `SITE_NAME`.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
/// Environment variable holding the calling site's URL (sent as `HTTP-Referer`).
pub const SITE_URL_ENV: &str = "SITE_URL";
/// Environment variable holding the app name (sent as `X-Title`).
pub const SITE_NAME_ENV: &str = "SITE_NAME";

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:3000")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How the upstream API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was read from the conventional env var (holds var name)
    Environment(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Environment(var) => write!(f, "environment ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Upstream provider configuration: endpoint, identity and decoding parameters.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the chat-completions API (e.g., "https://openrouter.ai/api/v1")
    pub base_url: String,
    /// Bearer token; absent keys surface as the provider's 401 on first call
    pub api_key: Option<ApiKey>,
    /// Model identifier sent with every request
    pub model: String,
    /// Sent as `HTTP-Referer`
    pub site_url: Option<String>,
    /// Sent as `X-Title`
    pub site_name: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    /// TCP connect timeout for the upstream client
    pub connect_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "deepseek/deepseek-r1:free".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_penalty() -> Option<f32> {
    Some(0.1)
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Admission control window.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Length of the trailing window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> usize {
    50
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
        }
    }
}

/// Retry policy for upstream 429 responses.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level for the chatrelay target (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for field '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Raw upstream section deserialized directly from TOML.
/// String fields may contain `${VAR}` references not yet expanded.
#[derive(Debug, Deserialize)]
pub struct RawUpstreamConfig {
    #[serde(default = "default_base_url")]
    base_url: String,
    api_key: Option<String>,
    #[serde(default = "default_model")]
    model: String,
    site_url: Option<String>,
    site_name: Option<String>,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_penalty")]
    presence_penalty: Option<f32>,
    #[serde(default = "default_penalty")]
    frequency_penalty: Option<f32>,
    #[serde(default = "default_connect_timeout_secs")]
    connect_timeout_secs: u64,
}

impl Default for RawUpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            site_url: None,
            site_name: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            presence_penalty: default_penalty(),
            frequency_penalty: default_penalty(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Raw configuration deserialized directly from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    upstream: RawUpstreamConfig,
    #[serde(default)]
    rate_limit: RateLimitConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in '{}')",
                var_name, field
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Resolve an optional string field: expand `${VAR}` if present in the file,
/// otherwise fall back to the conventional env var.
fn resolve_field<F>(
    raw: Option<String>,
    field: &str,
    convention_var: &str,
    lookup: &F,
) -> Result<Option<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match raw {
        Some(value) => expand_env_vars_with(&value, field, lookup).map(Some),
        None => Ok(lookup(convention_var).filter(|v| !v.is_empty())),
    }
}

impl Config {
    /// Convert raw (deserialized) config to final config, resolving env references
    /// through `lookup`.
    ///
    /// For the API key:
    /// - If `api_key` contains `${VAR}`: expand, source = `EnvExpanded`
    /// - If `api_key` is a literal string: wrap directly, source = `Literal`
    /// - If `api_key` is absent: read `OPENROUTER_API_KEY`,
    ///   source = `Environment(var)` or `KeySource::None`
    pub fn from_raw_with<F>(raw: RawConfig, lookup: F) -> Result<(Self, KeySource), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let RawConfig {
            server,
            upstream,
            rate_limit,
            retry,
            logging,
        } = raw;

        let (api_key, key_source) = match upstream.api_key {
            Some(ref raw_key) if raw_key.contains("${") => {
                let expanded = expand_env_vars_with(raw_key, "upstream.api_key", &lookup)?;
                (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
            }
            Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
            None => match lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
                Some(value) => (
                    Some(ApiKey::from(value)),
                    KeySource::Environment(API_KEY_ENV.to_string()),
                ),
                None => (None, KeySource::None),
            },
        };

        let site_url = resolve_field(upstream.site_url, "upstream.site_url", SITE_URL_ENV, &lookup)?;
        let site_name = resolve_field(
            upstream.site_name,
            "upstream.site_name",
            SITE_NAME_ENV,
            &lookup,
        )?;

        let config = Config {
            server,
            upstream: UpstreamConfig {
                base_url: upstream.base_url,
                api_key,
                model: upstream.model,
                site_url,
                site_name,
                temperature: upstream.temperature,
                max_tokens: upstream.max_tokens,
                presence_penalty: upstream.presence_penalty,
                frequency_penalty: upstream.frequency_penalty,
                connect_timeout_secs: upstream.connect_timeout_secs,
            },
            rate_limit,
            retry,
            logging,
        };
        config.validate()?;

        Ok((config, key_source))
    }

    /// Convert raw config using real environment variables.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, KeySource), ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Build a configuration purely from defaults and the environment.
    pub fn from_env() -> Result<(Self, KeySource), ConfigError> {
        Self::from_raw(RawConfig::default())
    }

    /// Parse configuration from a TOML string, resolving env references through `lookup`.
    pub fn parse_str_with<F>(content: &str, lookup: F) -> Result<(Self, KeySource), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        Self::from_raw_with(raw, lookup)
    }

    /// Load configuration from a TOML file with environment variable expansion.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<(Self, KeySource), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str_with(&content, |name| std::env::var(name).ok())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "upstream.model must not be empty".to_string(),
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.window_ms must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let (config, source) = Config::from_raw_with(RawConfig::default(), no_env).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:3000");
        assert_eq!(config.upstream.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.upstream.model, "deepseek/deepseek-r1:free");
        assert_eq!(config.upstream.temperature, 0.7);
        assert_eq!(config.upstream.max_tokens, 1000);
        assert_eq!(config.upstream.presence_penalty, Some(0.1));
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_requests, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!(config.upstream.api_key.is_none());
        assert_eq!(source, KeySource::None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:8080"

            [upstream]
            base_url = "https://example.com/v1"
            api_key = "sk-or-literal"
            model = "test/model"
            site_url = "https://chat.example.com"
            site_name = "Example Chat"
            temperature = 0.2
            max_tokens = 256
            presence_penalty = 0.0

            [rate_limit]
            window_ms = 1000
            max_requests = 5

            [retry]
            max_attempts = 4
            base_delay_ms = 50

            [logging]
            level = "debug"
        "#;

        let (config, source) = Config::parse_str_with(toml, no_env).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.upstream.model, "test/model");
        assert_eq!(config.upstream.site_name.as_deref(), Some("Example Chat"));
        assert_eq!(config.upstream.max_tokens, 256);
        assert_eq!(config.upstream.presence_penalty, Some(0.0));
        assert_eq!(config.upstream.frequency_penalty, Some(0.1));
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(source, KeySource::Literal);
        assert_eq!(
            config.upstream.api_key.as_ref().unwrap().expose_secret(),
            "sk-or-literal"
        );
    }

    #[test]
    fn test_api_key_debug_redaction() {
        let key = ApiKey::from("sk-or-super-secret");
        let debug_output = format!("{:?}", key);
        assert_eq!(debug_output, "[REDACTED]");
        assert!(!debug_output.contains("super-secret"));
    }

    #[test]
    fn test_api_key_serialize_redaction() {
        let key = ApiKey::from("real-secret-value");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
    }

    #[test]
    fn test_upstream_config_debug_redaction() {
        let toml = r#"
            [upstream]
            api_key = "sk-or-ABCD1234secret"
        "#;
        let (config, _) = Config::parse_str_with(toml, no_env).unwrap();
        let debug = format!("{:?}", config.upstream);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-or-ABCD1234secret"));
    }

    #[test]
    fn test_key_from_environment() {
        let lookup = |name: &str| match name {
            API_KEY_ENV => Some("sk-or-from-env".to_string()),
            SITE_URL_ENV => Some("https://site.test".to_string()),
            SITE_NAME_ENV => Some("Site".to_string()),
            _ => None,
        };
        let (config, source) = Config::from_raw_with(RawConfig::default(), lookup).unwrap();
        assert_eq!(source, KeySource::Environment(API_KEY_ENV.to_string()));
        assert_eq!(
            config.upstream.api_key.as_ref().unwrap().expose_secret(),
            "sk-or-from-env"
        );
        assert_eq!(config.upstream.site_url.as_deref(), Some("https://site.test"));
        assert_eq!(config.upstream.site_name.as_deref(), Some("Site"));
    }

    #[test]
    fn test_empty_env_key_treated_as_missing() {
        let lookup = |name: &str| (name == API_KEY_ENV).then(String::new);
        let (config, source) = Config::from_raw_with(RawConfig::default(), lookup).unwrap();
        assert!(config.upstream.api_key.is_none());
        assert_eq!(source, KeySource::None);
    }

    #[test]
    fn test_key_env_expanded() {
        let toml = r#"
            [upstream]
            api_key = "${MY_ROUTER_KEY}"
            site_name = "${APP}-prod"
        "#;
        let lookup = |name: &str| match name {
            "MY_ROUTER_KEY" => Some("sk-or-expanded".to_string()),
            "APP" => Some("chat".to_string()),
            _ => None,
        };
        let (config, source) = Config::parse_str_with(toml, lookup).unwrap();
        assert_eq!(source, KeySource::EnvExpanded);
        assert_eq!(
            config.upstream.api_key.as_ref().unwrap().expose_secret(),
            "sk-or-expanded"
        );
        assert_eq!(config.upstream.site_name.as_deref(), Some("chat-prod"));
    }

    #[test]
    fn test_missing_referenced_var_fails() {
        let toml = r#"
            [upstream]
            api_key = "${DEFINITELY_MISSING}"
        "#;
        let err = Config::parse_str_with(toml, no_env).unwrap_err().to_string();
        assert!(err.contains("DEFINITELY_MISSING"), "{}", err);
        assert!(err.contains("upstream.api_key"), "{}", err);
    }

    #[test]
    fn test_expand_multiple_vars() {
        let lookup = |name: &str| match name {
            "SCHEME" => Some("https".to_string()),
            "HOST" => Some("example.com".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("${SCHEME}://${HOST}/v1", "test", lookup).unwrap();
        assert_eq!(result, "https://example.com/v1");
    }

    #[test]
    fn test_expand_no_vars_passthrough() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let result = expand_env_vars_with("$NOT_A_VAR", "test", lookup).unwrap();
        assert_eq!(result, "$NOT_A_VAR");
    }

    #[test]
    fn test_expand_unclosed_brace_fails() {
        let result = expand_env_vars_with("${UNCLOSED", "test", no_env);
        let err = result.unwrap_err().to_string().to_lowercase();
        assert!(err.contains("unclosed"));
    }

    #[test]
    fn test_expand_empty_var_name_fails() {
        let result = expand_env_vars_with("${}", "test", no_env);
        let err = result.unwrap_err().to_string().to_lowercase();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        for toml in [
            "[rate_limit]\nmax_requests = 0",
            "[rate_limit]\nwindow_ms = 0",
            "[retry]\nmax_attempts = 0",
            "[upstream]\nmodel = \"\"",
            "[upstream]\nbase_url = \" \"",
        ] {
            let result = Config::parse_str_with(toml, no_env);
            assert!(
                matches!(result, Err(ConfigError::Validation(_))),
                "expected validation error for {:?}",
                toml
            );
        }
    }
}
