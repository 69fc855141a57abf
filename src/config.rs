//! Configuration module for the Meteotemplate uploader.
//!
//! All options come from `METEOTEMPLATE_*` environment variables with
//! defaults matching the destination's documented behaviour. A missing
//! password is not an error here: the service decides to disable itself.

use std::env;
use std::time::Duration;

use reqwest::Url;

use crate::queue::DEFAULT_MAX_BACKLOG;

/// Default host used to build the ingest URL
const DEFAULT_HOST: &str = "localhost";

/// Path of the update script on a Meteotemplate server
const UPDATE_PATH: &str = "/plugins/api/update.php";

/// Meteotemplate re-aggregates into its database every 5 minutes
const DEFAULT_POST_INTERVAL_SECS: u64 = 300;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 600;

const DEFAULT_MAX_TRIES: u32 = 3;
const MAX_TRIES_LIMIT: u32 = 20;

const DEFAULT_RETRY_WAIT_SECS: u64 = 5;

const MAX_BACKLOG_LIMIT: usize = 100_000;

/// One year
const MAX_STALE_SECS: u64 = 31_536_000;

/// Which observation events feed the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Raw station packets
    Loop,
    /// Archive records
    Archive,
    Both,
}

impl Binding {
    pub fn accepts_loop(&self) -> bool {
        matches!(self, Binding::Loop | Binding::Both)
    }

    pub fn accepts_archive(&self) -> bool {
        matches!(self, Binding::Archive | Binding::Both)
    }
}

/// How records arriving faster than the post interval are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottlePolicy {
    /// Once the interval has passed, post only the most recent pending record
    Coalesce,
    /// Post every record, each one waiting for the interval
    Sequential,
}

/// Configuration for the uploader.
///
/// Settings are read from the environment by [`Config::from_env`]:
/// - `METEOTEMPLATE_PASSWORD`: update password (required to upload)
/// - `METEOTEMPLATE_HOST`: server host (default: localhost)
/// - `METEOTEMPLATE_SERVER_URL`: full update URL (default: http://HOST/plugins/api/update.php)
/// - `METEOTEMPLATE_POST_INTERVAL_SECS`: minimum seconds between posts (default: 300, 0 disables)
/// - `METEOTEMPLATE_STALE_SECS`: maximum record age in seconds, 1 to one year (default: unset)
/// - `METEOTEMPLATE_MAX_BACKLOG`: maximum pending records (default: 1000)
/// - `METEOTEMPLATE_TIMEOUT_SECS`: HTTP timeout per attempt (default: 60)
/// - `METEOTEMPLATE_MAX_TRIES`: attempts per record (default: 3)
/// - `METEOTEMPLATE_RETRY_WAIT_SECS`: seconds between attempts (default: 5)
/// - `METEOTEMPLATE_SKIP_UPLOAD`: dry run, never contact the server (default: false)
/// - `METEOTEMPLATE_BINDING`: loop | archive | both (default: archive)
/// - `METEOTEMPLATE_THROTTLE_POLICY`: coalesce | sequential (default: coalesce)
/// - `METEOTEMPLATE_LOG_SUCCESS` / `METEOTEMPLATE_LOG_FAILURE` (default: true)
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret expected by the server
    pub password: Option<String>,

    /// Full URL of the update script
    pub server_url: String,

    /// Software identifier sent with every update
    pub client_id: String,

    /// Minimum time between posts; `None` disables throttling
    pub post_interval: Option<Duration>,

    /// Records older than this are dropped; `None` keeps everything
    pub stale: Option<Duration>,

    /// Maximum number of records waiting in the delivery queue
    pub max_backlog: usize,

    /// HTTP request timeout duration
    pub timeout: Duration,

    /// Maximum number of attempts per record
    pub max_tries: u32,

    /// Delay between attempts
    pub retry_wait: Duration,

    /// Build requests but never send them
    pub skip_upload: bool,

    pub binding: Binding,

    pub throttle: ThrottlePolicy,

    pub log_success: bool,

    pub log_failure: bool,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn new(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Software identifier derived from the crate version.
pub fn default_client_id() -> String {
    format!("meteotemplate-uploader-{}", env!("CARGO_PKG_VERSION"))
}

/// Update URL for a host.
pub fn default_server_url(host: &str) -> String {
    format!("http://{}{}", host.trim_end_matches('/'), UPDATE_PATH)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable is present but malformed or out
    /// of range. A missing password is not an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let password = env::var("METEOTEMPLATE_PASSWORD")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let server_url = match non_empty("METEOTEMPLATE_SERVER_URL") {
            Some(url) => url,
            None => {
                let host = non_empty("METEOTEMPLATE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
                default_server_url(&host)
            }
        };
        if Url::parse(&server_url).is_err() {
            return Err(ConfigError::new(
                "METEOTEMPLATE_SERVER_URL",
                format!("'{}' is not a valid URL", server_url),
            ));
        }

        let post_interval = match parse_number::<u64>("METEOTEMPLATE_POST_INTERVAL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_POST_INTERVAL_SECS)),
        };

        let stale = parse_number::<u64>("METEOTEMPLATE_STALE_SECS")?;
        if let Some(secs) = stale {
            check_range("METEOTEMPLATE_STALE_SECS", secs, 1, MAX_STALE_SECS)?;
        }
        let stale = stale.map(Duration::from_secs);

        let max_backlog = parse_number::<usize>("METEOTEMPLATE_MAX_BACKLOG")?.unwrap_or(DEFAULT_MAX_BACKLOG);
        check_range("METEOTEMPLATE_MAX_BACKLOG", max_backlog as u64, 1, MAX_BACKLOG_LIMIT as u64)?;

        let timeout_secs = parse_number::<u64>("METEOTEMPLATE_TIMEOUT_SECS")?.unwrap_or(DEFAULT_TIMEOUT_SECS);
        check_range("METEOTEMPLATE_TIMEOUT_SECS", timeout_secs, 1, MAX_TIMEOUT_SECS)?;

        let max_tries = parse_number::<u32>("METEOTEMPLATE_MAX_TRIES")?.unwrap_or(DEFAULT_MAX_TRIES);
        check_range("METEOTEMPLATE_MAX_TRIES", max_tries as u64, 1, MAX_TRIES_LIMIT as u64)?;

        let retry_wait_secs =
            parse_number::<u64>("METEOTEMPLATE_RETRY_WAIT_SECS")?.unwrap_or(DEFAULT_RETRY_WAIT_SECS);

        let skip_upload = parse_bool("METEOTEMPLATE_SKIP_UPLOAD")?.unwrap_or(false);
        let log_success = parse_bool("METEOTEMPLATE_LOG_SUCCESS")?.unwrap_or(true);
        let log_failure = parse_bool("METEOTEMPLATE_LOG_FAILURE")?.unwrap_or(true);

        let binding = match non_empty("METEOTEMPLATE_BINDING") {
            None => Binding::Archive,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "loop" => Binding::Loop,
                "archive" => Binding::Archive,
                "both" => Binding::Both,
                _ => {
                    return Err(ConfigError::new(
                        "METEOTEMPLATE_BINDING",
                        format!("'{}' is not one of loop, archive, both", value),
                    ))
                }
            },
        };

        let throttle = match non_empty("METEOTEMPLATE_THROTTLE_POLICY") {
            None => ThrottlePolicy::Coalesce,
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "coalesce" => ThrottlePolicy::Coalesce,
                "sequential" => ThrottlePolicy::Sequential,
                _ => {
                    return Err(ConfigError::new(
                        "METEOTEMPLATE_THROTTLE_POLICY",
                        format!("'{}' is not one of coalesce, sequential", value),
                    ))
                }
            },
        };

        Ok(Self {
            password,
            server_url,
            client_id: default_client_id(),
            post_interval,
            stale,
            max_backlog,
            timeout: Duration::from_secs(timeout_secs),
            max_tries,
            retry_wait: Duration::from_secs(retry_wait_secs),
            skip_upload,
            binding,
            throttle,
            log_success,
            log_failure,
        })
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            password: None,
            server_url: default_server_url(DEFAULT_HOST),
            client_id: default_client_id(),
            post_interval: Some(Duration::from_secs(DEFAULT_POST_INTERVAL_SECS)),
            stale: None,
            max_backlog: DEFAULT_MAX_BACKLOG,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_tries: DEFAULT_MAX_TRIES,
            retry_wait: Duration::from_secs(DEFAULT_RETRY_WAIT_SECS),
            skip_upload: false,
            binding: Binding::Archive,
            throttle: ThrottlePolicy::Coalesce,
            log_success: true,
            log_failure: true,
        }
    }
}

fn non_empty(env_var: &str) -> Option<String> {
    env::var(env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(env_var: &str) -> Result<Option<T>, ConfigError> {
    match non_empty(env_var) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::new(env_var, format!("'{}' is not a valid number", value))),
        None => Ok(None),
    }
}

fn parse_bool(env_var: &str) -> Result<Option<bool>, ConfigError> {
    match non_empty(env_var) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::new(env_var, format!("'{}' is not a valid boolean", value))),
        },
        None => Ok(None),
    }
}

fn check_range(env_var: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::new(
            env_var,
            format!("{} is below minimum ({})", value, min),
        ));
    }
    if value > max {
        return Err(ConfigError::new(
            env_var,
            format!("{} exceeds maximum allowed ({})", value, max),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests touching them
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "METEOTEMPLATE_PASSWORD",
        "METEOTEMPLATE_HOST",
        "METEOTEMPLATE_SERVER_URL",
        "METEOTEMPLATE_POST_INTERVAL_SECS",
        "METEOTEMPLATE_STALE_SECS",
        "METEOTEMPLATE_MAX_BACKLOG",
        "METEOTEMPLATE_TIMEOUT_SECS",
        "METEOTEMPLATE_MAX_TRIES",
        "METEOTEMPLATE_RETRY_WAIT_SECS",
        "METEOTEMPLATE_SKIP_UPLOAD",
        "METEOTEMPLATE_BINDING",
        "METEOTEMPLATE_THROTTLE_POLICY",
        "METEOTEMPLATE_LOG_SUCCESS",
        "METEOTEMPLATE_LOG_FAILURE",
    ];

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn clean_env() -> Vec<EnvGuard> {
        ALL_VARS.iter().map(|v| EnvGuard::remove(v)).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.password.is_none());
        assert_eq!(config.server_url, "http://localhost/plugins/api/update.php");
        assert_eq!(config.post_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.max_tries, 3);
        assert_eq!(config.binding, Binding::Archive);
        assert_eq!(config.throttle, ThrottlePolicy::Coalesce);
        assert!(config.client_id.starts_with("meteotemplate-uploader-"));
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();

        let config = Config::from_env().expect("Should load with defaults");
        assert!(config.password.is_none());
        assert_eq!(config.server_url, "http://localhost/plugins/api/update.php");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retry_wait, Duration::from_secs(5));
        assert_eq!(config.max_backlog, DEFAULT_MAX_BACKLOG);
        assert!(config.stale.is_none());
        assert!(!config.skip_upload);
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        let _g1 = EnvGuard::set("METEOTEMPLATE_PASSWORD", " abc123 ");
        let _g2 = EnvGuard::set("METEOTEMPLATE_HOST", "wx.example.com");
        let _g3 = EnvGuard::set("METEOTEMPLATE_POST_INTERVAL_SECS", "0");
        let _g4 = EnvGuard::set("METEOTEMPLATE_STALE_SECS", "1800");
        let _g5 = EnvGuard::set("METEOTEMPLATE_SKIP_UPLOAD", "Yes");
        let _g6 = EnvGuard::set("METEOTEMPLATE_BINDING", "both");
        let _g7 = EnvGuard::set("METEOTEMPLATE_THROTTLE_POLICY", "sequential");
        let _g8 = EnvGuard::set("METEOTEMPLATE_MAX_TRIES", "5");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.password.as_deref(), Some("abc123"));
        assert_eq!(config.server_url, "http://wx.example.com/plugins/api/update.php");
        assert!(config.post_interval.is_none());
        assert_eq!(config.stale, Some(Duration::from_secs(1800)));
        assert!(config.skip_upload);
        assert_eq!(config.binding, Binding::Both);
        assert_eq!(config.throttle, ThrottlePolicy::Sequential);
        assert_eq!(config.max_tries, 5);
    }

    #[test]
    fn test_server_url_overrides_host() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        let _g1 = EnvGuard::set("METEOTEMPLATE_HOST", "ignored.example.com");
        let _g2 = EnvGuard::set("METEOTEMPLATE_SERVER_URL", "https://wx.example.com/mt/plugins/api/update.php");

        let config = Config::from_env().unwrap();
        assert_eq!(config.server_url, "https://wx.example.com/mt/plugins/api/update.php");
    }

    #[test]
    fn test_blank_password_is_absent() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        let _g = EnvGuard::set("METEOTEMPLATE_PASSWORD", "   ");

        let config = Config::from_env().unwrap();
        assert!(config.password.is_none());
    }

    #[test]
    fn test_invalid_server_url() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        let _g = EnvGuard::set("METEOTEMPLATE_SERVER_URL", "not a url");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid URL"));
        assert_eq!(err.env_var.as_deref(), Some("METEOTEMPLATE_SERVER_URL"));
    }

    #[test]
    fn test_invalid_number() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        let _g = EnvGuard::set("METEOTEMPLATE_TIMEOUT_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
    }

    #[test]
    fn test_zero_max_tries() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        let _g = EnvGuard::set("METEOTEMPLATE_MAX_TRIES", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_backlog_exceeds_max() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        let _g = EnvGuard::set("METEOTEMPLATE_MAX_BACKLOG", "999999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_stale_out_of_range() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        {
            let _g = EnvGuard::set("METEOTEMPLATE_STALE_SECS", "99999999999");
            let err = Config::from_env().unwrap_err();
            assert_eq!(err.env_var.as_deref(), Some("METEOTEMPLATE_STALE_SECS"));
            assert!(err.message.contains("exceeds maximum"));
        }
        {
            let _g = EnvGuard::set("METEOTEMPLATE_STALE_SECS", "0");
            let err = Config::from_env().unwrap_err();
            assert!(err.message.contains("below minimum"));
        }
    }

    #[test]
    fn test_invalid_binding_and_bool() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guards = clean_env();
        {
            let _g = EnvGuard::set("METEOTEMPLATE_BINDING", "sometimes");
            let err = Config::from_env().unwrap_err();
            assert!(err.message.contains("loop, archive, both"));
        }
        {
            let _g = EnvGuard::set("METEOTEMPLATE_LOG_SUCCESS", "maybe");
            let err = Config::from_env().unwrap_err();
            assert!(err.message.contains("not a valid boolean"));
        }
    }

    #[test]
    fn test_binding_accepts() {
        assert!(Binding::Loop.accepts_loop());
        assert!(!Binding::Loop.accepts_archive());
        assert!(Binding::Archive.accepts_archive());
        assert!(!Binding::Archive.accepts_loop());
        assert!(Binding::Both.accepts_loop() && Binding::Both.accepts_archive());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
