use std::{net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::models::DmarcPolicy;

/// Typed, validated configuration loaded from the process environment.
/// Every recognized key from the original spec's configuration table has a
/// field here; an invalid or missing required value fails fast with a
/// [`ConfigError`] so the caller can exit with the documented code 2.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_hostname: String,
    pub server_domain: String,
    pub server_ip: IpAddr,

    pub smtp_port: u16,
    pub smtp_tls_port: u16,
    pub smtp_ssl_port: u16,

    pub enable_auth: bool,
    pub auth_methods: Vec<AuthMethod>,
    pub enable_starttls: bool,
    pub require_tls: bool,

    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,

    pub max_recipients_per_message: usize,
    pub max_messages_per_hour: u32,
    pub max_messages_per_day: u32,
    pub max_connection_rate: u32,
    pub max_auth_attempts: u32,

    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub message_retention_days: u32,

    pub enable_dkim_signing: bool,
    pub dkim_selector: String,

    pub spf_checking: bool,
    pub spf_failure_policy: SpfFailurePolicy,

    pub dmarc_checking: bool,
    pub dmarc_failure_policy: DmarcPolicy,

    pub enable_greylisting: bool,
    pub greylist_delay_minutes: u32,
    pub enable_blacklist_check: bool,
    pub blacklist_servers: Vec<String>,

    pub max_message_size: u64,

    pub connection_timeout: Duration,
    pub data_timeout: Duration,
    pub max_delivery_threads: usize,
    pub stale_reap_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Plain,
    Login,
    CramMd5,
}

impl FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(AuthMethod::Plain),
            "LOGIN" => Ok(AuthMethod::Login),
            "CRAM-MD5" => Ok(AuthMethod::CramMd5),
            other => Err(ConfigError::InvalidValue("auth_methods", other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfFailurePolicy {
    None,
    SoftFail,
    Fail,
}

impl FromStr for SpfFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SpfFailurePolicy::None),
            "softfail" => Ok(SpfFailurePolicy::SoftFail),
            "fail" => Ok(SpfFailurePolicy::Fail),
            other => Err(ConfigError::InvalidValue(
                "spf_failure_policy",
                other.to_owned(),
            )),
        }
    }
}

impl FromStr for DmarcPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(DmarcPolicy::None),
            "quarantine" => Ok(DmarcPolicy::Quarantine),
            "reject" => Ok(DmarcPolicy::Reject),
            other => Err(ConfigError::InvalidValue(
                "dmarc_failure_policy",
                other.to_owned(),
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

fn env_opt(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &'static str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_owned())
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(key, format!("{raw:?}: {e}"))),
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue(key, other.to_owned())),
        },
    }
}

fn csv(key: &'static str) -> Vec<String> {
    env_opt(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Loads configuration from the environment (after `dotenvy::dotenv()`
    /// has already been applied by the caller, matching the teacher's
    /// `Environment::from_env()` idiom). Unrecognized values for a
    /// recognized key fail fast; unset keys fall back to the documented
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_hostname =
            env_opt("SERVER_HOSTNAME").ok_or(ConfigError::Missing("server_hostname"))?;
        let server_domain = env_or("SERVER_DOMAIN", &server_hostname);
        let server_ip: IpAddr = parse_env("SERVER_IP", IpAddr::from([0, 0, 0, 0]))?;

        let auth_methods = {
            let raw = csv("AUTH_METHODS");
            if raw.is_empty() {
                vec![AuthMethod::Plain, AuthMethod::Login]
            } else {
                raw.iter()
                    .map(|s| s.parse())
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(Config {
            server_hostname,
            server_domain,
            server_ip,
            smtp_port: parse_env("SMTP_PORT", 25)?,
            smtp_tls_port: parse_env("SMTP_TLS_PORT", 587)?,
            smtp_ssl_port: parse_env("SMTP_SSL_PORT", 465)?,
            enable_auth: parse_bool("ENABLE_AUTH", true)?,
            auth_methods,
            enable_starttls: parse_bool("ENABLE_STARTTLS", true)?,
            require_tls: parse_bool("REQUIRE_TLS", false)?,
            tls_cert_path: PathBuf::from(env_or("TLS_CERT_PATH", "cert.pem")),
            tls_key_path: PathBuf::from(env_or("TLS_KEY_PATH", "key.pem")),
            max_recipients_per_message: parse_env("MAX_RECIPIENTS_PER_MESSAGE", 100)?,
            max_messages_per_hour: parse_env("MAX_MESSAGES_PER_HOUR", 100)?,
            max_messages_per_day: parse_env("MAX_MESSAGES_PER_DAY", 1000)?,
            max_connection_rate: parse_env("MAX_CONNECTION_RATE", 10)?,
            max_auth_attempts: parse_env("MAX_AUTH_ATTEMPTS", 5)?,
            retry_attempts: parse_env("RETRY_ATTEMPTS", 7)?,
            retry_delay_seconds: parse_env("RETRY_DELAY_SECONDS", 300)?,
            message_retention_days: parse_env("MESSAGE_RETENTION_DAYS", 30)?,
            enable_dkim_signing: parse_bool("ENABLE_DKIM_SIGNING", true)?,
            dkim_selector: env_or("DKIM_SELECTOR", "default"),
            spf_checking: parse_bool("SPF_CHECKING", true)?,
            spf_failure_policy: parse_env("SPF_FAILURE_POLICY", SpfFailurePolicy::SoftFail)?,
            dmarc_checking: parse_bool("DMARC_CHECKING", true)?,
            dmarc_failure_policy: parse_env("DMARC_FAILURE_POLICY", DmarcPolicy::None)?,
            enable_greylisting: parse_bool("ENABLE_GREYLISTING", false)?,
            greylist_delay_minutes: parse_env("GREYLIST_DELAY_MINUTES", 5)?,
            enable_blacklist_check: parse_bool("ENABLE_BLACKLIST_CHECK", false)?,
            blacklist_servers: csv("BLACKLIST_SERVERS"),
            max_message_size: parse_env("MAX_MESSAGE_SIZE", 25 * 1024 * 1024)?,
            connection_timeout: Duration::from_secs(parse_env("CONNECTION_TIMEOUT", 30)?),
            data_timeout: Duration::from_secs(parse_env("DATA_TIMEOUT", 300)?),
            max_delivery_threads: parse_env("MAX_DELIVERY_THREADS", 10)?,
            stale_reap_interval: Duration::from_secs(parse_env("STALE_REAP_INTERVAL", 3600)?),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        for (k, _) in std::env::vars() {
            if k.starts_with("SMTP_") || k == "SERVER_HOSTNAME" {
                unsafe { std::env::remove_var(&k) };
            }
        }
        unsafe { std::env::set_var("SERVER_HOSTNAME", "mail.example.com") };
        let config = Config::from_env().unwrap();
        assert_eq!(config.smtp_port, 25);
        assert_eq!(config.smtp_tls_port, 587);
        assert_eq!(config.retry_attempts, 7);
        unsafe { std::env::remove_var("SERVER_HOSTNAME") };
    }

    #[test]
    fn missing_hostname_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::remove_var("SERVER_HOSTNAME") };
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("server_hostname"))
        ));
    }

    #[test]
    fn invalid_bool_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var("SERVER_HOSTNAME", "mail.example.com") };
        unsafe { std::env::set_var("ENABLE_AUTH", "sideways") };
        assert!(Config::from_env().is_err());
        unsafe { std::env::remove_var("ENABLE_AUTH") };
        unsafe { std::env::remove_var("SERVER_HOSTNAME") };
    }
}
