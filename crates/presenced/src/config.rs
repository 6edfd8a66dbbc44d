use crate::attendance::PresentPolicy;
use crate::gate::{parse_days, parse_hours, TimeWindow};
use crate::store::StoreCredentials;
use crate::sweeper::DEFAULT_SCHEDULE;
use chrono::{FixedOffset, Weekday};
use presence_core::{DetectorConfig, FacePolicy};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CREDENTIALS_VAR: &str = "PRESENCE_STORE_CREDENTIALS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("PRESENCE_STORE_CREDENTIALS environment variable is not set")]
    MissingCredentials,
    #[error("PRESENCE_STORE_CREDENTIALS is not a valid credential bundle: {0}")]
    Credentials(#[source] serde_json::Error),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the cascade, model bundle and texture config.
    pub model_dir: PathBuf,
    /// HTTP listen address (default: 0.0.0.0:5000).
    pub bind: String,
    pub detector: DetectorConfig,
    pub present_policy: PresentPolicy,
    /// Business-hours window and its fixed timezone.
    pub window: TimeWindow,
    /// Six-field cron expression for the absentee sweep.
    pub sweep_schedule: String,
    /// Upper bound on each store call.
    pub store_timeout: Duration,
    /// Request body limit in bytes.
    pub max_upload_bytes: usize,
    pub credentials: StoreCredentials,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw = get(CREDENTIALS_VAR).ok_or(ConfigError::MissingCredentials)?;
        let mut credentials: StoreCredentials = serde_json::from_str(&raw).map_err(ConfigError::Credentials)?;

        let model_dir = get("PRESENCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir(&get).join("models"));

        let policy = match get("PRESENCE_FACE_POLICY") {
            Some(v) => FacePolicy::from_str(&v).map_err(|reason| invalid("PRESENCE_FACE_POLICY", &v, reason))?,
            None => FacePolicy::default(),
        };
        let present_policy = match get("PRESENCE_PRESENT_POLICY") {
            Some(v) => {
                PresentPolicy::from_str(&v).map_err(|reason| invalid("PRESENCE_PRESENT_POLICY", &v, reason))?
            }
            None => PresentPolicy::default(),
        };

        let days = match get("PRESENCE_ALLOWED_DAYS") {
            Some(v) => parse_days(&v).ok_or_else(|| invalid("PRESENCE_ALLOWED_DAYS", &v, "expected e.g. mon,tue,wed"))?,
            None => vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
        };
        let hours = match get("PRESENCE_ALLOWED_HOURS") {
            Some(v) => parse_hours(&v).ok_or_else(|| invalid("PRESENCE_ALLOWED_HOURS", &v, "expected e.g. 7-8"))?,
            None => 7..=8,
        };
        let offset_hours = env_i32(&get, "PRESENCE_UTC_OFFSET_HOURS", 7);
        let offset = offset_hours.checked_mul(3600).and_then(FixedOffset::east_opt).ok_or_else(|| {
            invalid("PRESENCE_UTC_OFFSET_HOURS", &offset_hours.to_string(), "offset out of range")
        })?;

        let sweep_schedule = get("PRESENCE_SWEEP_SCHEDULE").unwrap_or_else(|| DEFAULT_SCHEDULE.to_string());
        crate::sweeper::parse_schedule(&sweep_schedule)
            .map_err(|e| invalid("PRESENCE_SWEEP_SCHEDULE", &sweep_schedule, e.to_string()))?;

        let store_timeout = Duration::from_secs(env_u64(&get, "PRESENCE_STORE_TIMEOUT_SECS", 5));
        let timeout_ms = u64::try_from(store_timeout.as_millis()).unwrap_or(u64::MAX);
        if credentials.busy_timeout_ms >= timeout_ms {
            let clamped = timeout_ms / 2;
            tracing::warn!(
                busy_timeout_ms = credentials.busy_timeout_ms,
                store_timeout_ms = timeout_ms,
                clamped,
                "busy timeout must be shorter than the store timeout; clamping"
            );
            credentials.busy_timeout_ms = clamped;
        }

        let defaults = DetectorConfig::default();
        Ok(Self {
            model_dir,
            bind: get("PRESENCE_BIND").unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            detector: DetectorConfig {
                scale_factor: env_f64(&get, "PRESENCE_SCALE_FACTOR", defaults.scale_factor),
                min_neighbors: env_usize(&get, "PRESENCE_MIN_NEIGHBORS", defaults.min_neighbors),
                min_face_size: env_usize(&get, "PRESENCE_MIN_FACE_SIZE", defaults.min_face_size),
                policy,
            },
            present_policy,
            window: TimeWindow::new(offset, days, hours),
            sweep_schedule,
            store_timeout,
            max_upload_bytes: env_usize(&get, "PRESENCE_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            credentials,
        })
    }
}

/// `$XDG_DATA_HOME/presence`, falling back to `~/.local/share/presence`.
pub fn default_data_dir(get: &impl Fn(&str) -> Option<String>) -> PathBuf {
    get("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn env_parse<T: FromStr + std::fmt::Display>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, %default, "unparseable value, using default");
            default
        }),
    }
}

fn env_f64(get: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    env_parse(get, key, default)
}

fn env_u64(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    env_parse(get, key, default)
}

fn env_usize(get: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    env_parse(get, key, default)
}

fn env_i32(get: &impl Fn(&str) -> Option<String>, key: &str, default: i32) -> i32 {
    env_parse(get, key, default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    const CREDS: (&str, &str) = (CREDENTIALS_VAR, r#"{"database_path": "/var/lib/presence/presence.db"}"#);

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[CREDS, ("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/data/presence/models"));
        assert_eq!(config.bind, "0.0.0.0:5000");
        assert_eq!(config.detector, DetectorConfig::default());
        assert_eq!(config.present_policy, PresentPolicy::AppendAlways);
        assert_eq!(config.window.offset(), FixedOffset::east_opt(7 * 3600).unwrap());
        assert_eq!(config.sweep_schedule, "0 1 9 * * *");
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.max_upload_bytes, 10_485_760);
        assert_eq!(config.credentials.busy_timeout_ms, 2000);
    }

    #[test]
    fn test_missing_credentials_is_fatal() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::MissingCredentials)
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[(CREDENTIALS_VAR, "{not json")])),
            Err(ConfigError::Credentials(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            CREDS,
            ("PRESENCE_MODEL_DIR", "/opt/models"),
            ("PRESENCE_MIN_NEIGHBORS", "3"),
            ("PRESENCE_FACE_POLICY", "all"),
            ("PRESENCE_PRESENT_POLICY", "first-per-day"),
            ("PRESENCE_ALLOWED_DAYS", "sat,sun"),
            ("PRESENCE_ALLOWED_HOURS", "10-12"),
            ("PRESENCE_UTC_OFFSET_HOURS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.detector.min_neighbors, 3);
        assert_eq!(config.detector.policy, FacePolicy::All);
        assert_eq!(config.present_policy, PresentPolicy::FirstPerDay);

        use chrono::TimeZone;
        let saturday_11 = chrono::Utc.with_ymd_and_hms(2024, 6, 8, 11, 0, 0).unwrap();
        assert!(config.window.contains(saturday_11));
    }

    #[test]
    fn test_busy_timeout_stays_below_store_timeout() {
        let slow = (CREDENTIALS_VAR, r#"{"database_path": "/tmp/p.db", "busy_timeout_ms": 8000}"#);
        let config = Config::from_lookup(lookup(&[slow])).unwrap();
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.credentials.busy_timeout_ms, 2500);

        let config = Config::from_lookup(lookup(&[slow, ("PRESENCE_STORE_TIMEOUT_SECS", "10")])).unwrap();
        assert_eq!(config.credentials.busy_timeout_ms, 8000);
    }

    #[test]
    fn test_malformed_numbers_fall_back() {
        let config = Config::from_lookup(lookup(&[CREDS, ("PRESENCE_SCALE_FACTOR", "fast")])).unwrap();
        assert_eq!(config.detector.scale_factor, 1.3);
    }

    #[test]
    fn test_malformed_policy_or_schedule_is_fatal() {
        assert!(Config::from_lookup(lookup(&[CREDS, ("PRESENCE_PRESENT_POLICY", "weekly")])).is_err());
        assert!(Config::from_lookup(lookup(&[CREDS, ("PRESENCE_SWEEP_SCHEDULE", "every day")])).is_err());
        assert!(Config::from_lookup(lookup(&[CREDS, ("PRESENCE_ALLOWED_HOURS", "20-3")])).is_err());
    }
}
