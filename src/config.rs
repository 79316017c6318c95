use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::hours::BusinessHours;
use crate::model::Ms;
use crate::templates::Templates;

#[derive(Debug)]
pub enum ConfigError {
    Invalid(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
            ConfigError::Io(e) => write!(f, "configuration I/O error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Settings consumed by the daily jobs and message rendering.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub locale: String,
    /// Offset of the clinic's local time from UTC, in minutes.
    pub utc_offset_minutes: i32,
    pub address: String,
    pub booking_url: String,
    /// Local hour at which the daily jobs run.
    pub run_at_hour: u32,
    /// Appointments dated this many days ago or earlier are swept.
    pub no_show_grace_days: i64,
    pub no_show_threshold: u32,
    pub client_max_age_months: u32,
    pub outbound_expiry_ms: Ms,
    pub notification_ttl_ms: Ms,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            locale: "en".into(),
            utc_offset_minutes: 0,
            address: String::new(),
            booking_url: String::new(),
            run_at_hour: 6,
            no_show_grace_days: 2,
            no_show_threshold: 3,
            client_max_age_months: 36,
            outbound_expiry_ms: 3 * crate::model::MS_PER_DAY,
            notification_ttl_ms: 30 * crate::model::MS_PER_DAY,
        }
    }
}

impl JobConfig {
    /// The clinic-local calendar day containing the instant `now`.
    pub fn local_date(&self, now: Ms) -> NaiveDate {
        let utc = DateTime::<Utc>::from_timestamp_millis(now).unwrap_or_default();
        (utc + Duration::minutes(self.utc_offset_minutes as i64)).date_naive()
    }
}

/// Everything a tenant needs besides its WAL.
#[derive(Debug, Clone, Default)]
pub struct TenantConfig {
    pub hours: BusinessHours,
    pub jobs: JobConfig,
    pub templates: Templates,
}

/// Server settings, read from `DAYBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub port: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub tenant: TenantConfig,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name}={v}"))),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut jobs = JobConfig::default();
        if let Some(locale) = var("DAYBOOK_LOCALE") {
            jobs.locale = locale;
        }
        if let Some(offset) = parsed("DAYBOOK_UTC_OFFSET_MINUTES")? {
            jobs.utc_offset_minutes = offset;
        }
        if let Some(address) = var("DAYBOOK_ADDRESS") {
            jobs.address = address;
        }
        if let Some(url) = var("DAYBOOK_BOOKING_URL") {
            jobs.booking_url = url;
        }
        if let Some(hour) = parsed::<u32>("DAYBOOK_JOB_HOUR")? {
            if hour > 23 {
                return Err(ConfigError::Invalid(format!("DAYBOOK_JOB_HOUR={hour}")));
            }
            jobs.run_at_hour = hour;
        }
        if let Some(threshold) = parsed("DAYBOOK_NO_SHOW_THRESHOLD")? {
            jobs.no_show_threshold = threshold;
        }

        let hours = match var("DAYBOOK_HOURS") {
            Some(text) => BusinessHours::parse(&text)?,
            None => BusinessHours::default(),
        };
        let templates = match var("DAYBOOK_TEMPLATES") {
            Some(path) => Templates::load(&PathBuf::from(path))?,
            None => Templates::default(),
        };

        Ok(Self {
            bind: var("DAYBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: var("DAYBOOK_PORT").unwrap_or_else(|| "5433".into()),
            data_dir: PathBuf::from(var("DAYBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: var("DAYBOOK_PASSWORD").unwrap_or_else(|| "daybook".into()),
            max_connections: parsed("DAYBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed("DAYBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert: var("DAYBOOK_TLS_CERT"),
            tls_key: var("DAYBOOK_TLS_KEY"),
            metrics_port: parsed("DAYBOOK_METRICS_PORT")?,
            tenant: TenantConfig { hours, jobs, templates },
        })
    }
}
