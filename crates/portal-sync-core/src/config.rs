use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::UtcOffset;

use crate::models::{CoreError, CoreErrorKind, CoreResult};

pub const ENV_ENABLED: &str = "PORTAL_SYNC_ENABLED";
pub const ENV_APP_ENV: &str = "APP_ENV";
pub const ENV_CHECK_INTERVAL_SECS: &str = "PORTAL_SYNC_CHECK_INTERVAL_SECS";
pub const ENV_ALERTS_ENABLED: &str = "PORTAL_SYNC_ALERTS_ENABLED";
pub const ENV_UTC_OFFSET_MINUTES: &str = "PORTAL_SYNC_UTC_OFFSET_MINUTES";
pub const ENV_MAX_INCREMENTAL_AGE_DAYS: &str = "PORTAL_SYNC_MAX_INCREMENTAL_AGE_DAYS";
pub const ENV_SHUTDOWN_GRACE_SECS: &str = "PORTAL_SYNC_SHUTDOWN_GRACE_SECS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Process-wide gate. When false the scheduler never initialises.
    pub enabled: bool,
    pub is_production: bool,
    pub check_interval_seconds: u64,
    pub system_alerts_enabled: bool,
    /// Offset used to evaluate weekly `schedule_day`/`schedule_time` slots.
    pub schedule_utc_offset_minutes: i16,
    pub max_incremental_age_days: u32,
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            is_production: false,
            check_interval_seconds: 60,
            system_alerts_enabled: false,
            schedule_utc_offset_minutes: 0,
            max_incremental_age_days: 7,
            shutdown_grace_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let defaults = Self::default();
        let is_production = lookup(ENV_APP_ENV)
            .map(|value| value.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let enabled = match lookup(ENV_ENABLED) {
            Some(raw) => parse_bool(ENV_ENABLED, &raw)?,
            None => is_production,
        };
        let system_alerts_enabled = match lookup(ENV_ALERTS_ENABLED) {
            Some(raw) => parse_bool(ENV_ALERTS_ENABLED, &raw)?,
            None => is_production,
        };

        let config = Self {
            enabled,
            is_production,
            check_interval_seconds: parse_or(
                &lookup,
                ENV_CHECK_INTERVAL_SECS,
                defaults.check_interval_seconds,
            )?,
            system_alerts_enabled,
            schedule_utc_offset_minutes: parse_or(
                &lookup,
                ENV_UTC_OFFSET_MINUTES,
                defaults.schedule_utc_offset_minutes,
            )?,
            max_incremental_age_days: parse_or(
                &lookup,
                ENV_MAX_INCREMENTAL_AGE_DAYS,
                defaults.max_incremental_age_days,
            )?,
            shutdown_grace_seconds: parse_or(
                &lookup,
                ENV_SHUTDOWN_GRACE_SECS,
                defaults.shutdown_grace_seconds,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.check_interval_seconds == 0 {
            return Err(invalid("check_interval_seconds must be at least 1"));
        }
        self.schedule_offset()?;
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn schedule_offset(&self) -> CoreResult<UtcOffset> {
        let seconds = i32::from(self.schedule_utc_offset_minutes) * 60;
        UtcOffset::from_whole_seconds(seconds).map_err(|error| {
            invalid(format!(
                "schedule_utc_offset_minutes '{}' is out of range: {error}",
                self.schedule_utc_offset_minutes
            ))
        })
    }

    pub fn max_incremental_age(&self) -> time::Duration {
        time::Duration::days(i64::from(self.max_incremental_age_days.max(1)))
    }
}

fn parse_bool(key: &str, raw: &str) -> CoreResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(invalid(format!("{key} must be a boolean, got '{other}'"))),
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> CoreResult<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|error| invalid(format!("{key} is invalid: {error}"))),
        None => Ok(default),
    }
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
