use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskSchedule};

/// Ceiling applied to the retry delay after a failed run.
pub const MAX_RETRY_DELAY_MINUTES: u32 = 30;

const SCHEDULE_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour]:[minute]:[second]");
const SCHEDULE_TIME_SHORT_FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]");

/// Next regular run after `now`: the following weekly slot (strictly after
/// `now`, evaluated in `offset`) when both calendar fields are set, otherwise
/// `now + interval_minutes`.
pub fn next_run_at(
    schedule: &TaskSchedule,
    now: OffsetDateTime,
    offset: UtcOffset,
) -> OffsetDateTime {
    match (schedule.schedule_day, schedule.schedule_time) {
        (Some(day), Some(at)) if day <= 6 => next_weekly_slot(day, at, now, offset),
        _ => now + Duration::minutes(i64::from(schedule.interval_minutes.max(1))),
    }
}

/// Retry time after a failure: `min(interval_minutes, 30)` minutes from `now`,
/// independent of any calendar slot.
pub fn retry_at(schedule: &TaskSchedule, now: OffsetDateTime) -> OffsetDateTime {
    now + retry_delay(schedule)
}

pub fn retry_delay(schedule: &TaskSchedule) -> Duration {
    let minutes = schedule
        .interval_minutes
        .clamp(1, MAX_RETRY_DELAY_MINUTES);
    Duration::minutes(i64::from(minutes))
}

fn next_weekly_slot(day: u8, at: Time, now: OffsetDateTime, offset: UtcOffset) -> OffsetDateTime {
    let local_now = now.to_offset(offset);
    let today = local_now.weekday().number_days_from_sunday();
    let days_ahead = (i64::from(day) - i64::from(today)).rem_euclid(7);
    let date = local_now.date() + Duration::days(days_ahead);
    let mut candidate = PrimitiveDateTime::new(date, at).assume_offset(offset);
    if candidate <= local_now {
        candidate += Duration::weeks(1);
    }
    candidate.to_offset(now.offset())
}

pub fn validate_schedule(schedule: &TaskSchedule) -> CoreResult<()> {
    if schedule.interval_minutes == 0 {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            "interval_minutes must be at least 1",
        ));
    }
    if let Some(day) = schedule.schedule_day
        && day > 6
    {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("schedule_day must be between 0 and 6, got {day}"),
        ));
    }
    if schedule.schedule_day.is_some() != schedule.schedule_time.is_some() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            "schedule_day and schedule_time must be set together",
        ));
    }
    Ok(())
}

pub fn parse_schedule_time(raw: &str) -> CoreResult<Time> {
    let trimmed = raw.trim();
    Time::parse(trimmed, SCHEDULE_TIME_FORMAT)
        .or_else(|_| Time::parse(trimmed, SCHEDULE_TIME_SHORT_FORMAT))
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("schedule_time '{raw}' is not HH:MM:SS: {error}"),
            )
        })
}

pub fn format_schedule_time(value: Time) -> String {
    value.format(SCHEDULE_TIME_FORMAT).unwrap_or_else(|_| {
        format!(
            "{:02}:{:02}:{:02}",
            value.hour(),
            value.minute(),
            value.second()
        )
    })
}

pub(crate) mod hms_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Time;

    pub fn serialize<S: Serializer>(
        value: &Option<Time>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_some(&super::format_schedule_time(*time)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Time>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|raw| super::parse_schedule_time(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
