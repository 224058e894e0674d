//! Schedule expressions.
//!
//! Supported forms (whitespace separated):
//!
//! | expression   | meaning                                        |
//! |--------------|------------------------------------------------|
//! | `*/N`        | every N minutes                                |
//! | `HH:MM`      | daily at HH:MM                                 |
//! | `MM HH`      | daily at HH:MM (legacy order)                  |
//! | `HH:MM W`    | weekly on weekday W (0 = Monday .. 6 = Sunday) |
//! | `*/N h1-h2`  | every N minutes inside `[h1:00, h2:00)`        |
//!
//! Times are local wall-clock times; evaluation works on `NaiveDateTime` so it
//! can be driven by any clock.

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Timelike, Weekday};
use std::fmt;

use crate::error::ScheduleError;

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    EveryMinutes {
        interval: u32,
    },
    DailyAt {
        time: NaiveTime,
    },
    WeeklyAt {
        weekday: Weekday,
        time: NaiveTime,
    },
    EveryMinutesWindowed {
        interval: u32,
        window_start: NaiveTime,
        end_hour: u32,
    },
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();

        match tokens.as_slice() {
            [] => Err(ScheduleError::Empty),
            [every] if every.starts_with("*/") => Ok(Schedule::EveryMinutes {
                interval: parse_interval(every)?,
            }),
            [time] if time.contains(':') => Ok(Schedule::DailyAt {
                time: parse_clock(time)?,
            }),
            [every, window] if every.starts_with("*/") => {
                let interval = parse_interval(every)?;
                let (window_start, end_hour) = parse_window(window)?;
                Ok(Schedule::EveryMinutesWindowed {
                    interval,
                    window_start,
                    end_hour,
                })
            }
            [time, weekday] if time.contains(':') => Ok(Schedule::WeeklyAt {
                time: parse_clock(time)?,
                weekday: parse_weekday(weekday)?,
            }),
            [minute, hour] if is_number(minute) && is_number(hour) => {
                let invalid = || ScheduleError::InvalidTime(format!("{} {}", minute, hour));
                let minute: u32 = minute.parse().map_err(|_| invalid())?;
                let hour: u32 = hour.parse().map_err(|_| invalid())?;
                let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)?;
                Ok(Schedule::DailyAt { time })
            }
            _ => Err(ScheduleError::Unsupported(expression.trim().to_string())),
        }
    }

    /// First trigger strictly after `after`.
    pub fn next_fire(&self, after: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Schedule::EveryMinutes { interval } => after + Duration::minutes(i64::from(interval)),
            Schedule::DailyAt { time } => {
                let candidate = after.date().and_time(time);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Schedule::WeeklyAt { weekday, time } => {
                let days_ahead = (7 + weekday.num_days_from_monday()
                    - after.weekday().num_days_from_monday())
                    % 7;
                let candidate =
                    (after.date() + Duration::days(i64::from(days_ahead))).and_time(time);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(7)
                }
            }
            Schedule::EveryMinutesWindowed {
                interval,
                window_start,
                end_hour,
            } => {
                let candidate = after + Duration::minutes(i64::from(interval));
                if candidate.time() >= window_start && candidate.hour() < end_hour {
                    return candidate;
                }
                let opening = candidate.date().and_time(window_start);
                if candidate < opening {
                    opening
                } else {
                    opening + Duration::days(1)
                }
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::EveryMinutes { interval } => write!(f, "every {} minute(s)", interval),
            Schedule::DailyAt { time } => write!(f, "daily at {}", time.format("%H:%M")),
            Schedule::WeeklyAt { weekday, time } => {
                write!(f, "weekly on {} at {}", weekday, time.format("%H:%M"))
            }
            Schedule::EveryMinutesWindowed {
                interval,
                window_start,
                end_hour,
            } => write!(
                f,
                "every {} minute(s) between {} and {:02}:00",
                interval,
                window_start.format("%H:%M"),
                end_hour
            ),
        }
    }
}

fn is_number(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

fn parse_interval(token: &str) -> Result<u32, ScheduleError> {
    let value = token.trim_start_matches("*/");
    match value.parse::<u32>() {
        Ok(interval) if interval > 0 => Ok(interval),
        _ => Err(ScheduleError::InvalidInterval(token.to_string())),
    }
}

fn parse_clock(token: &str) -> Result<NaiveTime, ScheduleError> {
    let invalid = || ScheduleError::InvalidTime(token.to_string());
    let (hour, minute) = token.split_once(':').ok_or_else(invalid)?;
    if !is_number(hour) || !is_number(minute) || hour.len() > 2 || minute.len() > 2 {
        return Err(invalid());
    }
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

fn parse_weekday(token: &str) -> Result<Weekday, ScheduleError> {
    token
        .parse::<usize>()
        .ok()
        .and_then(|index| WEEKDAYS.get(index).copied())
        .ok_or_else(|| ScheduleError::InvalidWeekday(token.to_string()))
}

/// `h1-h2` with `0 <= h1 < h2 <= 24`.
fn parse_window(token: &str) -> Result<(NaiveTime, u32), ScheduleError> {
    let invalid = || ScheduleError::InvalidWindow(token.to_string());
    let (start, end) = token.split_once('-').ok_or_else(invalid)?;
    let start: u32 = start.parse().map_err(|_| invalid())?;
    let end: u32 = end.parse().map_err(|_| invalid())?;
    if start >= end || end > 24 {
        return Err(invalid());
    }
    let window_start = NaiveTime::from_hms_opt(start, 0, 0).ok_or_else(invalid)?;
    Ok((window_start, end))
}
