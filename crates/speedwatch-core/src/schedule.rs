use crate::MeasurementError;
use chrono::{DateTime, FixedOffset, Local, Offset, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// A daily window in local minutes, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub label: String,
    pub start_minute: u16,
    pub end_minute: u16,
}

impl TimeWindow {
    pub fn new(label: &str, start: (u16, u16), end: (u16, u16)) -> Self {
        Self {
            label: label.to_string(),
            start_minute: (start.0 * 60 + start.1).min(MINUTES_PER_DAY - 1),
            end_minute: (end.0 * 60 + end.1).min(MINUTES_PER_DAY - 1),
        }
    }

    pub fn contains(&self, minute_of_day: u16) -> bool {
        self.start_minute <= minute_of_day && minute_of_day <= self.end_minute
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:02}:{:02}-{:02}:{:02})",
            self.label,
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSchedule {
    windows: Vec<TimeWindow>,
}

impl Default for WindowSchedule {
    fn default() -> Self {
        Self {
            windows: vec![
                TimeWindow::new("AM", (6, 0), (11, 59)),
                TimeWindow::new("NOON", (12, 0), (12, 59)),
                TimeWindow::new("PM", (13, 0), (18, 0)),
            ],
        }
    }
}

impl WindowSchedule {
    pub fn new(windows: Vec<TimeWindow>) -> Self {
        Self { windows }
    }

    pub fn describe(&self) -> String {
        self.windows
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn window_at(&self, minute_of_day: u16) -> Option<&TimeWindow> {
        self.windows
            .iter()
            .find(|window| window.contains(minute_of_day))
    }

    /// Evaluates `now` in the named zone, or in `server_offset` when the zone is unknown.
    pub fn active_window_in(
        &self,
        tz_name: &str,
        now: DateTime<Utc>,
        server_offset: FixedOffset,
    ) -> Option<&TimeWindow> {
        let minute = match tz_name.trim().parse::<Tz>() {
            Ok(tz) => minute_of_day(&now.with_timezone(&tz)),
            Err(_) => minute_of_day(&now.with_timezone(&server_offset)),
        };
        self.window_at(minute)
    }

    pub fn active_window(&self, tz_name: &str, now: DateTime<Utc>) -> Option<&TimeWindow> {
        let server_offset = now.with_timezone(&Local).offset().fix();
        self.active_window_in(tz_name, now, server_offset)
    }

    /// Fails closed with `OutsideWindow` when no window is active.
    pub fn gate(&self, tz_name: &str, now: DateTime<Utc>) -> Result<&TimeWindow, MeasurementError> {
        self.active_window(tz_name, now)
            .ok_or_else(|| MeasurementError::OutsideWindow {
                windows: self.describe(),
            })
    }
}

fn minute_of_day<T: Timelike>(time: &T) -> u16 {
    (time.hour() * 60 + time.minute()) as u16
}
