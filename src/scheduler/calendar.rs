/*
 * Copyright (c) 2025 Clément GRENNERAT
 *
 * This program is free software: you can redistribute it and/or modify it under the terms of the
 * GNU General Public License as published by the Free Software Foundation, version 3.
 * This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
 * even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
 * See the GNU General Public License for more details.
 * You should have received a copy of the GNU General Public License along with this program.
 * If not, see https://www.gnu.org/licenses/.
 *
 */

use crate::model::configuration::StandingReservationConfig;
use crate::model::standing::{DayOfWeek, Period};
use chrono::{Datelike, Local, TimeZone, Timelike};

pub const MINUTE_LEN: i64 = 60;
pub const HOUR_LEN: i64 = 60 * MINUTE_LEN;
pub const DAY_LEN: i64 = 24 * HOUR_LEN;
pub const WEEK_LEN: i64 = 7 * DAY_LEN;
pub const MONTH_LEN: i64 = 30 * DAY_LEN;
pub const YEAR_LEN: i64 = 365 * DAY_LEN;
/// Upper bound of every reservation window.
pub const MAX_TIME: i64 = 2_140_000_000;

pub fn period_length(period: Period) -> i64 {
    match period {
        Period::Minute => MINUTE_LEN,
        Period::Hour => HOUR_LEN,
        Period::Day => DAY_LEN,
        Period::Week => WEEK_LEN,
        Period::Month => MONTH_LEN,
        Period::Infinity => MAX_TIME,
    }
}

/// Beginning of the period containing `time`, in local time. Weeks begin on Monday, months on their first day.
pub fn period_begin(period: Period, time: i64) -> i64 {
    let datetime = match Local.timestamp_opt(time, 0) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => return time - time.rem_euclid(period_length(period).min(DAY_LEN)),
    };
    let second_of_minute = datetime.second() as i64;
    let second_of_hour = datetime.minute() as i64 * MINUTE_LEN + second_of_minute;
    let second_of_day = datetime.hour() as i64 * HOUR_LEN + second_of_hour;
    match period {
        Period::Minute => time - second_of_minute,
        Period::Hour => time - second_of_hour,
        Period::Day => time - second_of_day,
        Period::Week => time - datetime.weekday().num_days_from_monday() as i64 * DAY_LEN - second_of_day,
        Period::Month => time - datetime.day0() as i64 * DAY_LEN - second_of_day,
        Period::Infinity => time,
    }
}

pub fn next_period_begin(period: Period, begin: i64) -> i64 {
    if period == Period::Infinity { MAX_TIME } else { begin + period_length(period) }
}

pub fn day_of_week(time: i64) -> Option<DayOfWeek> {
    match Local.timestamp_opt(time, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            Some(DayOfWeek::from_days_from_monday(dt.weekday().num_days_from_monday()))
        }
        chrono::LocalResult::None => None,
    }
}

/// Window `[start, end)` of the instance of `index` periods after `period_start`, or `None` if the template
/// does not apply to that period.
///
/// Start/end offsets are relative to the period beginning; the end defaults to `start + duration`, or to the end
/// of the period. With an infinite period, offsets greater than a year are absolute times.
/// The window never starts before `now` and is clipped to the enable/disable times of the template.
pub fn slot_window(config: &StandingReservationConfig, period_start: i64, index: usize, now: i64) -> Option<(i64, i64)> {
    let (mut start, mut end) = if config.period == Period::Infinity {
        if index > 0 {
            return None;
        }
        let start = match config.start_time {
            Some(start) if start > YEAR_LEN => start,
            Some(offset) => period_start + offset,
            None => period_start,
        };
        let end = match (config.end_time, config.duration) {
            (Some(end), _) if end > YEAR_LEN => end,
            (Some(offset), _) => period_start + offset,
            (None, Some(duration)) => start + duration,
            (None, None) => MAX_TIME,
        };
        (start, end)
    } else {
        let base = period_start + index as i64 * period_length(config.period);
        if let Some(days) = &config.days {
            if !day_of_week(base).is_some_and(|day| days.contains(&day)) {
                return None;
            }
        }
        let start_offset = config.start_time.unwrap_or(0);
        let end_offset = config
            .end_time
            .or(config.duration.map(|d| start_offset + d))
            .unwrap_or(period_length(config.period));
        (base + start_offset, base + end_offset)
    };

    start = start.max(now);
    if let Some(enable) = config.enable_time {
        start = start.max(enable);
    }
    if let Some(disable) = config.disable_time {
        end = end.min(disable);
    }
    end = end.min(MAX_TIME);
    if end <= start {
        return None;
    }
    if config.disabled_times.iter().any(|w| w.overlaps(start, end)) {
        return None;
    }
    Some((start, end))
}
