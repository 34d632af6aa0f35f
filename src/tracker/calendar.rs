//! Day, week and month boundary arithmetic. Everything here is pure over
//! `(now, day start offset, time zone offset)` so boundary behavior can be
//! pinned down in tests.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};

use crate::storage::schema::Today;

pub const ONE_DAY_MS: i64 = 86_400_000;
const ONE_HOUR_MS: i64 = 3_600_000;

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

// Index 0 is December so that `month_num % 12` wraps the table.
const MONTH_NAMES: [&str; 12] = [
    "December",
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
];

/// Count of days since 1/1/1970, aligned to local midnight.
pub fn day_number(now: DateTime<Utc>, tz: FixedOffset) -> i64 {
    let local_ms = now.timestamp_millis() + i64::from(tz.local_minus_utc()) * 1000;
    local_ms.div_euclid(ONE_DAY_MS)
}

/// Day number of the most recent Sunday, which anchors a week. Day 3 was a
/// Sunday, and counting from it sidesteps time-zone-dependent weekday lookups.
pub fn week_number(day_num: i64) -> i64 {
    day_num - (day_num - 3).rem_euclid(7)
}

/// The instant, in epoch milliseconds, at which the accounting day after
/// `day_num` begins.
pub fn next_day_starts_at(day_num: i64, day_start_offset_hours: i64, tz: FixedOffset) -> i64 {
    (day_num + 1) * ONE_DAY_MS - i64::from(tz.local_minus_utc()) * 1000
        + day_start_offset_hours * ONE_HOUR_MS
}

/// Shifts the current moment back by the day start offset, so that for a 4am
/// day start everything before 4am still belongs to the previous day.
pub fn date_with_offset(now: DateTime<Utc>, day_start_offset_hours: i64) -> DateTime<Utc> {
    now - Duration::hours(day_start_offset_hours)
}

/// Calendar date a day number falls on.
pub fn day_date(day_num: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() + Duration::days(day_num)
}

/// A fresh [Today] for the accounting day `now` falls into.
pub fn today_for(now: DateTime<Utc>, day_start_offset_hours: i64, tz: FixedOffset) -> Today {
    let day_num = day_number(date_with_offset(now, day_start_offset_hours), tz);
    let date = day_date(day_num);
    Today {
        day_num,
        week_num: week_number(day_num),
        month_num: date.month(),
        header_text: day_header_text(date),
    }
}

pub fn day_header_text(date: NaiveDate) -> String {
    let day_name = DAY_NAMES[date.weekday().num_days_from_sunday() as usize];
    format!("{}   {}/{}", day_name, date.month(), date.day())
}

pub fn month_name(month_num: u32) -> &'static str {
    MONTH_NAMES[(month_num % 12) as usize]
}

/// Header spanning the Sunday..Saturday range of a week.
pub fn week_header_text(week_num: i64) -> String {
    let from = day_date(week_num);
    let to = day_date(week_num + 6);
    format!(
        "Week {}/{} - {}/{}",
        from.month(),
        from.day(),
        to.month(),
        to.day()
    )
}

/// Header spanning the seven completed days before `day_num`.
pub fn past7_header_text(day_num: i64) -> String {
    let from = day_date(day_num - 7);
    let to = day_date(day_num - 1);
    format!(
        "Past 7 Days   {}/{} - {}/{}",
        from.month(),
        from.day(),
        to.month(),
        to.day()
    )
}
