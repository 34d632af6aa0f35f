//! Handles shuffling data when an accounting day ends: the finished day is
//! archived, week/month/past-7-days summaries are rebuilt, and the per-domain
//! counters are cleared for the new day.

use anyhow::Result;
use chrono::{DateTime, Datelike, FixedOffset, Utc};

use crate::storage::schema::{
    self, domain_keys, domain_seconds, keys, options_from, DaySummary, StorageMap, Summary,
};

use super::{
    alerts::next_alert_at,
    calendar::{
        date_with_offset, day_date, day_number, month_name, next_day_starts_at, past7_header_text,
        today_for, week_header_text, week_number,
    },
};

/// Days of history to keep.
const DAYS_KEPT: usize = 70;
const WEEK_SUMS_KEPT: usize = 10;
const MONTH_SUMS_KEPT: usize = 6;

/// Takes a day's domain seconds and produces the archived form: rounded to
/// whole seconds, zero entries dropped, heaviest domain first.
pub fn sorted_rounded_domains(domain_data: &[(String, f64)]) -> Vec<(String, i64)> {
    let mut result: Vec<(String, i64)> = domain_data
        .iter()
        .map(|(domain, secs)| (domain.clone(), secs.round() as i64))
        .filter(|(_, secs)| *secs != 0)
        .collect();
    result.sort_by(|a, b| b.1.cmp(&a.1));
    result
}

/// Merges a subset of archived days into one domain list and total.
fn combine_days(days: &[&DaySummary]) -> (Vec<(String, i64)>, i64) {
    let mut total_secs = 0;
    let mut merged = std::collections::HashMap::<&str, i64>::new();
    for day in days {
        total_secs += day.total_secs;
        for (domain, secs) in &day.dmns_array {
            *merged.entry(domain).or_default() += secs;
        }
    }

    let mut dmns_array: Vec<(String, i64)> = merged
        .into_iter()
        .filter(|(_, secs)| *secs != 0)
        .map(|(domain, secs)| (domain.to_owned(), secs))
        .collect();
    dmns_array.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    (dmns_array, total_secs)
}

/// Per-day totals of a subset, earliest day first.
fn daily_totals(days: &[&DaySummary]) -> Vec<(String, i64, i64)> {
    let mut totals: Vec<(String, i64, i64)> = days
        .iter()
        .map(|day| (day.header_text.clone(), day.total_secs, day.day_num))
        .collect();
    totals.sort_by_key(|entry| entry.2);
    totals
}

fn make_week_summary(week_num: i64, days: &[DaySummary]) -> Summary {
    let subset: Vec<&DaySummary> = days.iter().filter(|day| day.week_num == week_num).collect();
    let (dmns_array, total_secs) = combine_days(&subset);
    Summary {
        dmns_array,
        total_secs,
        header_text: week_header_text(week_num),
        days_array: Some(daily_totals(&subset)),
        week_num: Some(week_num),
        month_num: None,
        first_day_num: None,
    }
}

fn make_month_summary(month_num: u32, days: &[DaySummary]) -> Summary {
    let subset: Vec<&DaySummary> = days
        .iter()
        .filter(|day| day.month_num == month_num)
        .collect();
    let (dmns_array, total_secs) = combine_days(&subset);
    Summary {
        dmns_array,
        total_secs,
        header_text: month_name(month_num).to_owned(),
        days_array: None,
        week_num: None,
        month_num: Some(month_num),
        first_day_num: None,
    }
}

fn make_past7_summary(day_num_now: i64, days: &[DaySummary]) -> Summary {
    let subset: Vec<&DaySummary> = days
        .iter()
        .filter(|day| day.day_num > day_num_now - 8 && day.day_num < day_num_now)
        .collect();
    let (dmns_array, total_secs) = combine_days(&subset);
    Summary {
        dmns_array,
        total_secs,
        header_text: past7_header_text(day_num_now),
        days_array: Some(daily_totals(&subset)),
        week_num: None,
        month_num: None,
        first_day_num: Some(day_num_now - 7),
    }
}

/// Replaces the in-progress summary at the head of the list, or prepends a
/// fresh one after a boundary change, keeping at most `cap` entries.
fn place_current(sums: &mut Vec<Summary>, current: Summary, changed: bool, cap: usize) {
    if changed || sums.is_empty() {
        sums.insert(0, current);
        sums.truncate(cap);
    } else {
        sums[0] = current;
    }
}

/// Moves the finished day out of the live counters and into history.
///
/// Only ever advances one step: if the host was suspended over several days,
/// the whole gap is archived under the old day number and the skipped days
/// simply contribute nothing. Calling this again for the same day number is a
/// no-op. Returns the domain keys that the caller must delete from storage.
pub fn advance_day(
    storage: &mut StorageMap,
    now: DateTime<Utc>,
    tz: FixedOffset,
) -> Result<Vec<String>> {
    let options = options_from(storage);
    let today: crate::storage::schema::Today = schema::require(storage, keys::TODAY)?;

    let day_num_now = day_number(date_with_offset(now, options.day_start_offset), tz);
    if day_num_now <= today.day_num {
        return Ok(vec![]);
    }
    let week_num_now = week_number(day_num_now);
    let month_num_now = day_date(day_num_now).month();

    let total_secs = schema::get_f64(storage, keys::TOTAL_SECS).unwrap_or(0.0);
    let domain_data = domain_seconds(storage);

    let mut days: Vec<DaySummary> = schema::decode(storage, keys::DAYS)?.unwrap_or_default();
    days.insert(
        0,
        DaySummary {
            day_num: today.day_num,
            dmns_array: sorted_rounded_domains(&domain_data),
            total_secs: total_secs.round() as i64,
            header_text: today.header_text.clone(),
            month_num: today.month_num,
            week_num: today.week_num,
        },
    );
    days.truncate(DAYS_KEPT);

    let mut week_sums: Vec<Summary> = schema::decode(storage, keys::WEEK_SUMS)?.unwrap_or_default();
    let week_changed = today.week_num != week_num_now;
    if week_changed {
        // Final version of the outgoing week before the new one takes its place.
        let finalized = make_week_summary(today.week_num, &days);
        match week_sums.first_mut() {
            Some(head) => *head = finalized,
            None => week_sums.push(finalized),
        }
    }
    place_current(
        &mut week_sums,
        make_week_summary(week_num_now, &days),
        week_changed,
        WEEK_SUMS_KEPT,
    );

    let mut month_sums: Vec<Summary> =
        schema::decode(storage, keys::MONTH_SUMS)?.unwrap_or_default();
    let month_changed = today.month_num != month_num_now;
    if month_changed {
        let finalized = make_month_summary(today.month_num, &days);
        match month_sums.first_mut() {
            Some(head) => *head = finalized,
            None => month_sums.push(finalized),
        }
    }
    place_current(
        &mut month_sums,
        make_month_summary(month_num_now, &days),
        month_changed,
        MONTH_SUMS_KEPT,
    );

    let past7 = make_past7_summary(day_num_now, &days);

    let removed = domain_keys(storage);
    for key in &removed {
        storage.remove(key);
    }

    storage.insert(
        keys::TODAY.into(),
        schema::encode(&today_for(now, options.day_start_offset, tz))?,
    );
    storage.insert(
        keys::NEXT_DAY_STARTS_AT.into(),
        next_day_starts_at(day_num_now, options.day_start_offset, tz).into(),
    );
    storage.insert(keys::DAYS.into(), schema::encode(&days)?);
    storage.insert(keys::WEEK_SUMS.into(), schema::encode(&week_sums)?);
    storage.insert(keys::MONTH_SUMS.into(), schema::encode(&month_sums)?);
    storage.insert(keys::PAST_7_DAY_SUM.into(), schema::encode(&past7)?);
    storage.insert(keys::TOTAL_SECS.into(), 0.0.into());
    storage.insert(
        keys::NEXT_ALERT_AT.into(),
        next_alert_at(options.notifications_rate, 0.0).into(),
    );

    Ok(removed)
}
