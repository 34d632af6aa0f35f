//! Shape of the data kept in the key-value store. Reserved keys hold options
//! and summaries, every other key is a domain with its seconds for today.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Names of the control keys.
pub mod keys {
    pub const DAYS: &str = "days";
    pub const MONTH_SUMS: &str = "monthSums";
    pub const NEXT_ALERT_AT: &str = "nextAlertAt";
    pub const NEXT_DAY_STARTS_AT: &str = "nextDayStartsAt";
    pub const BUTTON_BADGE_TOTAL: &str = "oButtonBadgeTotal";
    pub const DAY_START_OFFSET: &str = "oDayStartOffset";
    pub const NOTIFICATIONS_ON: &str = "oNotificationsOn";
    pub const NOTIFICATIONS_RATE: &str = "oNotificationsRate";
    pub const WHITELIST: &str = "oWhitelistArray";
    pub const PAST_7_DAY_SUM: &str = "past7daySum";
    pub const TIMER_MODE: &str = "timerMode";
    pub const TODAY: &str = "today";
    pub const TOTAL_SECS: &str = "totalSecs";
    pub const WEEK_SUMS: &str = "weekSums";
}

/// All keys in storage that aren't domains. Anything outside this list is a
/// per-domain tally for the current day.
pub const RESERVED_KEYS: [&str; 14] = [
    keys::DAYS,
    keys::MONTH_SUMS,
    keys::NEXT_ALERT_AT,
    keys::NEXT_DAY_STARTS_AT,
    keys::BUTTON_BADGE_TOTAL,
    keys::DAY_START_OFFSET,
    keys::NOTIFICATIONS_ON,
    keys::NOTIFICATIONS_RATE,
    keys::WHITELIST,
    keys::PAST_7_DAY_SUM,
    keys::TIMER_MODE,
    keys::TODAY,
    keys::TOTAL_SECS,
    keys::WEEK_SUMS,
];

/// The user-editable subset, preserved when all tracked data is deleted.
pub const OPTION_KEYS: [&str; 5] = [
    keys::BUTTON_BADGE_TOTAL,
    keys::DAY_START_OFFSET,
    keys::NOTIFICATIONS_ON,
    keys::NOTIFICATIONS_RATE,
    keys::WHITELIST,
];

pub type StorageMap = BTreeMap<String, Value>;

/// Identity of the accounting day currently collecting domain tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Today {
    pub day_num: i64,
    pub week_num: i64,
    pub month_num: u32,
    pub header_text: String,
}

/// An archived day. `dmns_array` is sorted by seconds descending and never
/// contains zero entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub day_num: i64,
    pub dmns_array: Vec<(String, i64)>,
    pub total_secs: i64,
    pub header_text: String,
    pub month_num: u32,
    pub week_num: i64,
}

/// Aggregate over a set of days. Week and past-7-days summaries carry a
/// per-day breakdown in `days_array`, month summaries don't.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub dmns_array: Vec<(String, i64)>,
    pub total_secs: i64,
    pub header_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_array: Option<Vec<(String, i64, i64)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_num: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_day_num: Option<i64>,
}

impl Summary {
    pub fn empty_week() -> Self {
        Summary {
            days_array: Some(vec![]),
            ..Summary::default()
        }
    }

    pub fn empty_month() -> Self {
        Summary::default()
    }
}

/// Tracking policy. Serialized as the single letters the storage contract
/// uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerMode {
    /// No tracking at all, badge stays blank.
    #[serde(rename = "O")]
    Off,
    /// Per-domain tracking with idle detection.
    #[default]
    #[serde(rename = "D")]
    Default,
    /// Keeps timing despite inactivity, for watching videos.
    #[serde(rename = "G")]
    Green,
    /// Logs only the total, not which sites were visited.
    #[serde(rename = "B")]
    Blue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub button_badge_total: bool,
    pub notifications_on: bool,
    pub notifications_rate: i64,
    pub day_start_offset: i64,
    pub whitelist: Vec<String>,
    pub timer_mode: TimerMode,
}

/// Reads the options out of a storage snapshot, falling back to the defaults
/// for anything missing or malformed.
pub fn options_from(storage: &StorageMap) -> Options {
    Options {
        button_badge_total: get_bool(storage, keys::BUTTON_BADGE_TOTAL).unwrap_or(false),
        notifications_on: get_bool(storage, keys::NOTIFICATIONS_ON).unwrap_or(false),
        notifications_rate: get_i64(storage, keys::NOTIFICATIONS_RATE).unwrap_or(60),
        day_start_offset: get_i64(storage, keys::DAY_START_OFFSET).unwrap_or(0),
        whitelist: decode(storage, keys::WHITELIST)
            .ok()
            .flatten()
            .unwrap_or_default(),
        timer_mode: decode(storage, keys::TIMER_MODE)
            .ok()
            .flatten()
            .unwrap_or_default(),
    }
}

pub fn is_domain_key(key: &str) -> bool {
    !RESERVED_KEYS.contains(&key)
}

pub fn domain_keys(storage: &StorageMap) -> Vec<String> {
    storage
        .keys()
        .filter(|key| is_domain_key(key))
        .cloned()
        .collect()
}

/// Seconds accumulated today for every visited domain.
pub fn domain_seconds(storage: &StorageMap) -> Vec<(String, f64)> {
    storage
        .iter()
        .filter(|(key, _)| is_domain_key(key))
        .map(|(key, value)| (key.clone(), value.as_f64().unwrap_or(0.0)))
        .collect()
}

pub fn get_f64(storage: &StorageMap, key: &str) -> Option<f64> {
    storage.get(key).and_then(Value::as_f64)
}

pub fn get_i64(storage: &StorageMap, key: &str) -> Option<i64> {
    storage.get(key).and_then(Value::as_i64)
}

pub fn get_bool(storage: &StorageMap, key: &str) -> Option<bool> {
    storage.get(key).and_then(Value::as_bool)
}

/// Deserializes a stored value. Absent keys are `Ok(None)`, a present but
/// malformed value is an error.
pub fn decode<T: DeserializeOwned>(storage: &StorageMap, key: &str) -> Result<Option<T>> {
    storage
        .get(key)
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()
        .with_context(|| format!("Malformed value under {key}"))
}

pub fn require<T: DeserializeOwned>(storage: &StorageMap, key: &str) -> Result<T> {
    decode(storage, key)?.ok_or_else(|| anyhow!("Missing storage value {key}"))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
