//! First-run initialization. A store without a day start offset is considered
//! uninitialized and gets the full default layout; anything already present
//! is never overwritten.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::Value;
use tracing::info;

use crate::{
    storage::{
        schema::{self, keys, StorageMap, Summary, TimerMode, Today, OPTION_KEYS},
        store::KeyValueStore,
    },
    utils::clock::Clock,
};

use super::{
    alerts::next_alert_at,
    calendar::{next_day_starts_at, today_for},
};

pub async fn ensure_initialized(store: &impl KeyValueStore, clock: &impl Clock) -> Result<()> {
    let existing = store.get_all().await?;
    if existing.contains_key(keys::DAY_START_OFFSET) {
        return Ok(());
    }
    info!("Uninitialized storage, writing the default layout");
    store
        .set(initial_storage(existing, clock.time(), clock.local_offset())?)
        .await
}

/// Deletes every tally and summary but keeps the user options, then lays the
/// defaults back down.
pub async fn reset_all_data(store: &impl KeyValueStore, clock: &impl Clock) -> Result<()> {
    let options = store.get(&OPTION_KEYS).await?;
    store.clear().await?;
    store
        .set(initial_storage(options, clock.time(), clock.local_offset())?)
        .await
}

/// Fills in every missing value of the storage layout. Existing entries win
/// over defaults, except `nextDayStartsAt` which is always recomputed from
/// `today` and the offset.
pub fn initial_storage(
    existing: StorageMap,
    now: DateTime<Utc>,
    tz: FixedOffset,
) -> Result<StorageMap> {
    let mut storage = existing;

    let simple_defaults: [(&str, Value); 8] = [
        (keys::BUTTON_BADGE_TOTAL, false.into()),
        (keys::NOTIFICATIONS_ON, false.into()),
        (keys::NOTIFICATIONS_RATE, 60.into()),
        (keys::DAY_START_OFFSET, 0.into()),
        (keys::WHITELIST, Value::Array(vec![])),
        (keys::TIMER_MODE, schema::encode(&TimerMode::default())?),
        (keys::TOTAL_SECS, 0.0.into()),
        (keys::DAYS, Value::Array(vec![])),
    ];
    for (key, value) in simple_defaults {
        storage.entry(key.to_owned()).or_insert(value);
    }

    let options = schema::options_from(&storage);

    if !storage.contains_key(keys::NEXT_ALERT_AT) {
        let total_secs = schema::get_f64(&storage, keys::TOTAL_SECS).unwrap_or(0.0);
        storage.insert(
            keys::NEXT_ALERT_AT.into(),
            next_alert_at(options.notifications_rate, total_secs).into(),
        );
    }

    let day_num = match schema::decode::<Today>(&storage, keys::TODAY)? {
        Some(today) => today.day_num,
        None => {
            let today = today_for(now, options.day_start_offset, tz);
            let day_num = today.day_num;
            storage.insert(keys::TODAY.into(), schema::encode(&today)?);
            day_num
        }
    };
    storage.insert(
        keys::NEXT_DAY_STARTS_AT.into(),
        next_day_starts_at(day_num, options.day_start_offset, tz).into(),
    );

    if !storage.contains_key(keys::PAST_7_DAY_SUM) {
        storage.insert(
            keys::PAST_7_DAY_SUM.into(),
            schema::encode(&Summary::empty_week())?,
        );
    }
    if !storage.contains_key(keys::WEEK_SUMS) {
        storage.insert(
            keys::WEEK_SUMS.into(),
            schema::encode(&vec![Summary::empty_week(); 10])?,
        );
    }
    if !storage.contains_key(keys::MONTH_SUMS) {
        storage.insert(
            keys::MONTH_SUMS.into(),
            schema::encode(&vec![Summary::empty_month(); 6])?,
        );
    }

    Ok(storage)
}
