//! Decides when the cumulative-time notification fires. The threshold lives
//! in storage as `nextAlertAt` and always sits on a multiple of the
//! notification rate, so alerts come at regular accumulated intervals no
//! matter when exactly a commit lands.

use crate::{
    storage::schema::{domain_seconds, StorageMap},
    utils::format::format_time,
};

/// The next `totalSecs` threshold at which a notification is due.
pub fn next_alert_at(rate_mins: i64, total_secs: f64) -> f64 {
    let rate_secs = (rate_mins * 60) as f64;
    total_secs + (rate_secs - total_secs.rem_euclid(rate_secs))
}

/// Today's domains, heaviest first.
pub fn sorted_domains(storage: &StorageMap) -> Vec<(String, f64)> {
    let mut domains = domain_seconds(storage);
    domains.sort_by(|a, b| b.1.total_cmp(&a.1));
    domains
}

/// Notification body: the top domains of the day, one per line.
pub fn notification_message(storage: &StorageMap) -> String {
    sorted_domains(storage)
        .iter()
        .take(3)
        .map(|(domain, secs)| format!("{}  {}\n", format_time(*secs), domain))
        .collect()
}
