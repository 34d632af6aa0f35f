//! The options surface: user settings live in the same store the tracker
//! reads, so saving them here is what the tracker reacts to.

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use url::Url;

use crate::{
    storage::{
        schema::{keys, options_from, StorageMap},
        store::KeyValueStore,
    },
    utils::format::format_time,
};

#[derive(Parser, Debug)]
pub struct OptionsArgs {
    /// Show the day total in the toolbar badge instead of the current site.
    #[arg(long)]
    pub badge_total: Option<bool>,
    /// Show a notification whenever another interval of browsing time is
    /// reached.
    #[arg(long)]
    pub notifications: Option<bool>,
    /// Minutes of browsing between notifications.
    #[arg(long)]
    pub notifications_rate: Option<i64>,
    /// Hour at which a new day starts, for counting late evenings into the
    /// same day.
    #[arg(long)]
    pub day_start_offset: Option<i64>,
    /// Comma-separated sites that should never be timed.
    #[arg(long)]
    pub whitelist: Option<String>,
}

impl OptionsArgs {
    fn is_empty(&self) -> bool {
        self.badge_total.is_none()
            && self.notifications.is_none()
            && self.notifications_rate.is_none()
            && self.day_start_offset.is_none()
            && self.whitelist.is_none()
    }
}

/// Writes the given options into the store, then prints the resulting state.
/// Called with no flags it just prints.
pub async fn process_options_command(
    store: &impl KeyValueStore,
    args: OptionsArgs,
) -> Result<()> {
    if !args.is_empty() {
        let mut update = StorageMap::new();
        if let Some(badge_total) = args.badge_total {
            update.insert(keys::BUTTON_BADGE_TOTAL.into(), badge_total.into());
        }
        if let Some(notifications) = args.notifications {
            update.insert(keys::NOTIFICATIONS_ON.into(), notifications.into());
        }
        if let Some(rate) = args.notifications_rate {
            update.insert(keys::NOTIFICATIONS_RATE.into(), rate.into());
        }
        if let Some(offset) = args.day_start_offset {
            update.insert(keys::DAY_START_OFFSET.into(), offset.into());
        }
        if let Some(whitelist) = args.whitelist {
            update.insert(
                keys::WHITELIST.into(),
                serde_json::to_value(sanitize_whitelist(&whitelist))?,
            );
        }
        store.set(update).await?;
    }

    let options = options_from(&store.get_all().await?);
    println!("badge shows total     {}", options.button_badge_total);
    println!("notifications         {}", options.notifications_on);
    println!("notifications rate    {} min", options.notifications_rate);
    println!("day start offset      {} h", options.day_start_offset);
    println!("whitelist             {}", options.whitelist.join(", "));
    Ok(())
}

/// Prints today's total and its per-domain breakdown, heaviest site first.
pub async fn process_today_command(store: &impl KeyValueStore) -> Result<()> {
    let storage = store.get_all().await?;
    let total_secs = crate::storage::schema::get_f64(&storage, keys::TOTAL_SECS).unwrap_or(0.0);
    println!("{} today", format_time(total_secs));
    for (domain, secs) in crate::tracker::alerts::sorted_domains(&storage) {
        println!("{}  {domain}", format_time(secs));
    }
    Ok(())
}

/// Takes the raw whitelist input and produces the stored form: hosts only,
/// deduplicated, in input order. Entries that can't be understood as a url
/// are skipped one by one.
pub fn sanitize_whitelist(raw: &str) -> Vec<String> {
    let mut whitelist: Vec<String> = vec![];

    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        // Bare hosts only parse once a scheme is bolted on.
        let host = Url::parse(item)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .or_else(|| {
                Url::parse(&format!("http://{item}"))
                    .ok()
                    .and_then(|url| url.host_str().map(str::to_owned))
            });

        match host {
            Some(host) if !whitelist.contains(&host) => whitelist.push(host),
            Some(_) => {}
            None => warn!("Skipping unparseable whitelist entry {item:?}"),
        }
    }
    whitelist
}
