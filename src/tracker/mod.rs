//! The time accounting core. Two operations carry the whole design: clock on
//! remembers a domain and a starting stamp, clock off turns the elapsed time
//! into storage updates. Every browser event first tries to clock off and
//! then re-evaluates what, if anything, to clock on next, so no interval is
//! ever counted twice or left dangling.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    browser_api::{
        native::NativeBridge, ActiveContext, Browser, BrowserEvent, IdleState, UserInterface,
        WINDOW_ID_NONE,
    },
    storage::{
        schema::{self, keys, StorageMap, TimerMode},
        store::{KeyValueStore, LocalStore, StorageChanges},
    },
    utils::{
        clock::{Clock, DefaultClock},
        format::{format_time, format_time_minimal},
    },
};

use self::state::{PendingDismiss, PendingEval, Timing, TrackerState};

pub mod alerts;
pub mod bootstrap;
pub mod calendar;
pub mod modes;
pub mod rollover;
pub mod shutdown;
pub mod state;

pub const IDLE_TIMEOUT_SECS: u32 = 15;

/// Bursts of browser events within this window collapse into one evaluation.
const PRE_CLOCK_ON_DEBOUNCE: Duration = Duration::from_millis(50);

/// Guards against spurious zero-length intervals from event churn.
const MIN_COMMIT_SECS: f64 = 0.5;

const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(8);

/// Stand-in domain that accumulates all time in Blue mode, where real site
/// names are never recorded.
pub const TIME_ONLY_DOMAIN: &str = "time-only.invalid";
const TIME_ONLY_URL: &str = "http://time-only.invalid/";

/// Stand-in for private browsing contexts. Never clockable.
pub const PRIVATE_DOMAIN: &str = "private.invalid";

/// Represents the starting point for the tracking host.
pub async fn start_tracker(dir: PathBuf) -> Result<()> {
    let store = Arc::new(LocalStore::open(dir.join("storage.json")).await?);
    let clock = Arc::new(DefaultClock);
    bootstrap::ensure_initialized(store.as_ref(), clock.as_ref()).await?;

    let (bridge, events) = NativeBridge::connect(tokio::io::stdin(), tokio::io::stdout());

    let shutdown_token = CancellationToken::new();
    tokio::spawn(shutdown::detect_shutdown(shutdown_token.clone()));

    let tracker = Tracker::new(
        store,
        bridge.clone(),
        bridge,
        events,
        clock,
        shutdown_token,
    );
    tracker
        .run()
        .await
        .inspect_err(|e| error!("Tracker got an error {:?}", e))
}

enum Wake {
    Shutdown,
    Event(Option<BrowserEvent>),
    Change(Result<StorageChanges, broadcast::error::RecvError>),
    Evaluate,
    Rearm,
    Dismiss,
}

/// Owns the tracking state machine and reacts to browser events, storage
/// changes and its own timers.
pub struct Tracker {
    store: Arc<dyn KeyValueStore>,
    browser: Arc<dyn Browser>,
    ui: Arc<dyn UserInterface>,
    clock: Arc<dyn Clock>,
    events: mpsc::Receiver<BrowserEvent>,
    changes: broadcast::Receiver<StorageChanges>,
    shutdown: CancellationToken,
    state: TrackerState,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        browser: Arc<dyn Browser>,
        ui: Arc<dyn UserInterface>,
        events: mpsc::Receiver<BrowserEvent>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let changes = store.subscribe();
        Self {
            store,
            browser,
            ui,
            clock,
            events,
            changes,
            shutdown,
            state: TrackerState::new(),
        }
    }

    /// Executes the tracker event loop until shutdown or until the browser
    /// closes the event stream.
    pub async fn run(mut self) -> Result<()> {
        let initial_mode = self
            .store
            .get(&[keys::TIMER_MODE])
            .await
            .ok()
            .and_then(|s| schema::decode(&s, keys::TIMER_MODE).ok().flatten())
            .unwrap_or_default();
        self.apply_mode(initial_mode).await;

        loop {
            let eval_due = self.state.pending_eval.as_ref().map(|p| p.due);
            let rearm_due = self.state.rearm_at;
            let dismiss_due = self.state.pending_dismiss.as_ref().map(|p| p.due);
            let clock = self.clock.clone();

            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                event = self.events.recv() => Wake::Event(event),
                change = self.changes.recv() => Wake::Change(change),
                _ = sleep_until_opt(clock.as_ref(), eval_due) => Wake::Evaluate,
                _ = sleep_until_opt(clock.as_ref(), rearm_due) => Wake::Rearm,
                _ = sleep_until_opt(clock.as_ref(), dismiss_due) => Wake::Dismiss,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Event(None) => {
                    debug!("Browser event stream ended");
                    break;
                }
                Wake::Event(Some(event)) => self.handle_browser_event(event).await,
                Wake::Change(Ok(changes)) => self.handle_storage_change(changes).await,
                Wake::Change(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("Missed {skipped} storage change notifications")
                }
                Wake::Change(Err(broadcast::error::RecvError::Closed)) => break,
                Wake::Evaluate => {
                    if let Some(pending) = self.state.pending_eval.take() {
                        self.evaluate(pending.context).await;
                    }
                }
                Wake::Rearm => {
                    // Periodic refresh while the user stays on one site, so
                    // badge and notifications move at least once a minute.
                    self.state.rearm_at = None;
                    self.clock_off().await;
                    self.schedule_eval(None);
                }
                Wake::Dismiss => {
                    if let Some(PendingDismiss { id, .. }) = self.state.pending_dismiss.take() {
                        if let Err(e) = self.ui.clear_notification(&id).await {
                            error!("Could not clear notification {id}: {e:?}");
                        }
                    }
                }
            }
        }

        // Commit whatever is on the clock so shutdown doesn't drop time.
        self.clock_off().await;
        Ok(())
    }

    async fn handle_browser_event(&mut self, event: BrowserEvent) {
        let listeners = self.state.listeners;
        match event {
            BrowserEvent::TabUpdated { context } if listeners.tabs => {
                debug!("Tab updated {}", context.url);
                self.clock_off().await;
                self.schedule_eval(Some(context));
            }
            BrowserEvent::TabActivated { context } if listeners.tabs => {
                debug!("Tab activated");
                self.clock_off().await;
                self.schedule_eval(context);
            }
            BrowserEvent::TabRemoved if listeners.tabs => {
                debug!("Tab removed");
                self.clock_off().await;
            }
            BrowserEvent::WindowFocusChanged { window_id } if listeners.windows => {
                debug!("Window focus changed to {window_id}");
                self.clock_off().await;
                if window_id != WINDOW_ID_NONE {
                    self.schedule_eval(None);
                }
            }
            BrowserEvent::IdleStateChanged { state } if listeners.idle => {
                self.handle_idle_change(state).await;
            }
            other => debug!("Ignoring {other:?} outside the active listener set"),
        }
    }

    /// Idle only matters while a browser window has focus. Going idle or
    /// locked clocks off, becoming active again clocks back on.
    async fn handle_idle_change(&mut self, idle_state: IdleState) {
        match self.browser.window_focused().await {
            Ok(true) => {
                self.clock_off().await;
                if idle_state == IdleState::Active {
                    self.schedule_eval(None);
                }
            }
            Ok(false) => (),
            Err(e) => error!("Could not query window focus {e:?}"),
        }
    }

    async fn handle_storage_change(&mut self, changes: StorageChanges) {
        if let Some(change) = changes.get(keys::TIMER_MODE) {
            let new_mode: Option<TimerMode> = change
                .new_value
                .as_ref()
                .and_then(|value| serde_json::from_value(value.clone()).ok());
            if let Some(new_mode) = new_mode {
                if new_mode != self.state.mode {
                    info!("Timer mode changed to {new_mode:?}");
                    self.apply_mode(new_mode).await;
                }
            }
        }

        let notifications_changed = [keys::NOTIFICATIONS_ON, keys::NOTIFICATIONS_RATE]
            .iter()
            .any(|key| {
                changes
                    .get(*key)
                    .is_some_and(|change| change.new_value.is_some())
            });
        if notifications_changed {
            if let Err(e) = self.handle_notifications_change().await {
                error!("Could not rearm the notification threshold {e:?}");
            }
        }

        if let Some(change) = changes.get(keys::DAY_START_OFFSET) {
            if change.new_value.is_some() && change.new_value != change.old_value {
                if let Err(e) = self.handle_day_start_offset_change().await {
                    error!("Could not apply the day start offset change {e:?}");
                }
            }
        }

        if changes
            .get(keys::WHITELIST)
            .is_some_and(|change| change.new_value.is_some())
        {
            // Clear the current timing so a freshly whitelisted site doesn't
            // get logged.
            self.clock_off().await;
            self.schedule_eval(None);
        }
    }

    async fn handle_notifications_change(&mut self) -> Result<()> {
        let from_storage = self
            .store
            .get(&[keys::NOTIFICATIONS_RATE, keys::TOTAL_SECS])
            .await?;
        let rate = schema::get_i64(&from_storage, keys::NOTIFICATIONS_RATE).unwrap_or(60);
        let total_secs = schema::get_f64(&from_storage, keys::TOTAL_SECS).unwrap_or(0.0);

        let mut update = StorageMap::new();
        update.insert(
            keys::NEXT_ALERT_AT.into(),
            alerts::next_alert_at(rate, total_secs).into(),
        );
        self.store.set(update).await
    }

    /// Moving the day boundary may move the current moment into a new
    /// accounting day, in which case the rollover happens right away instead
    /// of waiting for the next activity.
    async fn handle_day_start_offset_change(&mut self) -> Result<()> {
        let now = self.clock.time();
        let tz = self.clock.local_offset();
        let from_storage = self
            .store
            .get(&[keys::DAY_START_OFFSET, keys::TODAY])
            .await?;
        let offset = schema::get_i64(&from_storage, keys::DAY_START_OFFSET).unwrap_or(0);
        let day_num = calendar::day_number(calendar::date_with_offset(now, offset), tz);

        let mut update = StorageMap::new();
        update.insert(
            keys::NEXT_DAY_STARTS_AT.into(),
            calendar::next_day_starts_at(day_num, offset, tz).into(),
        );
        self.store.set(update).await?;

        let today: Option<schema::Today> = schema::decode(&from_storage, keys::TODAY)?;
        if today.is_some_and(|today| day_num > today.day_num) {
            self.perform_rollover(now).await?;
        }
        Ok(())
    }

    /// Switches the tracking policy: clocks off, applies the listener diff,
    /// repaints the badge and re-evaluates what to track now.
    async fn apply_mode(&mut self, mode: TimerMode) {
        self.clock_off().await;

        let new_listeners = mode.listener_set();
        for (listener, attached) in self.state.listeners.diff(new_listeners) {
            debug!(
                "{} {listener} listener",
                if attached { "Attaching" } else { "Detaching" }
            );
            if listener == "idle" {
                if let Err(e) = self
                    .browser
                    .configure_idle(attached, IDLE_TIMEOUT_SECS)
                    .await
                {
                    error!("Could not reconfigure idle detection {e:?}");
                }
            }
        }
        self.state.listeners = new_listeners;
        self.state.mode = mode;

        let button_badge_total = self
            .store
            .get(&[keys::BUTTON_BADGE_TOTAL])
            .await
            .map(|s| schema::get_bool(&s, keys::BUTTON_BADGE_TOTAL).unwrap_or(false))
            .unwrap_or(false);
        self.state.badge = mode.badge_style(button_badge_total);

        let badge_result = match mode.badge_color() {
            Some(color) => self.ui.set_badge_color(color).await,
            None => self.ui.set_badge_text("").await,
        };
        if let Err(e) = badge_result {
            error!("Could not repaint the badge {e:?}");
        }

        if mode != TimerMode::Off {
            self.schedule_eval(None);
        }
    }

    /// Entry point of every tracking decision. Debounced: a new call within
    /// the delay replaces the pending evaluation.
    fn schedule_eval(&mut self, context: Option<ActiveContext>) {
        if self.state.mode == TimerMode::Off {
            return;
        }
        self.state.pending_eval = Some(PendingEval {
            context,
            due: self.clock.instant() + PRE_CLOCK_ON_DEBOUNCE,
        });
    }

    async fn evaluate(&mut self, context: Option<ActiveContext>) {
        if let Err(e) = self.evaluate_inner(context).await {
            error!("Clock on evaluation failed {e:?}");
        }
    }

    /// Maybe starts a new day, updates the badge, and maybe clocks on.
    async fn evaluate_inner(&mut self, context: Option<ActiveContext>) -> Result<()> {
        if self.state.mode == TimerMode::Off {
            return Ok(());
        }

        let context = if self.state.mode == TimerMode::Blue {
            Some(ActiveContext {
                url: TIME_ONLY_URL.into(),
                incognito: false,
            })
        } else {
            match context {
                Some(context) => Some(context),
                None => self.browser.active_context().await?,
            }
        };

        let (domain, scheme_clockable) = match &context {
            None => (None, false),
            Some(context) => match Url::parse(&context.url) {
                Ok(url) => {
                    let scheme_ok = matches!(url.scheme(), "http" | "https");
                    let domain = if context.incognito {
                        Some(PRIVATE_DOMAIN.to_owned())
                    } else {
                        url.host_str().map(str::to_owned)
                    };
                    (domain, scheme_ok)
                }
                Err(e) => {
                    warn!("Active tab has an unparseable url {}: {e}", context.url);
                    (None, false)
                }
            },
        };

        let domain_key = domain.as_deref().unwrap_or("");
        let lookup = [
            keys::NEXT_DAY_STARTS_AT,
            keys::WHITELIST,
            keys::TOTAL_SECS,
            domain_key,
        ];
        let mut from_storage = self.store.get(&lookup).await?;

        let now = self.clock.time();
        let next_day_starts_at =
            schema::get_i64(&from_storage, keys::NEXT_DAY_STARTS_AT).unwrap_or(i64::MAX);
        if now.timestamp_millis() > next_day_starts_at {
            self.perform_rollover(now).await?;
            from_storage = self.store.get(&lookup).await?;
        }

        let whitelist: Vec<String> =
            schema::decode(&from_storage, keys::WHITELIST)?.unwrap_or_default();
        let total_secs = schema::get_f64(&from_storage, keys::TOTAL_SECS).unwrap_or(0.0);

        // A site is clockable if it was reached over plain web protocols, the
        // user didn't exclude it, and it isn't the private browsing stand-in.
        let clockable = domain.as_ref().is_some_and(|domain| {
            scheme_clockable
                && domain != PRIVATE_DOMAIN
                && !whitelist.iter().any(|entry| entry == domain)
        });

        match (clockable, domain) {
            (true, Some(domain)) => {
                let domain_secs = schema::get_f64(&from_storage, &domain).unwrap_or(0.0);
                self.update_badge(domain_secs, total_secs).await;
                self.clock_on(domain).await;
                self.state.rearm_at = Some(self.clock.instant() + rearm_delay(total_secs));
            }
            _ => self.update_badge(0.0, total_secs).await,
        }
        Ok(())
    }

    /// Starts timing a site.
    async fn clock_on(&mut self, domain: String) {
        if self.state.timing.is_some() {
            // Events always clock off before clocking on; heal rather than
            // drop the running interval.
            warn!("Clock on for {domain} without prior clock off");
            self.clock_off().await;
        }
        debug!("Clock on {domain}");
        self.state.timing = Some(Timing {
            started: self.clock.time(),
            domain,
        });
    }

    /// Commits the elapsed time of the current timing, if any.
    async fn clock_off(&mut self) {
        // Timing data is cleared before the commit awaits anything, so an
        // interleaved clock on can't lose or double-count this interval.
        let Some(Timing { domain, started }) = self.state.timing.take() else {
            return;
        };
        self.state.rearm_at = None;

        let raw_secs = (self.clock.time() - started).num_milliseconds() as f64 / 1000.0;
        debug!("Clock off {domain} after {raw_secs}s");
        if raw_secs <= MIN_COMMIT_SECS {
            return;
        }

        if let Err(e) = self.log_seconds(&domain, raw_secs).await {
            // The seconds are gone, but the tracking state stays consistent.
            error!("Lost {raw_secs}s for {domain}: {e:?}");
            return;
        }
        if let Err(e) = self.maybe_notify().await {
            error!("Notification check failed {e:?}");
        }
    }

    /// Adds elapsed seconds to the domain tally and the day total as one
    /// combined update.
    async fn log_seconds(&self, domain: &str, raw_secs: f64) -> Result<()> {
        let from_storage = self.store.get(&[keys::TOTAL_SECS, domain]).await?;
        let new_secs = round2(raw_secs);
        let total_secs = schema::get_f64(&from_storage, keys::TOTAL_SECS).unwrap_or(0.0);
        let domain_secs = schema::get_f64(&from_storage, domain).unwrap_or(0.0);

        let mut update = StorageMap::new();
        update.insert(keys::TOTAL_SECS.into(), (total_secs + new_secs).into());
        update.insert(domain.to_owned(), (domain_secs + new_secs).into());
        self.store.set(update).await
    }

    async fn maybe_notify(&mut self) -> Result<()> {
        let from_storage = self
            .store
            .get(&[
                keys::TOTAL_SECS,
                keys::NOTIFICATIONS_ON,
                keys::NOTIFICATIONS_RATE,
                keys::NEXT_ALERT_AT,
            ])
            .await?;
        let total_secs = schema::get_f64(&from_storage, keys::TOTAL_SECS).unwrap_or(0.0);
        let rate = schema::get_i64(&from_storage, keys::NOTIFICATIONS_RATE).unwrap_or(0);
        let next_alert = schema::get_f64(&from_storage, keys::NEXT_ALERT_AT).unwrap_or(f64::MAX);

        let enabled = schema::get_bool(&from_storage, keys::NOTIFICATIONS_ON).unwrap_or(false);
        if !enabled || rate <= 0 || total_secs < next_alert {
            return Ok(());
        }

        let shown = format_time(total_secs);
        // Overlapping commits can pass the threshold twice; the formatted
        // text only changes once a minute and makes a good dedupe key.
        if shown != self.state.last_alert_text {
            self.state.last_alert_text = shown.clone();
            let message = alerts::notification_message(&self.store.get_all().await?);
            let title = format!("{shown} Today");
            match self.ui.show_notification(&title, &message).await {
                Ok(id) => {
                    self.state.pending_dismiss = Some(PendingDismiss {
                        id,
                        due: self.clock.instant() + NOTIFICATION_TIMEOUT,
                    });
                }
                Err(e) => error!("Could not show notification {e:?}"),
            }
        }

        let mut update = StorageMap::new();
        update.insert(
            keys::NEXT_ALERT_AT.into(),
            alerts::next_alert_at(rate, total_secs).into(),
        );
        self.store.set(update).await
    }

    async fn perform_rollover(&mut self, now: DateTime<Utc>) -> Result<()> {
        info!("Starting a new accounting day");
        let mut snapshot = self.store.get_all().await?;
        let removed = rollover::advance_day(&mut snapshot, now, self.clock.local_offset())?;
        self.store.remove(&removed).await?;
        self.store.set(snapshot).await?;
        self.state.reset_day();
        Ok(())
    }

    async fn update_badge(&self, domain_secs: f64, total_secs: f64) {
        let text = match self.state.badge {
            modes::BadgeStyle::Hidden => return,
            modes::BadgeStyle::PerDomain if domain_secs > 0.0 => format_time_minimal(domain_secs),
            modes::BadgeStyle::PerDomain => "0".to_owned(),
            modes::BadgeStyle::Total => format_time_minimal(total_secs),
        };
        if let Err(e) = self.ui.set_badge_text(&text).await {
            error!("Could not update the badge {e:?}");
        }
    }
}

async fn sleep_until_opt(clock: &dyn Clock, due: Option<tokio::time::Instant>) {
    match due {
        Some(due) => clock.sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Wait until just past the next minute threshold of the running total, with
/// a floor so the store can't get hammered.
fn rearm_delay(total_secs: f64) -> Duration {
    let secs = (62.0 - total_secs.rem_euclid(60.0)).max(5.0);
    Duration::from_secs_f64(secs)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, FixedOffset, Utc};
    use mockall::predicate::eq;
    use serde_json::{json, Value};
    use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
    use tokio_util::sync::CancellationToken;

    use crate::{
        browser_api::{ActiveContext, BrowserEvent, IdleState, MockBrowser, MockUserInterface},
        storage::{
            schema::{self, keys, DaySummary, Today},
            store::{KeyValueStore, LocalStore},
        },
        utils::{clock::Clock, logging::TEST_LOGGING},
    };

    use super::*;

    #[derive(Clone)]
    struct TestClock {
        start_time: DateTime<Utc>,
        reference: Instant,
    }

    impl TestClock {
        fn starting_at(value: &str) -> Self {
            Self {
                start_time: value.parse().unwrap(),
                reference: Instant::now(),
            }
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn time(&self) -> DateTime<Utc> {
            self.start_time + self.reference.elapsed()
        }

        fn local_offset(&self) -> FixedOffset {
            FixedOffset::east_opt(0).unwrap()
        }

        fn instant(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        async fn sleep_until(&self, instant: tokio::time::Instant) {
            tokio::time::sleep_until(instant).await;
        }
    }

    fn ctx(url: &str) -> ActiveContext {
        ActiveContext {
            url: url.into(),
            incognito: false,
        }
    }

    fn permissive_browser() -> MockBrowser {
        let mut browser = MockBrowser::new();
        browser.expect_configure_idle().returning(|_, _| Ok(()));
        browser.expect_window_focused().returning(|| Ok(true));
        browser
            .expect_active_context()
            .returning(|| Ok(Some(ctx("http://example.com/"))));
        browser
    }

    fn quiet_ui() -> MockUserInterface {
        let mut ui = MockUserInterface::new();
        ui.expect_set_badge_text().returning(|_| Ok(()));
        ui.expect_set_badge_color().returning(|_| Ok(()));
        ui.expect_show_notification()
            .returning(|_, _| Ok("alert-0".into()));
        ui.expect_clear_notification().returning(|_| Ok(()));
        ui
    }

    async fn init_store(clock: &TestClock, seed: &[(&str, Value)]) -> Arc<LocalStore> {
        let store = Arc::new(LocalStore::in_memory());
        let seeded: StorageMap = seed
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        store
            .set(bootstrap::initial_storage(seeded, clock.time(), clock.local_offset()).unwrap())
            .await
            .unwrap();
        store
    }

    fn spawn_tracker(
        store: Arc<LocalStore>,
        clock: TestClock,
        browser: MockBrowser,
        ui: MockUserInterface,
    ) -> (
        mpsc::Sender<BrowserEvent>,
        CancellationToken,
        JoinHandle<Result<()>>,
    ) {
        let (event_sender, event_receiver) = mpsc::channel(10);
        let shutdown = CancellationToken::new();
        let tracker = Tracker::new(
            store,
            Arc::new(browser),
            Arc::new(ui),
            event_receiver,
            Arc::new(clock),
            shutdown.clone(),
        );
        let handle = tokio::spawn(tracker.run());
        (event_sender, shutdown, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_accumulates_between_clock_on_and_off() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/a")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let total = schema::get_f64(&all, keys::TOTAL_SECS).unwrap();
        let site = schema::get_f64(&all, "example.com").unwrap();
        assert!(total > 9.0 && total < 10.5, "unexpected total {total}");
        assert_eq!(total, site);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_domain_tallies_sum_to_the_total() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://a.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        events
            .send(BrowserEvent::TabUpdated {
                context: ctx("https://b.com/page"),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(7)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let total = schema::get_f64(&all, keys::TOTAL_SECS).unwrap();
        let a = schema::get_f64(&all, "a.com").unwrap();
        let b = schema::get_f64(&all, "b.com").unwrap();
        assert!(a > 4.0 && a < 5.5, "unexpected a {a}");
        assert!(b > 6.0 && b < 7.5, "unexpected b {b}");
        assert!((total - (a + b)).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_half_second_intervals_are_dropped() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        // 300ms of timing after the 50ms debounce, below the commit floor.
        tokio::time::sleep(Duration::from_millis(350)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        assert_eq!(schema::get_f64(&all, keys::TOTAL_SECS), Some(0.0));
        assert!(all.get("example.com").is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitelisted_domain_never_accrues_time() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[(keys::WHITELIST, json!(["example.com"]))]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/page")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        assert_eq!(schema::get_f64(&all, keys::TOTAL_SECS), Some(0.0));
        assert!(all.get("example.com").is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_web_urls_are_not_clocked() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabUpdated {
                context: ctx("about:blank"),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        assert_eq!(schema::get_f64(&all, keys::TOTAL_SECS), Some(0.0));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_incognito_context_never_accrues_time() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabUpdated {
                context: ActiveContext {
                    url: "https://secret.example.com/".into(),
                    incognito: true,
                },
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        assert_eq!(schema::get_f64(&all, keys::TOTAL_SECS), Some(0.0));
        assert!(all.get("secret.example.com").is_none());
        assert!(all.get(PRIVATE_DOMAIN).is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_bursts_coalesce_into_one_evaluation() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        // A rapid tab switching burst; only the last one sticks.
        for url in ["http://a.com/", "http://b.com/", "http://c.com/"] {
            events
                .send(BrowserEvent::TabActivated {
                    context: Some(ctx(url)),
                })
                .await?;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        assert!(all.get("a.com").is_none());
        assert!(all.get("b.com").is_none());
        let c = schema::get_f64(&all, "c.com").unwrap();
        assert!(c > 9.0 && c < 10.5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_fires_once_when_threshold_crossed() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(
            &clock,
            &[
                (keys::TOTAL_SECS, json!(59.0)),
                (keys::NOTIFICATIONS_ON, json!(true)),
                (keys::NOTIFICATIONS_RATE, json!(1)),
                (keys::NEXT_ALERT_AT, json!(60.0)),
            ],
        )
        .await;

        let mut ui = MockUserInterface::new();
        ui.expect_set_badge_text().returning(|_| Ok(()));
        ui.expect_set_badge_color().returning(|_| Ok(()));
        ui.expect_clear_notification().returning(|_| Ok(()));
        ui.expect_show_notification()
            .times(1)
            .returning(|_, _| Ok("alert-0".into()));

        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), ui);

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // More browsing below the next threshold must not notify again.
        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let next_alert = schema::get_f64(&all, keys::NEXT_ALERT_AT).unwrap();
        assert!((next_alert - 120.0).abs() < 1e-6, "next alert {next_alert}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_to_off_stops_tracking() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;

        let mut browser = MockBrowser::new();
        browser.expect_window_focused().returning(|| Ok(true));
        browser
            .expect_active_context()
            .returning(|| Ok(Some(ctx("http://example.com/"))));
        browser
            .expect_configure_idle()
            .with(eq(true), eq(IDLE_TIMEOUT_SECS))
            .times(1)
            .returning(|_, _| Ok(()));
        browser
            .expect_configure_idle()
            .with(eq(false), eq(IDLE_TIMEOUT_SECS))
            .times(1)
            .returning(|_, _| Ok(()));

        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, browser, quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(5)).await;

        // The popup writes the mode into storage; the tracker reacts to the
        // change notification.
        let mut update = StorageMap::new();
        update.insert(keys::TIMER_MODE.into(), json!("O"));
        store.set(update).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let all = store.get_all().await?;
        let total_after_switch = schema::get_f64(&all, keys::TOTAL_SECS).unwrap();
        assert!(total_after_switch > 4.0 && total_after_switch < 6.0);

        // Further events do nothing in Off mode.
        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        assert_eq!(
            schema::get_f64(&all, keys::TOTAL_SECS),
            Some(total_after_switch)
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_blue_mode_logs_against_the_stand_in_domain() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[(keys::TIMER_MODE, json!("B"))]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        assert!(all.get("example.com").is_none());
        let stand_in = schema::get_f64(&all, TIME_ONLY_DOMAIN).unwrap();
        assert!(stand_in > 9.0 && stand_in < 10.5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clocks_off_and_active_clocks_back_on() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events
            .send(BrowserEvent::IdleStateChanged {
                state: IdleState::Idle,
            })
            .await?;
        // The idle stretch doesn't count.
        tokio::time::sleep(Duration::from_secs(60)).await;
        events
            .send(BrowserEvent::IdleStateChanged {
                state: IdleState::Active,
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let total = schema::get_f64(&all, keys::TOTAL_SECS).unwrap();
        assert!(total > 14.0 && total < 16.5, "unexpected total {total}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_window_focus_only_clocks_off() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events
            .send(BrowserEvent::WindowFocusChanged {
                window_id: crate::browser_api::WINDOW_ID_NONE,
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(30)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let total = schema::get_f64(&all, keys::TOTAL_SECS).unwrap();
        assert!(total > 9.0 && total < 10.5, "unexpected total {total}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_keeps_committing_on_a_static_tab() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T12:00:00Z");
        let store = init_store(&clock, &[]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        // No further events; the re-arm timer has to commit by itself at the
        // minute mark.
        tokio::time::sleep(Duration::from_secs(70)).await;

        let all = store.get_all().await?;
        let committed = schema::get_f64(&all, keys::TOTAL_SECS).unwrap();
        assert!(committed > 60.0, "nothing committed before the minute mark");

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let total = schema::get_f64(&all, keys::TOTAL_SECS).unwrap();
        assert!(total > 69.0 && total < 71.0, "unexpected total {total}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_morning_activity_logs_to_yesterday_until_rollover() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T03:00:00Z");
        let store = init_store(&clock, &[(keys::DAY_START_OFFSET, json!(4))]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        // With a 4am day start, 3am still belongs to july 3rd.
        let today: Today = schema::require(&store.get_all().await?, keys::TODAY)?;
        assert_eq!(today.day_num, 17715);

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Shortly after 4am the next evaluation has to roll the day over
        // before logging anything new.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let days: Vec<DaySummary> = schema::require(&all, keys::DAYS)?;
        assert_eq!(days[0].day_num, 17715);
        assert_eq!(days[0].total_secs, 60);

        let today: Today = schema::require(&all, keys::TODAY)?;
        assert_eq!(today.day_num, 17716);
        assert!(schema::get_f64(&all, keys::TOTAL_SECS).unwrap() < 1.0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_the_day_start_into_the_past_rolls_over_immediately() -> Result<()> {
        *TEST_LOGGING;
        let clock = TestClock::starting_at("2018-07-04T03:00:00Z");
        let store = init_store(&clock, &[(keys::DAY_START_OFFSET, json!(4))]).await;
        let (events, shutdown, handle) =
            spawn_tracker(store.clone(), clock, permissive_browser(), quiet_ui());

        events
            .send(BrowserEvent::TabActivated {
                context: Some(ctx("http://example.com/")),
            })
            .await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(BrowserEvent::TabRemoved).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Dropping the offset to 0 puts 3am into july 4th, one day ahead of
        // the current accounting day.
        let mut update = StorageMap::new();
        update.insert(keys::DAY_START_OFFSET.into(), json!(0));
        store.set(update).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        handle.await??;

        let all = store.get_all().await?;
        let days: Vec<DaySummary> = schema::require(&all, keys::DAYS)?;
        assert_eq!(days[0].day_num, 17715);
        assert_eq!(days[0].total_secs, 10);
        let today: Today = schema::require(&all, keys::TODAY)?;
        assert_eq!(today.day_num, 17716);
        Ok(())
    }

    #[test]
    fn test_rearm_delay_bounds() {
        assert_eq!(rearm_delay(0.0), Duration::from_secs_f64(62.0));
        assert_eq!(rearm_delay(58.0), Duration::from_secs_f64(5.0));
        assert_eq!(rearm_delay(61.0), Duration::from_secs_f64(61.0));
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(9.949_999), 9.95);
        assert_eq!(round2(0.004), 0.0);
        assert_eq!(round2(1.005), 1.0);
    }
}
