//! In-memory state of the tracker, owned by the event loop. Timers are plain
//! deadlines the loop sleeps on; replacing a deadline cancels the previous
//! one, so at most one evaluation and one re-arm can ever be pending.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{
    browser_api::ActiveContext,
    storage::schema::TimerMode,
};

use super::modes::{BadgeStyle, ListenerSet};

/// The domain currently being timed. Elapsed time only reaches storage when
/// this gets clocked off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub domain: String,
    pub started: DateTime<Utc>,
}

/// A debounced clock-on evaluation waiting to run.
#[derive(Debug, Clone)]
pub struct PendingEval {
    pub context: Option<ActiveContext>,
    pub due: Instant,
}

/// A notification waiting to be auto-dismissed.
#[derive(Debug, Clone)]
pub struct PendingDismiss {
    pub id: String,
    pub due: Instant,
}

pub struct TrackerState {
    pub timing: Option<Timing>,
    pub mode: TimerMode,
    pub listeners: ListenerSet,
    pub badge: BadgeStyle,
    pub pending_eval: Option<PendingEval>,
    /// When to force a clock-off/clock-on cycle so the badge keeps moving on
    /// a static tab.
    pub rearm_at: Option<Instant>,
    pub pending_dismiss: Option<PendingDismiss>,
    /// Last notification text shown, to suppress duplicates from overlapping
    /// commits.
    pub last_alert_text: String,
}

impl TrackerState {
    pub fn new() -> Self {
        Self {
            timing: None,
            mode: TimerMode::Off,
            listeners: ListenerSet::NONE,
            badge: BadgeStyle::Hidden,
            pending_eval: None,
            rearm_at: None,
            pending_dismiss: None,
            last_alert_text: String::new(),
        }
    }

    /// Drops everything tied to the finished accounting day. The mode and its
    /// listeners survive, they are not part of the day.
    pub fn reset_day(&mut self) {
        self.timing = None;
        self.pending_eval = None;
        self.rearm_at = None;
        self.last_alert_text.clear();
    }
}

impl Default for TrackerState {
    fn default() -> Self {
        Self::new()
    }
}
