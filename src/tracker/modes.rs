//! Mode controller tables. Each timer mode maps to a set of event listeners
//! and a badge policy; switching modes applies the listener diff instead of
//! sprinkling attach/detach calls through the handlers.

use crate::storage::schema::TimerMode;

/// Which event sources a mode listens to. Events arriving outside the active
/// set are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListenerSet {
    pub tabs: bool,
    pub windows: bool,
    pub idle: bool,
}

impl ListenerSet {
    pub const NONE: ListenerSet = ListenerSet {
        tabs: false,
        windows: false,
        idle: false,
    };

    /// Listeners to attach (`true`) or detach (`false`) when moving to `to`.
    pub fn diff(self, to: ListenerSet) -> Vec<(&'static str, bool)> {
        let mut changes = vec![];
        if self.tabs != to.tabs {
            changes.push(("tabs", to.tabs));
        }
        if self.windows != to.windows {
            changes.push(("windows", to.windows));
        }
        if self.idle != to.idle {
            changes.push(("idle", to.idle));
        }
        changes
    }
}

/// What the toolbar badge shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeStyle {
    Hidden,
    /// Seconds accumulated on the current site.
    PerDomain,
    /// Seconds accumulated across all sites today.
    Total,
}

impl TimerMode {
    pub fn listener_set(self) -> ListenerSet {
        match self {
            TimerMode::Off => ListenerSet::NONE,
            // Green keeps timing despite inactivity, so no idle listener.
            TimerMode::Green => ListenerSet {
                tabs: true,
                windows: true,
                idle: false,
            },
            TimerMode::Default | TimerMode::Blue => ListenerSet {
                tabs: true,
                windows: true,
                idle: true,
            },
        }
    }

    pub fn badge_style(self, button_badge_total: bool) -> BadgeStyle {
        match self {
            TimerMode::Off => BadgeStyle::Hidden,
            TimerMode::Blue => BadgeStyle::Total,
            _ if button_badge_total => BadgeStyle::Total,
            _ => BadgeStyle::PerDomain,
        }
    }

    /// Badge background for modes that show one.
    pub fn badge_color(self) -> Option<&'static str> {
        match self {
            TimerMode::Off => None,
            TimerMode::Default => Some("#404040"),
            TimerMode::Green => Some("#00aa00"),
            TimerMode::Blue => Some("#5555dd"),
        }
    }
}
