//! Contract with the browser side of the extension. The tracker only ever
//! talks to these traits; [native::NativeBridge] is the real implementation
//! speaking the native messaging protocol over stdio.

pub mod native;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sentinel window id delivered when focus leaves every browser window.
pub const WINDOW_ID_NONE: i64 = -1;

/// Url and privacy flag of a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveContext {
    pub url: String,
    #[serde(default)]
    pub incognito: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// Browser-level happenings the tracker reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    /// The url of a tab changed.
    TabUpdated { context: ActiveContext },
    /// A different tab became active. The context may be missing when the
    /// browser can't tell yet, in which case the tracker queries it.
    TabActivated { context: Option<ActiveContext> },
    TabRemoved,
    WindowFocusChanged { window_id: i64 },
    IdleStateChanged { state: IdleState },
}

/// Query side of the browser connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Browser: Send + Sync + 'static {
    /// Context of the active tab in the current window, if any.
    async fn active_context(&self) -> Result<Option<ActiveContext>>;

    /// Whether any browser window currently has focus.
    async fn window_focused(&self) -> Result<bool>;

    /// Turns user-idle reporting on or off.
    async fn configure_idle(&self, enabled: bool, threshold_secs: u32) -> Result<()>;
}

/// The only user-visible output the tracker produces directly: the toolbar
/// badge and plain notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserInterface: Send + Sync + 'static {
    async fn set_badge_text(&self, text: &str) -> Result<()>;

    async fn set_badge_color(&self, color: &str) -> Result<()>;

    /// Shows a notification and returns an id usable with
    /// [clear_notification](UserInterface::clear_notification).
    async fn show_notification(&self, title: &str, message: &str) -> Result<String>;

    async fn clear_notification(&self, id: &str) -> Result<()>;
}
