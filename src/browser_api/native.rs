//! Native messaging endpoint. The browser launches the host and exchanges
//! json payloads framed with a 4-byte little-endian length prefix; events
//! flow in, badge and notification commands flow out, and queries are
//! correlated through numeric request ids.

use std::{
    collections::HashMap,
    io::ErrorKind,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{debug, error, warn};

use super::{ActiveContext, Browser, BrowserEvent, IdleState, UserInterface};

/// Browsers refuse to deliver anything close to this; a larger header means
/// the stream is out of sync.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum Incoming {
    TabUpdated {
        url: String,
        #[serde(default)]
        incognito: bool,
    },
    TabActivated {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        incognito: bool,
    },
    TabRemoved,
    WindowFocusChanged {
        window_id: i64,
    },
    IdleStateChanged {
        state: IdleState,
    },
    Response {
        id: u64,
        #[serde(default)]
        payload: Value,
    },
}

impl Incoming {
    fn into_event(self) -> Option<BrowserEvent> {
        match self {
            Incoming::TabUpdated { url, incognito } => Some(BrowserEvent::TabUpdated {
                context: ActiveContext { url, incognito },
            }),
            Incoming::TabActivated { url, incognito } => Some(BrowserEvent::TabActivated {
                context: url.map(|url| ActiveContext { url, incognito }),
            }),
            Incoming::TabRemoved => Some(BrowserEvent::TabRemoved),
            Incoming::WindowFocusChanged { window_id } => {
                Some(BrowserEvent::WindowFocusChanged { window_id })
            }
            Incoming::IdleStateChanged { state } => {
                Some(BrowserEvent::IdleStateChanged { state })
            }
            Incoming::Response { .. } => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum Outgoing {
    SetBadgeText { text: String },
    SetBadgeColor { color: String },
    ShowNotification { id: String, title: String, message: String },
    ClearNotification { id: String },
    ConfigureIdle { enabled: bool, threshold_secs: u32 },
    QueryActiveTab { id: u64 },
    QueryWindowFocus { id: u64 },
}

/// Serves as the browser connection for the tracker, implementing both the
/// query and the ui side over one message stream.
pub struct NativeBridge<W> {
    writer: Mutex<W>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_request_id: AtomicU64,
    next_notification_id: AtomicU64,
}

impl<W: AsyncWrite + Send + Unpin + 'static> NativeBridge<W> {
    /// Starts the connection. The returned receiver yields browser events
    /// until the browser closes its end of the stream.
    pub fn connect<R>(reader: R, writer: W) -> (Arc<Self>, mpsc::Receiver<BrowserEvent>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let bridge = Arc::new(Self {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            next_notification_id: AtomicU64::new(0),
        });

        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(read_loop(reader, bridge.clone(), event_sender));

        (bridge, event_receiver)
    }

    async fn send(&self, message: &Outgoing) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &payload).await
    }

    async fn request(&self, make: impl FnOnce(u64) -> Outgoing) -> Result<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(id, sender);

        if let Err(e) = self.send(&make(id)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => bail!("Browser disconnected before responding to request {id}"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("Browser did not respond to request {id}")
            }
        }
    }
}

async fn read_loop<R, W>(
    mut reader: R,
    bridge: Arc<NativeBridge<W>>,
    events: mpsc::Sender<BrowserEvent>,
) where
    R: AsyncRead + Send + Unpin,
    W: Send,
{
    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("Browser closed the message channel");
                break;
            }
            Err(e) => {
                error!("Unreadable message stream {e:?}");
                break;
            }
        };

        match serde_json::from_slice::<Incoming>(&payload) {
            Ok(Incoming::Response { id, payload }) => {
                match bridge.pending.lock().await.remove(&id) {
                    Some(sender) => {
                        let _ = sender.send(payload);
                    }
                    None => warn!("Response for unknown request {id}"),
                }
            }
            Ok(message) => {
                if let Some(event) = message.into_event() {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            }
            // ignore illegal values. Might come from a mismatched extension version
            Err(e) => warn!("Discarding malformed message: {e}"),
        }
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_le_bytes(header);
    if length > MAX_FRAME_BYTES {
        bail!("Refusing a {length} byte frame, the stream is likely out of sync");
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let length = u32::try_from(payload.len())?;
    writer.write_all(&length.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin + 'static> Browser for NativeBridge<W> {
    async fn active_context(&self) -> Result<Option<ActiveContext>> {
        let value = self
            .request(|id| Outgoing::QueryActiveTab { id })
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn window_focused(&self) -> Result<bool> {
        #[derive(Deserialize)]
        struct Focus {
            focused: bool,
        }

        let value = self
            .request(|id| Outgoing::QueryWindowFocus { id })
            .await?;
        Ok(serde_json::from_value::<Focus>(value)
            .map_err(|e| anyhow!("Malformed focus response: {e}"))?
            .focused)
    }

    async fn configure_idle(&self, enabled: bool, threshold_secs: u32) -> Result<()> {
        self.send(&Outgoing::ConfigureIdle {
            enabled,
            threshold_secs,
        })
        .await
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin + 'static> UserInterface for NativeBridge<W> {
    async fn set_badge_text(&self, text: &str) -> Result<()> {
        self.send(&Outgoing::SetBadgeText { text: text.into() }).await
    }

    async fn set_badge_color(&self, color: &str) -> Result<()> {
        self.send(&Outgoing::SetBadgeColor {
            color: color.into(),
        })
        .await
    }

    async fn show_notification(&self, title: &str, message: &str) -> Result<String> {
        let id = format!(
            "alert-{}",
            self.next_notification_id.fetch_add(1, Ordering::Relaxed)
        );
        self.send(&Outgoing::ShowNotification {
            id: id.clone(),
            title: title.into(),
            message: message.into(),
        })
        .await?;
        Ok(id)
    }

    async fn clear_notification(&self, id: &str) -> Result<()> {
        self.send(&Outgoing::ClearNotification { id: id.into() }).await
    }
}
