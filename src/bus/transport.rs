// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Bus transport.
//
// A `BusLink` is the pool's handle on one live connection. Inbound text
// frames are fanned out over a broadcast channel so several requests can
// filter the same multiplexed stream. The websocket itself is owned by a
// reader task; closing the link asks that task to send a close frame and exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::identity::Identity;

use super::frame::{is_attach_confirmation, subscribe_frame};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),
    #[error("bus subscription failed: {0}")]
    Subscribe(String),
    #[error("bus connection closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Link and feed
// ---------------------------------------------------------------------------

/// Producer side of a link: whoever reads the transport publishes here.
/// Dropping the feed marks the link closed and ends every subscription.
pub struct BusFeed {
    frames: broadcast::Sender<Arc<str>>,
    open: Arc<AtomicBool>,
}

impl BusFeed {
    /// Publish one inbound text frame. Returns the number of subscribers
    /// that will see it.
    pub fn publish(&self, frame: impl Into<Arc<str>>) -> usize {
        self.frames.send(frame.into()).unwrap_or(0)
    }

    /// Simulate or record the remote end going away.
    pub fn close(self) {}
}

impl Drop for BusFeed {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Consumer side of a live bus connection, owned by the pool.
pub struct BusLink {
    template: broadcast::Receiver<Arc<str>>,
    open: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl BusLink {
    /// Attach a new subscriber. It sees frames published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.template.resubscribe()
    }

    /// Whether the transport is still usable.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the transport if still open. Idempotent.
    pub fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    fn with_shutdown(mut self, shutdown: oneshot::Sender<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl Drop for BusLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a connected feed/link pair with room for `capacity` unread frames
/// per subscriber.
pub fn bus_channel(capacity: usize) -> (BusFeed, BusLink) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    let open = Arc::new(AtomicBool::new(true));
    (
        BusFeed {
            frames: tx,
            open: open.clone(),
        },
        BusLink {
            template: rx,
            open,
            shutdown: None,
        },
    )
}

// ---------------------------------------------------------------------------
// Connector seam
// ---------------------------------------------------------------------------

/// Opens subscribed bus connections for an identity.
///
/// Implementations return only once the subscription is confirmed. The pool
/// bounds the call with its connect timeout.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, identity: &Identity, buffer: usize) -> Result<BusLink, BusError>;
}

// ---------------------------------------------------------------------------
// Websocket connector
// ---------------------------------------------------------------------------

pub struct WsBusConnector {
    url: String,
}

impl WsBusConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BusConnector for WsBusConnector {
    async fn connect(&self, identity: &Identity, buffer: usize) -> Result<BusLink, BusError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BusError::Connect(format!("invalid bus url: {e}")))?;
        let auth = format!("Bearer {}", identity.bus_credential)
            .parse()
            .map_err(|_| BusError::Connect("bus credential is not a valid header value".into()))?;
        request.headers_mut().insert("authorization", auth);

        let (mut ws, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let channel = identity.channel();
        ws.send(Message::Text(subscribe_frame(identity).into()))
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        // Wait for the confirmation; nothing else is meaningful before it.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) if is_attach_confirmation(text.as_str(), &channel) => {
                    break
                }
                Some(Ok(Message::Close(_))) | None => return Err(BusError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(BusError::Subscribe(e.to_string())),
            }
        }

        let (feed, link) = bus_channel(buffer);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let account_id = identity.account_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            feed.publish(text.as_str());
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!(account_id = %account_id, "bus connection closed by remote");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(account_id = %account_id, error = %e, "bus connection failed");
                            break;
                        }
                    }
                }
            }
            drop(feed);
        });

        Ok(link.with_shutdown(shutdown_tx))
    }
}
