//! Duplex channel lifecycle: the connection state machine, the transport seam
//! and the production websocket transport.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    /// Retry budget exhausted. Stays here until the channel is reopened.
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Connection state machine.
///
/// Every `open`/`close` starts a new epoch. Transitions reported by a channel
/// task carry the epoch it was started with, so a task that outlived its
/// epoch can no longer move the state.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    epoch: u64,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            epoch: 0,
        }
    }
}

impl ConnectionLifecycle {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn open(&mut self, has_session: bool) -> ClientResult<u64> {
        let next = ConnectionState::Connecting { attempt: 1 };
        self.check(next, has_session)?;
        self.epoch += 1;
        self.state = next;
        Ok(self.epoch)
    }

    pub fn close(&mut self, has_session: bool) -> ClientResult<()> {
        self.check(ConnectionState::Closed, has_session)?;
        self.epoch += 1;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Returns `Ok(false)` when `epoch` is stale and nothing changed.
    pub fn advance(
        &mut self,
        epoch: u64,
        next: ConnectionState,
        has_session: bool,
    ) -> ClientResult<bool> {
        if epoch != self.epoch {
            return Ok(false);
        }
        self.check(next, has_session)?;
        self.state = next;
        Ok(true)
    }

    /// Back to `Idle` once the session is gone.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.state = ConnectionState::Idle;
    }

    fn check(&self, next: ConnectionState, has_session: bool) -> ClientResult<()> {
        use ConnectionState::*;

        let allowed = has_session
            && match (self.state, next) {
                (_, Closed) => true,
                (Idle | Disconnected | Closed | Connected, Connecting { attempt: 1 }) => true,
                (Connecting { attempt }, Connecting { attempt: next_attempt }) => {
                    next_attempt == attempt + 1
                }
                (Connecting { .. }, Connected | Disconnected) => true,
                _ => false,
            };
        if allowed {
            Ok(())
        } else {
            Err(ClientError::InvalidTransition {
                from: self.state,
                to: next,
            })
        }
    }
}

/// Text frames in both directions. Dropping the link tears the transport down.
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &Url, token: &str) -> anyhow::Result<ChannelLink>;
}

pub struct WebSocketConnector;

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, url: &Url, token: &str) -> anyhow::Result<ChannelLink> {
        let mut request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid channel url: {url}"))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| anyhow!("token is not a valid header value"))?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("channel: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("channel: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("channel: websocket reader finished");
        });

        Ok(ChannelLink::new(outbound_tx, inbound_rx).with_tasks(vec![writer, reader]))
    }
}

pub fn channel_url(server_url: &str, channel_path: &str, token: &str) -> ClientResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|err| ClientError::Channel(format!("invalid server url {server_url}: {err}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ClientError::Channel(format!(
                "server url must use http or https, got {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Channel(format!("cannot derive channel url from {server_url}")))?;
    url.set_path(channel_path);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
