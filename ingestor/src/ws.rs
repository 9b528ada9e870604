//! WebSocket subscription endpoint.
//!
//! A connection goes `Connecting -> Joined -> Relaying -> Closed`. It joins the device's group
//! before reading the snapshot, so nothing published after the join can be missed; the price is
//! that the newest record may arrive twice.

use crate::broker::{Broker, Subscription};
use crate::model::{Category, DeviceId, TelemetryRecord};
use crate::rest::AppState;
use crate::snapshot::Snapshot;
use crate::store::TelemetryStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const PONG: &str = r#"{"type":"pong"}"#;

/// What a subscriber connection can receive from its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close,
    Other,
}

/// Transport underneath a subscription. Implemented for axum's [`WebSocket`].
pub trait SubscriberSocket: Send {
    type Error: Display + Send;

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// `None` once the peer is gone.
    fn next_inbound(&mut self) -> impl Future<Output = Option<Result<Inbound, Self::Error>>> + Send;
}

impl SubscriberSocket for WebSocket {
    type Error = axum::Error;

    async fn send_text(&mut self, text: String) -> Result<(), axum::Error> {
        self.send(Message::Text(text)).await
    }

    async fn next_inbound(&mut self) -> Option<Result<Inbound, axum::Error>> {
        let message = self.recv().await?;
        Some(message.map(|message| match message {
            Message::Text(text) => Inbound::Text(text),
            Message::Close(_) => Inbound::Close,
            _ => Inbound::Other,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Relaying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the socket or went away.
    ClientClosed,
    /// Reading from or writing to the socket failed.
    Transport,
    /// The broker shut down while relaying.
    BrokerClosed,
    /// The broker refused the join.
    BrokerUnavailable,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Snapshot,
    Ping,
}

/// Per-category timestamp of the last record sent on one connection.
#[derive(Debug, Default)]
struct Watermarks {
    sent: HashMap<Category, DateTime<Utc>>,
}

impl Watermarks {
    /// False if `record` is older than something already sent in its category.
    fn admit(&mut self, record: &TelemetryRecord) -> bool {
        let ts = record.timestamp();
        match self.sent.get(&record.category()) {
            Some(last) if ts < *last => false,
            _ => {
                self.sent.insert(record.category(), ts);
                true
            }
        }
    }
}

pub async fn subscribe(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let device_id = DeviceId::new(device_id);
    let broker = Arc::clone(state.gateway.broker());
    let store = Arc::clone(state.gateway.store());

    ws.on_upgrade(move |socket| async move {
        run_session(socket, device_id, broker, store).await;
    })
}

struct Session<S> {
    socket: S,
    device_id: DeviceId,
    state: SessionState,
    watermarks: Watermarks,
}

impl<S: SubscriberSocket> Session<S> {
    fn transition(&mut self, next: SessionState) {
        debug!(device_id = %self.device_id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    async fn send_record(&mut self, record: &TelemetryRecord) -> Result<(), S::Error> {
        if !self.watermarks.admit(record) {
            debug!(
                device_id = %self.device_id,
                category = record.category().as_str(),
                "skipping record older than one already sent"
            );
            return Ok(());
        }

        match serde_json::to_string(record) {
            Ok(frame) => self.socket.send_text(frame).await,
            Err(e) => {
                error!(device_id = %self.device_id, "failed to encode frame: {}", e);
                Ok(())
            }
        }
    }

    async fn replay_snapshot(&mut self, store: &dyn TelemetryStore) -> Result<(), S::Error> {
        let snapshot = match Snapshot::load(store, &self.device_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(device_id = %self.device_id, "failed to load snapshot: {}", e);
                Snapshot::default()
            }
        };

        debug!(device_id = %self.device_id, records = snapshot.records().len(), "replaying snapshot");
        for record in snapshot.into_records() {
            self.send_record(&record).await?;
        }
        Ok(())
    }

    async fn handle_client_text(
        &mut self,
        text: &str,
        store: &dyn TelemetryStore,
    ) -> Result<(), S::Error> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Snapshot) => self.replay_snapshot(store).await,
            Ok(ClientMessage::Ping) => self.socket.send_text(PONG.to_string()).await,
            Err(_) => {
                debug!(device_id = %self.device_id, "ignoring unrecognized client message");
                Ok(())
            }
        }
    }

    async fn relay(&mut self, subscription: &mut Subscription, store: &dyn TelemetryStore) -> CloseReason {
        loop {
            tokio::select! {
                published = subscription.recv() => match published {
                    Some(record) => {
                        if let Err(e) = self.send_record(&record).await {
                            debug!(device_id = %self.device_id, "send failed: {}", e);
                            break CloseReason::Transport;
                        }
                    }
                    None => break CloseReason::BrokerClosed,
                },
                inbound = self.socket.next_inbound() => match inbound {
                    None | Some(Ok(Inbound::Close)) => break CloseReason::ClientClosed,
                    Some(Err(e)) => {
                        debug!(device_id = %self.device_id, "receive failed: {}", e);
                        break CloseReason::Transport;
                    }
                    Some(Ok(Inbound::Text(text))) => {
                        if let Err(e) = self.handle_client_text(&text, store).await {
                            debug!(device_id = %self.device_id, "send failed: {}", e);
                            break CloseReason::Transport;
                        }
                    }
                    Some(Ok(Inbound::Other)) => {}
                },
            }
        }
    }
}

/// Drives one subscriber connection until it closes. Group membership is released when the
/// subscription is dropped, which also happens if this future is cancelled or panics.
pub async fn run_session<S: SubscriberSocket>(
    socket: S,
    device_id: DeviceId,
    broker: Arc<Broker>,
    store: Arc<dyn TelemetryStore>,
) -> CloseReason {
    let mut session = Session {
        socket,
        device_id,
        state: SessionState::Connecting,
        watermarks: Watermarks::default(),
    };

    let mut subscription = match broker.subscribe(session.device_id.clone()) {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(device_id = %session.device_id, "rejecting subscriber: {}", e);
            session.transition(SessionState::Closed);
            return CloseReason::BrokerUnavailable;
        }
    };
    session.transition(SessionState::Joined);
    info!(
        device_id = %session.device_id,
        subscriber = %subscription.id(),
        members = broker.member_count(&session.device_id),
        "subscriber connected"
    );

    // Publishes after the join are queued on the subscription while the snapshot goes out
    let reason = match session.replay_snapshot(store.as_ref()).await {
        Ok(()) => {
            session.transition(SessionState::Relaying);
            session.relay(&mut subscription, store.as_ref()).await
        }
        Err(e) => {
            debug!(device_id = %session.device_id, "snapshot send failed: {}", e);
            CloseReason::Transport
        }
    };

    let subscriber = subscription.id();
    drop(subscription);
    session.transition(SessionState::Closed);
    info!(device_id = %session.device_id, subscriber = %subscriber, reason = ?reason, "subscriber disconnected");

    reason
}
