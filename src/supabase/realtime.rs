//! Realtime Change Feed
//!
//! Each subscription runs one background task holding a websocket to the
//! realtime endpoint. The task joins a channel for insert/delete changes on
//! the bookmarks table, keeps it alive with heartbeats, forwards refreshed
//! tokens, and reconnects with exponential backoff when the socket drops.
//! After any successful rejoin it emits [`ChangeEvent::Resynced`] so the
//! consumer can backfill whatever it missed.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

use super::messages::Frame;
use super::ProjectClient;
use crate::backend::{
    AuthEvent, BackendResult, ChangeEvent, ChangeFeed, FeedFilter, FeedSender, Subscription,
};
use crate::config::{RealtimeConfig, SupabaseConfig};
use crate::model::Session;

/// Websocket-backed [`ChangeFeed`]
pub struct SupabaseRealtime {
    endpoint: String,
    schema: String,
    table: String,
    config: RealtimeConfig,
    auth_events: broadcast::Sender<AuthEvent>,
}

/// Everything one subscription task needs
struct ChannelTask {
    endpoint: String,
    topic: String,
    schema: String,
    table: String,
    filter: FeedFilter,
    access_token: String,
    config: RealtimeConfig,
    sender: FeedSender,
    auth_rx: broadcast::Receiver<AuthEvent>,
    next_ref: u64,
}

/// Why a connection ended
#[derive(Debug)]
enum Disconnect {
    /// The consumer went away; stop for good
    Unsubscribed,
    /// The socket failed; worth reconnecting
    Dropped(String),
    /// The server refused the join; reconnecting won't help
    Rejected(String),
}

impl SupabaseRealtime {
    pub fn new(
        project: &ProjectClient,
        supabase: &SupabaseConfig,
        config: RealtimeConfig,
        auth_events: broadcast::Sender<AuthEvent>,
    ) -> Self {
        Self {
            endpoint: websocket_url(project.base_url(), project.anon_key()),
            schema: supabase.schema.clone(),
            table: supabase.table.clone(),
            config,
            auth_events,
        }
    }
}

#[async_trait]
impl ChangeFeed for SupabaseRealtime {
    async fn subscribe(&self, session: &Session, filter: FeedFilter) -> BackendResult<Subscription> {
        let (sender, subscription) = Subscription::channel();

        let task = ChannelTask {
            endpoint: self.endpoint.clone(),
            topic: format!("realtime:{}", self.config.channel),
            schema: self.schema.clone(),
            table: self.table.clone(),
            filter,
            access_token: session.access_token.clone(),
            config: self.config.clone(),
            sender,
            auth_rx: self.auth_events.subscribe(),
            next_ref: 0,
        };
        tokio::spawn(task.run());

        Ok(subscription)
    }
}

/// `https://x.supabase.co` -> `wss://x.supabase.co/realtime/v1/websocket?...`
fn websocket_url(base_url: &str, anon_key: &str) -> String {
    let ws_base = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!(
        "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
        ws_base,
        urlencoding::encode(anon_key)
    )
}

/// Delay before reconnect attempt `attempt` (0-based): 1s, 2s, 4s ... capped at 30s
fn backoff(attempt: u32) -> Duration {
    let ms = 2_u64.saturating_pow(attempt).saturating_mul(1000).min(30_000);
    Duration::from_millis(ms)
}

impl ChannelTask {
    async fn run(mut self) {
        let mut attempts: u32 = 0;
        let mut joined_before = false;

        loop {
            let outcome = match tokio_tungstenite::connect_async(self.endpoint.as_str()).await {
                Ok((socket, _)) => self.drive(socket, &mut joined_before, &mut attempts).await,
                Err(e) => Disconnect::Dropped(e.to_string()),
            };

            match outcome {
                Disconnect::Unsubscribed => {
                    tracing::debug!(topic = %self.topic, "Realtime channel closed");
                    return;
                }
                Disconnect::Rejected(reason) => {
                    tracing::error!(topic = %self.topic, reason = %reason, "Realtime join rejected");
                    return;
                }
                Disconnect::Dropped(reason) => {
                    tracing::warn!(topic = %self.topic, reason = %reason, "Realtime connection lost");
                }
            }

            if attempts >= self.config.max_reconnect_attempts {
                tracing::error!(
                    topic = %self.topic,
                    attempts,
                    "Max reconnect attempts reached, giving up"
                );
                return;
            }

            let delay = backoff(attempts);
            attempts += 1;
            tracing::info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.sender.closed() => return,
            }
        }
    }

    fn reference(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn drive<S>(
        &mut self,
        socket: S,
        joined_before: &mut bool,
        attempts: &mut u32,
    ) -> Disconnect
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        let join_ref = self.reference();
        let join = Frame::join(
            &self.topic,
            &self.schema,
            &self.table,
            &self.filter,
            &self.access_token,
            &join_ref,
        );
        if let Err(e) = send_frame(&mut sink, &join).await {
            return Disconnect::Dropped(e);
        }

        let period = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await;
        let mut pending_heartbeat: Option<String> = None;
        let mut auth_open = true;

        loop {
            tokio::select! {
                _ = self.sender.closed() => {
                    let reference = self.reference();
                    let leave = Frame::leave(&self.topic, &reference);
                    let _ = send_frame(&mut sink, &leave).await;
                    let _ = sink.send(Message::Close(None)).await;
                    return Disconnect::Unsubscribed;
                }

                _ = heartbeat.tick() => {
                    if let Some(missed) = pending_heartbeat.take() {
                        return Disconnect::Dropped(format!("heartbeat {} not acknowledged", missed));
                    }
                    let reference = self.reference();
                    if let Err(e) = send_frame(&mut sink, &Frame::heartbeat(&reference)).await {
                        return Disconnect::Dropped(e);
                    }
                    pending_heartbeat = Some(reference);
                }

                event = self.auth_rx.recv(), if auth_open => {
                    match event {
                        Ok(AuthEvent::TokenRefreshed(session)) | Ok(AuthEvent::SignedIn(session)) => {
                            self.access_token = session.access_token.clone();
                            let reference = self.reference();
                            let frame = Frame::access_token(&self.topic, &self.access_token, &reference);
                            if let Err(e) = send_frame(&mut sink, &frame).await {
                                return Disconnect::Dropped(e);
                            }
                        }
                        // The dashboard tears the subscription down itself
                        Ok(AuthEvent::SignedOut) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => auth_open = false,
                    }
                }

                message = stream.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            return Disconnect::Dropped(format!("closed by server: {:?}", frame));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Disconnect::Dropped(e.to_string()),
                        None => return Disconnect::Dropped("stream ended".to_string()),
                    };

                    let frame: Frame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "Unparseable realtime frame");
                            continue;
                        }
                    };

                    if frame.reference.is_some() && frame.reference == pending_heartbeat {
                        pending_heartbeat = None;
                        continue;
                    }

                    if frame.reference.as_deref() == Some(join_ref.as_str()) {
                        match frame.reply_ok() {
                            Some(true) => {
                                tracing::info!(topic = %self.topic, "Realtime channel joined");
                                *attempts = 0;
                                if *joined_before && !self.sender.send(ChangeEvent::Resynced) {
                                    return Disconnect::Unsubscribed;
                                }
                                *joined_before = true;
                            }
                            Some(false) => {
                                return Disconnect::Rejected(frame.payload.to_string());
                            }
                            None => {}
                        }
                        continue;
                    }

                    if let Some(disconnect) = self.handle_frame(frame) {
                        return disconnect;
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Option<Disconnect> {
        match frame.event.as_str() {
            "postgres_changes" => match frame.change() {
                Some(Ok(event)) => {
                    tracing::debug!(?event, "Change received");
                    if !self.sender.send(event) {
                        return Some(Disconnect::Unsubscribed);
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "Undecodable change"),
                None => {}
            },
            "phx_error" => {
                return Some(Disconnect::Dropped("channel error".to_string()));
            }
            "phx_close" => {
                return Some(Disconnect::Dropped("channel closed by server".to_string()));
            }
            "system" => {
                tracing::debug!(payload = %frame.payload, "Realtime system message");
            }
            other => {
                tracing::trace!(event = %other, "Ignoring realtime event");
            }
        }
        None
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), String>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Text(text)).await.map_err(|e| e.to_string())
}
