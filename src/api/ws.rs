// =============================================================================
// WebSocket Handler — live bar, quote and depth subscriptions
// =============================================================================
//
// Clients connect to `/api/v1/ws` and drive subscriptions with JSON messages
// tagged by `op`:
//   subscribe_bars / unsubscribe_bars
//   subscribe_quotes / unsubscribe_quotes
//   subscribe_depth / unsubscribe_depth
//
// Pushes go back tagged by `type`: `bar`, `reset_cache`, `quotes`, `depth`,
// `depth_subscribed` and `error`.
//
// Client-chosen ids are namespaced with the session id before they reach the
// multiplexer, so two browser tabs may both use "chart-1". Everything a
// session subscribed is released when the socket closes.
//
// Pushes are queued per session with a fixed capacity. A client that lets the
// queue fill up is disconnected; it resubscribes on reconnect.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::datafeed::Datafeed;
use crate::error::FeedError;
use crate::types::{Bar, DepthUpdate, Quote};

// =============================================================================
// Wire messages
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeBars {
        symbol: String,
        resolution: String,
        subscriber_id: String,
    },
    UnsubscribeBars {
        subscriber_id: String,
    },
    SubscribeQuotes {
        #[serde(default)]
        symbols: Vec<String>,
        #[serde(default)]
        fast_symbols: Vec<String>,
        listener_id: String,
    },
    UnsubscribeQuotes {
        listener_id: String,
    },
    SubscribeDepth {
        symbol: String,
        request_id: String,
    },
    UnsubscribeDepth {
        subscription_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Bar {
        subscriber_id: String,
        bar: Bar,
    },
    ResetCache {
        subscriber_id: String,
    },
    Quotes {
        listener_id: String,
        quotes: Vec<Quote>,
    },
    Depth {
        request_id: String,
        update: DepthUpdate,
    },
    DepthSubscribed {
        request_id: String,
        subscription_id: String,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// Pushes a session may have queued but not yet written to its socket.
pub const PUSH_QUEUE_CAPACITY: usize = 256;

/// Sending half of a session's push queue, shared with its callbacks.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
    lagging: Arc<AtomicBool>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            tx,
            lagging: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue `msg` without waiting. A full queue drops it and marks the
    /// session as lagging.
    pub fn push(&self, msg: ServerMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.lagging.swap(true, Ordering::Relaxed) {
                    warn!("WebSocket push queue full, dropping session");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Relaxed)
    }
}

impl From<FeedError> for ServerMessage {
    fn from(e: FeedError) -> Self {
        Self::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(feed): State<Arc<Datafeed>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, feed))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, feed: Arc<Datafeed>) {
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(PUSH_QUEUE_CAPACITY);
    let mut session = Session::new(feed, Outbox::new(out_tx));
    info!(session = %session.id, "WebSocket session opened");

    let (mut sender, mut receiver) = socket.split();

    loop {
        if session.is_lagging() {
            warn!(session = %session.id, "client not keeping up with pushes, disconnecting");
            break;
        }
        tokio::select! {
            // ── Push loop: forward multiplexer callbacks ────────────────
            Some(msg) = out_rx.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to serialise push");
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!(error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            // ── Recv loop: subscription requests ────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    session.close();
}

// =============================================================================
// Session
// =============================================================================

/// Subscriptions owned by one socket.
pub struct Session {
    id: String,
    feed: Arc<Datafeed>,
    out: Outbox,
    bar_ids: HashSet<String>,
    listener_ids: HashSet<String>,
    depth_ids: HashSet<String>,
}

impl Session {
    pub fn new(feed: Arc<Datafeed>, out: Outbox) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            feed,
            out,
            bar_ids: HashSet::new(),
            listener_ids: HashSet::new(),
            depth_ids: HashSet::new(),
        }
    }

    fn scoped(&self, id: &str) -> String {
        format!("{}:{}", self.id, id)
    }

    fn push(&self, msg: ServerMessage) {
        self.out.push(msg);
    }

    pub fn is_lagging(&self) -> bool {
        self.out.is_lagging()
    }

    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => {
                if let Err(e) = self.handle(msg).await {
                    debug!(session = %self.id, error = %e, "subscription request rejected");
                    self.push(e.into());
                }
            }
            Err(e) => self.push(ServerMessage::Error {
                kind: "bad-request".to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn handle(&mut self, msg: ClientMessage) -> Result<(), FeedError> {
        match msg {
            ClientMessage::SubscribeBars { symbol, resolution, subscriber_id } => {
                let info = self.feed.resolve_symbol(&symbol).await?;
                let bar_tx = self.out.clone();
                let reset_tx = self.out.clone();
                let bar_id = subscriber_id.clone();
                let reset_id = subscriber_id.clone();

                self.feed.subscribe_bars(
                    &info,
                    &resolution,
                    &self.scoped(&subscriber_id),
                    Arc::new(move |bar: &Bar| {
                        bar_tx.push(ServerMessage::Bar {
                            subscriber_id: bar_id.clone(),
                            bar: *bar,
                        });
                    }),
                    Arc::new(move || {
                        reset_tx.push(ServerMessage::ResetCache {
                            subscriber_id: reset_id.clone(),
                        });
                    }),
                )?;
                self.bar_ids.insert(subscriber_id);
            }
            ClientMessage::UnsubscribeBars { subscriber_id } => {
                self.feed.unsubscribe_bars(&self.scoped(&subscriber_id));
                self.bar_ids.remove(&subscriber_id);
            }
            ClientMessage::SubscribeQuotes { symbols, fast_symbols, listener_id } => {
                let tx = self.out.clone();
                let id = listener_id.clone();
                self.feed.subscribe_quotes(
                    &symbols,
                    &fast_symbols,
                    &self.scoped(&listener_id),
                    Arc::new(move |quotes: &[Quote]| {
                        tx.push(ServerMessage::Quotes {
                            listener_id: id.clone(),
                            quotes: quotes.to_vec(),
                        });
                    }),
                );
                self.listener_ids.insert(listener_id);
            }
            ClientMessage::UnsubscribeQuotes { listener_id } => {
                self.feed.unsubscribe_quotes(&self.scoped(&listener_id));
                self.listener_ids.remove(&listener_id);
            }
            ClientMessage::SubscribeDepth { symbol, request_id } => {
                let tx = self.out.clone();
                let id = request_id.clone();
                let subscription_id = self.feed.subscribe_depth(
                    &symbol,
                    Arc::new(move |update: &DepthUpdate| {
                        tx.push(ServerMessage::Depth {
                            request_id: id.clone(),
                            update: update.clone(),
                        });
                    }),
                )?;
                self.depth_ids.insert(subscription_id.clone());
                self.push(ServerMessage::DepthSubscribed { request_id, subscription_id });
            }
            ClientMessage::UnsubscribeDepth { subscription_id } => {
                // Ids are minted by the multiplexer; only release our own.
                if self.depth_ids.remove(&subscription_id) {
                    self.feed.unsubscribe_depth(&subscription_id);
                }
            }
        }
        Ok(())
    }

    /// Release every subscription this session still holds.
    pub fn close(self) {
        for id in &self.bar_ids {
            self.feed.unsubscribe_bars(&self.scoped(id));
        }
        for id in &self.listener_ids {
            self.feed.unsubscribe_quotes(&self.scoped(id));
        }
        for id in &self.depth_ids {
            self.feed.unsubscribe_depth(id);
        }
        info!(
            session = %self.id,
            bars = self.bar_ids.len(),
            quotes = self.listener_ids.len(),
            depth = self.depth_ids.len(),
            "WebSocket session closed"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SocketMarket;
    use crate::market_data::{DepthDeltaEvent, KlineEvent, PushEvent};
    use crate::subscriptions::{InboundEvent, InboundPayload, StreamKind};
    use crate::test_support::mock_datafeed;

    fn session_with_capacity(
        capacity: usize,
    ) -> (
        Arc<crate::test_support::RecordingTransport>,
        Arc<Datafeed>,
        Session,
        mpsc::Receiver<ServerMessage>,
    ) {
        let (transport, feed) = mock_datafeed();
        let feed = Arc::new(feed);
        let (tx, rx) = mpsc::channel(capacity);
        let session = Session::new(feed.clone(), Outbox::new(tx));
        (transport, feed, session, rx)
    }

    fn session() -> (
        Arc<crate::test_support::RecordingTransport>,
        Arc<Datafeed>,
        Session,
        mpsc::Receiver<ServerMessage>,
    ) {
        session_with_capacity(PUSH_QUEUE_CAPACITY)
    }

    #[tokio::test]
    async fn bar_subscription_pushes_client_id() {
        let (transport, feed, mut session, mut rx) = session();
        session
            .handle_text(r#"{"op":"subscribe_bars","symbol":"BINANCE:BTCUSDT","resolution":"1","subscriber_id":"chart-1"}"#)
            .await;

        let kind = StreamKind::Kline { symbol: "BTCUSDT".into(), interval: "1m".into() };
        let connection = transport.connection_for(&kind).expect("kline stream");
        feed.handle_event(InboundEvent {
            connection,
            market: SocketMarket::Spot,
            payload: InboundPayload::Push(PushEvent::Kline(KlineEvent {
                symbol: "BTCUSDT".into(),
                interval: "1m".into(),
                start_time: 1_700_000_040_000,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 3.0,
            })),
        });

        match rx.try_recv().unwrap() {
            ServerMessage::Bar { subscriber_id, bar } => {
                assert_eq!(subscriber_id, "chart-1");
                assert_eq!(bar.time, 1_700_000_040_000);
            }
            other => panic!("unexpected push {other:?}"),
        }

        session.close();
        assert!(transport.live().is_empty());
        assert_eq!(feed.stats().bar_handlers, 0);
    }

    #[tokio::test]
    async fn same_client_id_in_two_sessions_is_independent() {
        let (transport, feed, mut a, _rx_a) = session();
        let (tx_b, _rx_b) = mpsc::channel(PUSH_QUEUE_CAPACITY);
        let mut b = Session::new(feed.clone(), Outbox::new(tx_b));

        let msg = r#"{"op":"subscribe_bars","symbol":"BINANCE:ETHUSDT","resolution":"60","subscriber_id":"chart-1"}"#;
        a.handle_text(msg).await;
        b.handle_text(msg).await;
        assert_eq!(feed.stats().bar_handlers, 2);
        assert_eq!(transport.opened().len(), 1);

        a.handle_text(r#"{"op":"unsubscribe_bars","subscriber_id":"chart-1"}"#).await;
        assert_eq!(feed.stats().bar_handlers, 1);
        assert_eq!(transport.live().len(), 1);
        b.close();
        assert!(transport.live().is_empty());
    }

    #[tokio::test]
    async fn depth_subscription_acknowledges_and_relays() {
        let (transport, feed, mut session, mut rx) = session();
        session
            .handle_text(r#"{"op":"subscribe_depth","symbol":"BINANCE:BTCUSDT","request_id":"book"}"#)
            .await;

        let subscription_id = match rx.try_recv().unwrap() {
            ServerMessage::DepthSubscribed { request_id, subscription_id } => {
                assert_eq!(request_id, "book");
                subscription_id
            }
            other => panic!("unexpected push {other:?}"),
        };

        let (connection, _, _) = transport.opened()[0].clone();
        feed.handle_event(InboundEvent {
            connection,
            market: SocketMarket::Spot,
            payload: InboundPayload::Push(PushEvent::DepthDelta(DepthDeltaEvent {
                symbol: "BTCUSDT".into(),
                bids: vec![(99.0, 1.0)],
                asks: vec![],
            })),
        });
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Depth { .. }));

        session
            .handle_text(&format!(r#"{{"op":"unsubscribe_depth","subscription_id":"{subscription_id}"}}"#))
            .await;
        assert_eq!(feed.stats().depth_subscriptions, 0);
    }

    #[tokio::test]
    async fn rejected_requests_push_errors() {
        let (_transport, _feed, mut session, mut rx) = session();

        session
            .handle_text(r#"{"op":"subscribe_bars","symbol":"KRAKEN:XBTUSD","resolution":"1","subscriber_id":"x"}"#)
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, "unsupported-exchange"),
            other => panic!("unexpected push {other:?}"),
        }

        session.handle_text(r#"{"op":"dance"}"#).await;
        match rx.try_recv().unwrap() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, "bad-request"),
            other => panic!("unexpected push {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_client_queue_stays_bounded() {
        let (transport, feed, mut session, mut rx) = session_with_capacity(4);
        session
            .handle_text(r#"{"op":"subscribe_depth","symbol":"BINANCE:BTCUSDT","request_id":"book"}"#)
            .await;
        assert!(!session.is_lagging());

        // Nobody drains the queue while deltas keep arriving.
        let (connection, _, _) = transport.opened()[0].clone();
        for i in 0..50 {
            feed.handle_event(InboundEvent {
                connection,
                market: SocketMarket::Spot,
                payload: InboundPayload::Push(PushEvent::DepthDelta(DepthDeltaEvent {
                    symbol: "BTCUSDT".into(),
                    bids: vec![(100.0 + i as f64, 1.0)],
                    asks: vec![],
                })),
            });
        }
        assert!(session.is_lagging());

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);

        session.close();
        assert!(transport.live().is_empty());
    }

    #[test]
    fn push_messages_are_tagged_by_type() {
        let json = serde_json::to_value(ServerMessage::ResetCache { subscriber_id: "c".into() }).unwrap();
        assert_eq!(json["type"], "reset_cache");
        assert_eq!(json["subscriber_id"], "c");
    }
}
