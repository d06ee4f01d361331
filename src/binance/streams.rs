// =============================================================================
// Binance WebSocket streams — one reconnecting task per physical connection
// =============================================================================
//
// `open` spawns a task that connects to a single raw stream
// (`wss://.../ws/<symbol>@<stream>`), classifies every text frame and pushes
// it into the shared inbound channel. When the stream ends or errors the task
// waits `reconnect_delay` and connects again; the first frame after a
// successful reconnect is an `InboundPayload::Reconnected` marker. `close`
// aborts the task, which drops the socket.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::exchange::SocketMarket;
use crate::market_data::events::classify;
use crate::subscriptions::{ConnectionId, InboundEvent, InboundPayload, StreamKind, StreamTransport};

pub const fn ws_base_url(market: SocketMarket) -> &'static str {
    match market {
        SocketMarket::Spot => "wss://stream.binance.com:9443/ws",
        SocketMarket::UsdM => "wss://fstream.binance.com/ws",
        SocketMarket::CoinM => "wss://dstream.binance.com/ws",
    }
}

pub fn stream_url(market: SocketMarket, kind: &StreamKind) -> String {
    format!("{}/{}", ws_base_url(market), kind.stream_name())
}

pub struct BinanceStreams {
    events: mpsc::UnboundedSender<InboundEvent>,
    reconnect_delay: Duration,
    /// Replaces the per-market host when set.
    base_url: Option<String>,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
}

impl BinanceStreams {
    pub fn new(events: mpsc::UnboundedSender<InboundEvent>, reconnect_delay: Duration) -> Self {
        Self {
            events,
            reconnect_delay,
            base_url: None,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Connect every stream to `base_url` instead of the Binance hosts.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn url_for(&self, market: SocketMarket, kind: &StreamKind) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base, kind.stream_name()),
            None => stream_url(market, kind),
        }
    }

    /// Number of connection tasks currently running.
    pub fn open_connections(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl StreamTransport for BinanceStreams {
    fn open(&self, market: SocketMarket, kind: StreamKind) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let url = self.url_for(market, &kind);
        let tx = self.events.clone();
        let delay = self.reconnect_delay;

        info!(connection = %id, url = %url, "opening stream connection");
        let handle = tokio::spawn(async move {
            let mut reconnecting = false;
            loop {
                match run_stream(&url, id, market, &tx, reconnecting).await {
                    Ok(()) => warn!(connection = %id, "stream ended"),
                    Err(e) => error!(connection = %id, error = %e, "stream failed"),
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
                reconnecting = true;
            }
        });

        self.tasks.lock().insert(id, handle);
        id
    }

    fn close(&self, id: ConnectionId) {
        match self.tasks.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                info!(connection = %id, "stream connection closed");
            }
            None => debug!(connection = %id, "close for unknown connection ignored"),
        }
    }
}

impl Drop for BinanceStreams {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

/// Connect once and forward classified events until the stream ends.
async fn run_stream(
    url: &str,
    connection: ConnectionId,
    market: SocketMarket,
    tx: &mpsc::UnboundedSender<InboundEvent>,
    reconnecting: bool,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(connection = %connection, "stream connected");

    if reconnecting {
        let _ = tx.send(InboundEvent {
            connection,
            market,
            payload: InboundPayload::Reconnected,
        });
    }

    // Pings are answered by tungstenite on the next read.
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        let msg = msg.context("stream read error")?;
        let Message::Text(text) = msg else {
            continue;
        };
        match classify(&text) {
            Ok(Some(event)) => {
                debug!(connection = %connection, symbol = event.symbol(), "push event");
                let inbound = InboundEvent {
                    connection,
                    market,
                    payload: InboundPayload::Push(event),
                };
                if tx.send(inbound).is_err() {
                    // Receiver gone: the process is shutting down.
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => warn!(connection = %connection, error = %e, "failed to parse stream message"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_per_market() {
        let kline = StreamKind::Kline { symbol: "BTCUSDT".into(), interval: "1h".into() };
        assert_eq!(
            stream_url(SocketMarket::Spot, &kline),
            "wss://stream.binance.com:9443/ws/btcusdt@kline_1h"
        );
        assert_eq!(
            stream_url(SocketMarket::UsdM, &StreamKind::BookTicker { symbol: "ETHUSDT".into() }),
            "wss://fstream.binance.com/ws/ethusdt@bookTicker"
        );
        assert_eq!(
            stream_url(
                SocketMarket::CoinM,
                &StreamKind::DiffDepth { symbol: "BTCUSD_PERP".into(), speed_ms: 100 }
            ),
            "wss://dstream.binance.com/ws/btcusd_perp@depth@100ms"
        );
    }

    #[test]
    fn base_url_override_keeps_stream_name() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let streams = BinanceStreams::new(tx, Duration::from_secs(1)).with_base_url("ws://127.0.0.1:9/ws");
        let kind = StreamKind::Kline { symbol: "BTCUSDT".into(), interval: "1m".into() };
        assert_eq!(streams.url_for(SocketMarket::Spot, &kind), "ws://127.0.0.1:9/ws/btcusdt@kline_1m");
    }

    #[tokio::test]
    async fn open_and_close_track_tasks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Nothing listens on the discard port; the task retries until aborted.
        let streams =
            BinanceStreams::new(tx, Duration::from_secs(60)).with_base_url("ws://127.0.0.1:9/ws");
        let a = streams.open(SocketMarket::Spot, StreamKind::Ticker24h { symbol: "BTCUSDT".into() });
        let b = streams.open(SocketMarket::Spot, StreamKind::BookTicker { symbol: "BTCUSDT".into() });
        assert_ne!(a, b);
        assert_eq!(streams.open_connections(), 2);

        streams.close(a);
        streams.close(a);
        assert_eq!(streams.open_connections(), 1);
    }
}
