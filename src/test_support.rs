// Scripted exchange and stream transport shared by unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::datafeed::Datafeed;
use crate::exchange::{
    interval_ms, BookTop, Capabilities, ExchangeClient, ExchangeRegistry, Market, OhlcvRequest,
    SocketMarket, Ticker,
};
use crate::feed_config::{FeedConfig, TransportConfig};
use crate::subscriptions::{ConnectionId, StreamKind, StreamTransport};
use crate::types::Bar;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOhlcv {
    pub symbol: String,
    pub timeframe: String,
    pub since_ms: i64,
    pub limit: u32,
    pub end_time_ms: Option<i64>,
}

/// Exchange that serves a synthetic, gap-free candle history.
///
/// Every page returns up to `limit` candles aligned to the timeframe,
/// starting at the first boundary at or after `since` and stopping at the
/// end-time filter when one is given.
pub struct MockExchange {
    id: String,
    end_time_filter: bool,
    fail_after_pages: Option<usize>,
    requests: Mutex<Vec<RecordedOhlcv>>,
    market_loads: AtomicUsize,
}

impl MockExchange {
    pub const RATE_LIMIT: Duration = Duration::from_millis(50);

    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            end_time_filter: true,
            fail_after_pages: None,
            requests: Mutex::new(Vec::new()),
            market_loads: AtomicUsize::new(0),
        }
    }

    pub fn without_end_time(mut self) -> Self {
        self.end_time_filter = false;
        self
    }

    /// Serve `pages` pages, then fail every further candle request.
    pub fn failing_after_pages(mut self, pages: usize) -> Self {
        self.fail_after_pages = Some(pages);
        self
    }

    pub fn ohlcv_requests(&self) -> Vec<RecordedOhlcv> {
        self.requests.lock().clone()
    }

    pub fn market_loads(&self) -> usize {
        self.market_loads.load(Ordering::SeqCst)
    }

    fn candle(time: i64) -> Bar {
        // Deterministic prices that differ per candle.
        let open = 100.0 + ((time / 1000) % 97) as f64;
        Bar {
            time,
            open,
            high: open + 1.0,
            low: open - 1.0,
            close: open + 0.5,
            volume: 1.0,
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Mock"
    }

    fn version(&self) -> Option<&str> {
        Some("v1")
    }

    fn timeframes(&self) -> Vec<String> {
        ["1s", "1m", "5m", "1h", "1d", "1w", "1y"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn rate_limit(&self) -> Duration {
        Self::RATE_LIMIT
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fetch_ohlcv: true,
            fetch_bids_asks: true,
            ohlcv_end_time: self.end_time_filter,
        }
    }

    fn socket_market(&self) -> Option<SocketMarket> {
        SocketMarket::from_exchange_id(&self.id)
    }

    async fn load_markets(&self) -> Result<Vec<Market>> {
        self.market_loads.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            Market {
                id: "BTCUSDT".into(),
                base: "BTC".into(),
                quote: "USDT".into(),
                price_decimals: 2,
            },
            Market {
                id: "ETHUSDT".into(),
                base: "ETH".into(),
                quote: "USDT".into(),
                price_decimals: 2,
            },
            Market {
                id: "ETHBTC".into(),
                base: "ETH".into(),
                quote: "BTC".into(),
                price_decimals: 5,
            },
            Market {
                id: "FAILUSDT".into(),
                base: "FAIL".into(),
                quote: "USDT".into(),
                price_decimals: 4,
            },
        ])
    }

    async fn fetch_ohlcv(&self, request: OhlcvRequest<'_>) -> Result<Vec<Bar>> {
        let served = {
            let mut requests = self.requests.lock();
            requests.push(RecordedOhlcv {
                symbol: request.symbol.to_string(),
                timeframe: request.timeframe.to_string(),
                since_ms: request.since_ms,
                limit: request.limit,
                end_time_ms: request.end_time_ms,
            });
            requests.len() - 1
        };
        if matches!(self.fail_after_pages, Some(n) if served >= n) {
            bail!("mock exchange unavailable");
        }

        let step = match request.timeframe {
            "1s" => 1_000,
            tf => interval_ms(tf).unwrap_or(60_000),
        };
        let first = (request.since_ms + step - 1).div_euclid(step) * step;
        Ok((0..request.limit as i64)
            .map(|i| first + i * step)
            .take_while(|t| request.end_time_ms.map_or(true, |end| *t <= end))
            .map(Self::candle)
            .collect())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        if symbol.starts_with("FAIL") {
            bail!("ticker unavailable for {symbol}");
        }
        Ok(Ticker {
            symbol: symbol.to_string(),
            change: Some(100.0),
            percentage: Some(0.27),
            last: Some(37000.0),
            open: Some(36900.0),
            high: Some(37500.0),
            low: Some(36500.0),
            previous_close: Some(36900.0),
            base_volume: Some(1000.0),
            bid: None,
            ask: None,
        })
    }

    async fn fetch_bids_asks(&self, _symbol: &str) -> Result<BookTop> {
        Ok(BookTop {
            bid: Some(36999.5),
            ask: Some(37000.5),
        })
    }
}

// -----------------------------------------------------------------------------
// RecordingTransport
// -----------------------------------------------------------------------------

/// Transport that only records which connections are open.
#[derive(Default)]
pub struct RecordingTransport {
    next_id: AtomicU64,
    opened: Mutex<Vec<(ConnectionId, SocketMarket, StreamKind)>>,
    closed: Mutex<Vec<ConnectionId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<(ConnectionId, SocketMarket, StreamKind)> {
        self.opened.lock().clone()
    }

    pub fn closed(&self) -> Vec<ConnectionId> {
        self.closed.lock().clone()
    }

    /// Connections opened and not yet closed.
    pub fn live(&self) -> Vec<(ConnectionId, StreamKind)> {
        let closed = self.closed.lock();
        self.opened
            .lock()
            .iter()
            .filter(|(id, _, _)| !closed.contains(id))
            .map(|(id, _, kind)| (*id, kind.clone()))
            .collect()
    }

    /// Id of the live connection streaming `kind`.
    pub fn connection_for(&self, kind: &StreamKind) -> Option<ConnectionId> {
        self.live()
            .into_iter()
            .find(|(_, k)| k == kind)
            .map(|(id, _)| id)
    }
}

impl StreamTransport for RecordingTransport {
    fn open(&self, market: SocketMarket, kind: StreamKind) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.opened.lock().push((id, market, kind));
        id
    }

    fn close(&self, id: ConnectionId) {
        self.closed.lock().push(id);
    }
}

// -----------------------------------------------------------------------------
// Datafeed fixture
// -----------------------------------------------------------------------------

/// Datafeed over mock `binance` and `binanceusdm` exchanges, plus the
/// transport it opens streams on.
pub fn mock_datafeed() -> (Arc<RecordingTransport>, Datafeed) {
    let mut registry = ExchangeRegistry::new(TransportConfig::default());
    for id in ["binance", "binanceusdm"] {
        registry.register(
            id,
            Box::new(move |_: &TransportConfig| -> Result<Arc<dyn ExchangeClient>> {
                Ok(Arc::new(MockExchange::new(id)))
            }),
        );
    }
    let transport = Arc::new(RecordingTransport::new());
    let feed = Datafeed::new(Arc::new(registry), transport.clone(), &FeedConfig::default());
    (transport, feed)
}
