// =============================================================================
// Exchange abstraction
// =============================================================================
//
// The bridge treats exchange REST clients as black boxes behind
// `ExchangeClient`: fetch historical candles, fetch a 24h ticker, fetch the
// best bid/ask, load the market listing. The registry wraps each client in an
// `ExchangeHandle` carrying the derived resolution table and pacing delay.

pub mod registry;
pub mod resolution;

pub use registry::{ExchangeHandle, ExchangeRegistry};
pub use resolution::{interval_ms, union_resolutions};

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::Bar;

/// Low-level push-stream family a client's events arrive tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketMarket {
    Spot,
    UsdM,
    CoinM,
}

impl SocketMarket {
    pub const ALL: [SocketMarket; 3] = [Self::Spot, Self::UsdM, Self::CoinM];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::UsdM => "usdm",
            Self::CoinM => "coinm",
        }
    }

    /// Canonical exchange id served by this socket family.
    pub const fn exchange_id(&self) -> &'static str {
        match self {
            Self::Spot => "binance",
            Self::UsdM => "binanceusdm",
            Self::CoinM => "binancecoinm",
        }
    }

    pub fn from_exchange_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.exchange_id() == id)
    }
}

impl std::fmt::Display for SocketMarket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a client can do beyond the basics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub fetch_ohlcv: bool,
    pub fetch_bids_asks: bool,
    /// The candle endpoint needs an explicit end-time filter next to the
    /// start cursor.
    pub ohlcv_end_time: bool,
}

/// One tradable market from the exchange listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub id: String,
    pub base: String,
    pub quote: String,
    /// Number of decimals of the price tick.
    pub price_decimals: u32,
}

/// 24-hour ticker statistics as returned by a REST snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub change: Option<f64>,
    pub percentage: Option<f64>,
    pub last: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub previous_close: Option<f64>,
    pub base_volume: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BookTop {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

/// A single page request for historical candles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OhlcvRequest<'a> {
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub since_ms: i64,
    pub limit: u32,
    pub end_time_ms: Option<i64>,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Lower-case canonical id, e.g. `binanceusdm`.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn version(&self) -> Option<&str> {
        None
    }

    /// Native timeframes the candle endpoint accepts.
    fn timeframes(&self) -> Vec<String>;

    /// Advertised minimum spacing between requests.
    fn rate_limit(&self) -> Duration;

    fn capabilities(&self) -> Capabilities;

    /// Push-stream family, when the exchange has live streams.
    fn socket_market(&self) -> Option<SocketMarket> {
        None
    }

    async fn load_markets(&self) -> Result<Vec<Market>>;

    /// Candles in chronological order, starting at `since_ms`.
    async fn fetch_ohlcv(&self, request: OhlcvRequest<'_>) -> Result<Vec<Bar>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn fetch_bids_asks(&self, symbol: &str) -> Result<BookTop>;
}
