// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// One client per market family. The three families share response shapes and
// differ only in host and path prefix:
//
//   spot   https://api.binance.com/api/v3
//   usdm   https://fapi.binance.com/fapi/v1
//   coinm  https://dapi.binance.com/dapi/v1
//
// Every response feeds the request-weight tracker; a request that would blow
// the weight budget is refused before it is sent.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::exchange::{
    BookTop, Capabilities, ExchangeClient, Market, OhlcvRequest, SocketMarket, Ticker,
};
use crate::feed_config::TransportConfig;
use crate::market_data::events::parse_string_f64;
use crate::types::Bar;

use super::rate_limit::RateLimitTracker;

/// Minimum spacing between requests advertised for every family.
const RATE_LIMIT: Duration = Duration::from_millis(50);

// Endpoint weights.
const WEIGHT_KLINES: u32 = 2;
const WEIGHT_TICKER: u32 = 2;
const WEIGHT_BOOK_TICKER: u32 = 2;
const WEIGHT_EXCHANGE_INFO: u32 = 20;

const FUTURES_TIMEFRAMES: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

#[derive(Clone, Copy)]
struct Family {
    id: &'static str,
    name: &'static str,
    version: &'static str,
    base_url: &'static str,
    prefix: &'static str,
    /// Weight ceiling kept below the exchange's per-minute limit.
    weight_limit: u32,
}

const fn family(market: SocketMarket) -> Family {
    match market {
        SocketMarket::Spot => Family {
            id: "binance",
            name: "Binance",
            version: "v3",
            base_url: "https://api.binance.com",
            prefix: "/api/v3",
            weight_limit: 5000,
        },
        SocketMarket::UsdM => Family {
            id: "binanceusdm",
            name: "Binance USDⓈ-M",
            version: "v1",
            base_url: "https://fapi.binance.com",
            prefix: "/fapi/v1",
            weight_limit: 2000,
        },
        SocketMarket::CoinM => Family {
            id: "binancecoinm",
            name: "Binance COIN-M",
            version: "v1",
            base_url: "https://dapi.binance.com",
            prefix: "/dapi/v1",
            weight_limit: 2000,
        },
    }
}

/// Binance REST API client for one market family.
pub struct BinanceClient {
    market: SocketMarket,
    family: Family,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(market: SocketMarket, transport: &TransportConfig) -> Result<Self> {
        let family = family(market);

        let mut builder = reqwest::Client::builder();
        if !transport.timeout.is_zero() {
            builder = builder.timeout(transport.timeout);
        }
        if let Some(proxy) = &transport.proxy_url {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .with_context(|| format!("invalid proxy url {proxy}"))?,
            );
        }
        let client = builder.build().context("failed to build reqwest client")?;

        debug!(
            exchange = family.id,
            base_url = family.base_url,
            proxied = transport.proxy_url.is_some(),
            "BinanceClient initialised"
        );

        Ok(Self {
            market,
            family,
            client,
            rate_limit: RateLimitTracker::new(family.weight_limit),
        })
    }

    // -------------------------------------------------------------------------
    // Request helper
    // -------------------------------------------------------------------------

    /// GET `{prefix}/{endpoint}?{query}` and return the JSON body.
    async fn get(&self, endpoint: &str, query: &str, weight: u32) -> Result<Value> {
        let path = format!("{}/{}", self.family.prefix, endpoint);
        if !self.rate_limit.can_send_request(weight) {
            anyhow::bail!("GET {path} refused: request weight budget exhausted");
        }

        let url = if query.is_empty() {
            format!("{}{}", self.family.base_url, path)
        } else {
            format!("{}{}?{}", self.family.base_url, path, query)
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn id(&self) -> &str {
        self.family.id
    }

    fn name(&self) -> &str {
        self.family.name
    }

    fn version(&self) -> Option<&str> {
        Some(self.family.version)
    }

    fn timeframes(&self) -> Vec<String> {
        let mut tfs: Vec<String> = Vec::with_capacity(FUTURES_TIMEFRAMES.len() + 1);
        if self.market == SocketMarket::Spot {
            tfs.push("1s".to_string());
        }
        tfs.extend(FUTURES_TIMEFRAMES.iter().map(|s| s.to_string()));
        tfs
    }

    fn rate_limit(&self) -> Duration {
        RATE_LIMIT
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fetch_ohlcv: true,
            fetch_bids_asks: true,
            ohlcv_end_time: true,
        }
    }

    fn socket_market(&self) -> Option<SocketMarket> {
        Some(self.market)
    }

    #[instrument(skip(self), name = "binance::load_markets")]
    async fn load_markets(&self) -> Result<Vec<Market>> {
        let body = self.get("exchangeInfo", "", WEIGHT_EXCHANGE_INFO).await?;
        let markets = parse_markets(&body)?;
        debug!(count = markets.len(), "exchangeInfo fetched");
        Ok(markets)
    }

    /// GET klines. Rows are `[openTime, open, high, low, close, volume, ...]`.
    #[instrument(skip(self), name = "binance::fetch_ohlcv")]
    async fn fetch_ohlcv(&self, request: OhlcvRequest<'_>) -> Result<Vec<Bar>> {
        let mut query = format!(
            "symbol={}&interval={}&startTime={}&limit={}",
            request.symbol, request.timeframe, request.since_ms, request.limit
        );
        if let Some(end) = request.end_time_ms {
            query.push_str(&format!("&endTime={end}"));
        }

        let body = self.get("klines", &query, WEIGHT_KLINES).await?;
        let bars = parse_kline_rows(&body)?;
        debug!(symbol = request.symbol, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let body = self
            .get("ticker/24hr", &format!("symbol={symbol}"), WEIGHT_TICKER)
            .await?;
        // COIN-M answers with a one-element array.
        let entry = match &body {
            Value::Array(items) => items.first().context("empty ticker/24hr response")?,
            other => other,
        };
        parse_ticker(entry)
    }

    #[instrument(skip(self), name = "binance::fetch_bids_asks")]
    async fn fetch_bids_asks(&self, symbol: &str) -> Result<BookTop> {
        let body = self
            .get("ticker/bookTicker", &format!("symbol={symbol}"), WEIGHT_BOOK_TICKER)
            .await?;
        let entry = match &body {
            Value::Array(items) => items.first().context("empty bookTicker response")?,
            other => other,
        };
        Ok(BookTop {
            bid: optional_price(entry, "bidPrice"),
            ask: optional_price(entry, "askPrice"),
        })
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("exchange", &self.family.id)
            .field("base_url", &self.family.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

fn parse_kline_rows(body: &Value) -> Result<Vec<Bar>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        bars.push(Bar {
            time: arr[0].as_i64().context("kline open time is not an integer")?,
            open: parse_string_f64(&arr[1], "open")?,
            high: parse_string_f64(&arr[2], "high")?,
            low: parse_string_f64(&arr[3], "low")?,
            close: parse_string_f64(&arr[4], "close")?,
            volume: parse_string_f64(&arr[5], "volume")?,
        });
    }
    Ok(bars)
}

fn parse_ticker(entry: &Value) -> Result<Ticker> {
    Ok(Ticker {
        symbol: entry["symbol"]
            .as_str()
            .context("ticker missing symbol")?
            .to_string(),
        change: optional_f64(entry, "priceChange"),
        percentage: optional_f64(entry, "priceChangePercent"),
        last: optional_f64(entry, "lastPrice"),
        open: optional_f64(entry, "openPrice"),
        high: optional_f64(entry, "highPrice"),
        low: optional_f64(entry, "lowPrice"),
        previous_close: optional_f64(entry, "prevClosePrice"),
        base_volume: optional_f64(entry, "volume"),
        bid: optional_price(entry, "bidPrice"),
        ask: optional_price(entry, "askPrice"),
    })
}

fn parse_markets(body: &Value) -> Result<Vec<Market>> {
    let symbols = body["symbols"]
        .as_array()
        .context("exchangeInfo response missing 'symbols' array")?;

    Ok(symbols
        .iter()
        .filter(|s| is_trading(s))
        .filter_map(|s| {
            let tick = s["filters"]
                .as_array()
                .and_then(|filters| {
                    filters
                        .iter()
                        .find(|f| f["filterType"].as_str() == Some("PRICE_FILTER"))
                })
                .and_then(|f| f["tickSize"].as_str());
            Some(Market {
                id: s["symbol"].as_str()?.to_string(),
                base: s["baseAsset"].as_str()?.to_string(),
                quote: s["quoteAsset"].as_str()?.to_string(),
                price_decimals: tick.map(tick_decimals).unwrap_or(0),
            })
        })
        .collect())
}

/// Spot and USD-M report `status`, COIN-M reports `contractStatus`.
fn is_trading(symbol: &Value) -> bool {
    let status = symbol["status"]
        .as_str()
        .or_else(|| symbol["contractStatus"].as_str());
    status.map_or(true, |s| s == "TRADING")
}

/// Significant decimals of a tick size string: "0.01000000" -> 2.
fn tick_decimals(tick: &str) -> u32 {
    match tick.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

fn optional_f64(entry: &Value, field: &str) -> Option<f64> {
    entry.get(field).and_then(|v| parse_string_f64(v, field).ok())
}

/// Book prices of an empty side come back as "0".
fn optional_price(entry: &Value, field: &str) -> Option<f64> {
    optional_f64(entry, field).filter(|p| *p > 0.0)
}
