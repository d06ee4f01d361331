// =============================================================================
// Shared types used across the chart feed bridge
// =============================================================================
//
// Wire shapes follow the charting library's datafeed contract: bars carry a
// millisecond `time`, quotes use the short `s` / `n` / `v` envelope, and depth
// levels are `{price, volume}` pairs.
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Bars
// =============================================================================

/// A single OHLCV bar. `time` is the interval start in milliseconds since the
/// UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Result of a historical fetch. `no_data` is set when the exchange returned
/// zero bars for the requested range; that is not an error.
#[derive(Debug, Clone, Serialize)]
pub struct BarsResult {
    pub bars: Vec<Bar>,
    #[serde(rename = "noData")]
    pub no_data: bool,
}

// =============================================================================
// Channel keys
// =============================================================================

/// Deduplication key of one logical data stream.
///
/// Bar channels carry the exchange's native timeframe in `resolution`; quote
/// and depth channels leave it empty.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct ChannelKey {
    pub exchange: String,
    pub symbol: String,
    pub resolution: Option<String>,
}

impl ChannelKey {
    pub fn bars(exchange: &str, symbol: &str, timeframe: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            resolution: Some(timeframe.to_string()),
        }
    }

    pub fn quotes(exchange: &str, symbol: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            resolution: None,
        }
    }

    /// Depth channels share the quote key shape.
    pub fn depth(exchange: &str, symbol: &str) -> Self {
        Self::quotes(exchange, symbol)
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.resolution {
            Some(res) => write!(f, "{}:{}:{}", self.exchange, self.symbol, res),
            None => write!(f, "{}:{}", self.exchange, self.symbol),
        }
    }
}

// =============================================================================
// Symbol names
// =============================================================================

/// A parsed `EXCHANGE:SYMBOL` ticker. The exchange part is lower-cased; a
/// ticker without a colon has an empty exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolName {
    pub name: String,
    pub symbol: String,
    pub exchange: String,
}

impl SymbolName {
    pub fn parse(ticker: &str) -> Self {
        match ticker.split_once(':') {
            Some((exchange, rest)) => {
                // Anything after a second colon is not part of the market id.
                let symbol = rest.split(':').next().unwrap_or(rest);
                Self {
                    name: ticker.to_string(),
                    symbol: symbol.to_string(),
                    exchange: exchange.to_lowercase(),
                }
            }
            None => Self {
                name: ticker.to_string(),
                symbol: ticker.to_string(),
                exchange: String::new(),
            },
        }
    }

    /// Canonical output form, exchange upper-cased.
    pub fn ticker(&self) -> String {
        format!("{}:{}", self.exchange.to_uppercase(), self.symbol)
    }
}

// =============================================================================
// Quotes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteStatus {
    Ok,
    Error,
}

/// Composite last-known quote for one symbol. Values are only ever patched,
/// never replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    #[serde(rename = "s")]
    pub status: QuoteStatus,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "v")]
    pub values: QuoteValues,
}

impl Quote {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            status: QuoteStatus::Ok,
            name: name.into(),
            values: QuoteValues::default(),
        }
    }

    pub fn error(name: impl Into<String>) -> Self {
        Self {
            status: QuoteStatus::Error,
            name: name.into(),
            values: QuoteValues::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuoteValues {
    #[serde(rename = "ch", skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
    #[serde(rename = "chp", skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<f64>,
    #[serde(rename = "lp", skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_close_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// =============================================================================
// Depth
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DepthLevel {
    pub price: f64,
    pub volume: f64,
}

/// One relayed order-book delta. `snapshot` is always false: the bridge never
/// reconstructs the full book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthUpdate {
    pub snapshot: bool,
    pub asks: Vec<DepthLevel>,
    pub bids: Vec<DepthLevel>,
}

// =============================================================================
// Datafeed configuration & symbol metadata
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeDescriptor {
    pub value: String,
    pub name: String,
    pub desc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolType {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatafeedConfiguration {
    pub exchanges: Vec<ExchangeDescriptor>,
    pub symbols_types: Vec<SymbolType>,
    pub supported_resolutions: Vec<String>,
    pub supports_time: bool,
    pub supports_search: bool,
    pub supports_marks: bool,
    pub supports_timescale_marks: bool,
    pub supports_group_request: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub symbol: String,
    pub full_name: String,
    pub description: String,
    pub ticker: String,
    pub exchange: String,
    #[serde(rename = "type")]
    pub symbol_type: String,
}

/// Symbol metadata handed to the chart by `resolveSymbol` and echoed back on
/// `getBars` / `subscribeBars`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub ticker: String,
    pub description: String,
    #[serde(rename = "type")]
    pub symbol_type: String,
    pub session: String,
    pub exchange: String,
    pub listed_exchange: String,
    pub timezone: String,
    pub minmov: u32,
    pub pricescale: u64,
    pub supported_resolutions: Vec<String>,
    pub has_intraday: bool,
    pub has_daily: bool,
    pub has_weekly_and_monthly: bool,
    pub currency_code: String,
    pub data_status: String,
}

/// Period parameters of a `getBars` request. `from` / `to` are epoch seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PeriodParams {
    pub from: i64,
    pub to: i64,
    #[serde(rename = "countBack")]
    pub count_back: u32,
    #[serde(rename = "firstDataRequest", default)]
    pub first_data_request: bool,
}

// =============================================================================
// Tests
// =============================================================================
