// =============================================================================
// Push events — classification of raw stream payloads
// =============================================================================
//
// Every text frame read from an exchange stream is classified exactly once,
// at the demultiplexing boundary, into the closed `PushEvent` set. Downstream
// code matches exhaustively and never inspects raw JSON again.
//
// Binance tags most payloads with an `"e"` event type. The spot
// `@bookTicker` stream is the exception: it carries no `"e"` and is
// recognised by its `u` / `s` / `b` / `a` field set.
// =============================================================================

use anyhow::{bail, Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Kline(KlineEvent),
    TickerStats(TickerStatsEvent),
    BookTicker(BookTickerEvent),
    DepthDelta(DepthDeltaEvent),
}

impl PushEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Kline(e) => &e.symbol,
            Self::TickerStats(e) => &e.symbol,
            Self::BookTicker(e) => &e.symbol,
            Self::DepthDelta(e) => &e.symbol,
        }
    }
}

/// One partial-interval kline update.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineEvent {
    pub symbol: String,
    /// Native timeframe, e.g. `1h`.
    pub interval: String,
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Rolling 24-hour statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerStatsEvent {
    pub symbol: String,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub last_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    /// Only the spot stream reports the previous close.
    pub prev_close: Option<f64>,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookTickerEvent {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
}

/// Incremental order-book delta: `(price, quantity)` pairs as sent.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDeltaEvent {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Classify one text frame. `Ok(None)` means a well-formed payload of a kind
/// the bridge does not consume (subscription acks, other event types).
pub fn classify(text: &str) -> Result<Option<PushEvent>> {
    let root: Value = serde_json::from_str(text).context("failed to parse stream JSON")?;

    // Combined-stream envelope: { "stream": "...", "data": { ... } }
    let data = if root.get("data").is_some() { &root["data"] } else { &root };

    let event = match data.get("e").and_then(Value::as_str) {
        Some("kline") => PushEvent::Kline(parse_kline(data)?),
        Some("24hrTicker") => PushEvent::TickerStats(parse_ticker_stats(data)?),
        Some("bookTicker") => PushEvent::BookTicker(parse_book_ticker(data)?),
        Some("depthUpdate") => PushEvent::DepthDelta(parse_depth_delta(data)?),
        Some(_) => return Ok(None),
        None if is_spot_book_ticker(data) => PushEvent::BookTicker(parse_book_ticker(data)?),
        None => return Ok(None),
    };
    Ok(Some(event))
}

fn is_spot_book_ticker(data: &Value) -> bool {
    ["u", "s", "b", "a"].iter().all(|k| data.get(k).is_some())
}

fn parse_kline(data: &Value) -> Result<KlineEvent> {
    let k = &data["k"];
    Ok(KlineEvent {
        symbol: data["s"].as_str().context("missing field s")?.to_string(),
        interval: k["i"].as_str().context("missing field k.i")?.to_string(),
        start_time: k["t"].as_i64().context("missing field k.t")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
    })
}

fn parse_ticker_stats(data: &Value) -> Result<TickerStatsEvent> {
    let prev_close = match data.get("x") {
        Some(v) => Some(parse_string_f64(v, "x")?),
        None => None,
    };
    Ok(TickerStatsEvent {
        symbol: data["s"].as_str().context("missing field s")?.to_string(),
        price_change: parse_string_f64(&data["p"], "p")?,
        price_change_percent: parse_string_f64(&data["P"], "P")?,
        last_price: parse_string_f64(&data["c"], "c")?,
        open: parse_string_f64(&data["o"], "o")?,
        high: parse_string_f64(&data["h"], "h")?,
        low: parse_string_f64(&data["l"], "l")?,
        prev_close,
        volume: parse_string_f64(&data["v"], "v")?,
    })
}

fn parse_book_ticker(data: &Value) -> Result<BookTickerEvent> {
    Ok(BookTickerEvent {
        symbol: data["s"].as_str().context("missing field s")?.to_string(),
        bid: parse_string_f64(&data["b"], "b")?,
        ask: parse_string_f64(&data["a"], "a")?,
    })
}

fn parse_depth_delta(data: &Value) -> Result<DepthDeltaEvent> {
    Ok(DepthDeltaEvent {
        symbol: data["s"].as_str().context("missing field s")?.to_string(),
        bids: parse_levels(&data["b"], "b")?,
        asks: parse_levels(&data["a"], "a")?,
    })
}

fn parse_levels(val: &Value, name: &str) -> Result<Vec<(f64, f64)>> {
    let levels = val
        .as_array()
        .with_context(|| format!("missing field {name}"))?;
    levels
        .iter()
        .map(|level| {
            let price = parse_string_f64(&level[0], name)?;
            let qty = parse_string_f64(&level[1], name)?;
            Ok((price, qty))
        })
        .collect()
}

/// Binance sends numeric values as JSON strings.
pub(crate) fn parse_string_f64(val: &Value, name: &str) -> Result<f64> {
    match val {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => bail!("field {name} has unexpected JSON type"),
    }
}
