// =============================================================================
// Historical bar fetcher — paginated REST backfill
// =============================================================================
//
// Pages forward from the `from` cursor. Each page asks for
// `min(page_cap, remaining)` candles; the loop continues only while a page
// comes back full and count-back remains, advancing the cursor to one
// millisecond past the last candle and sleeping the exchange's page delay in
// between. The first failing page aborts the whole fetch; there is no retry
// at this layer.
// =============================================================================

use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{debug, instrument};

use crate::error::FeedError;
use crate::exchange::{ExchangeHandle, OhlcvRequest};
use crate::types::Bar;

/// One `getBars` request against a single exchange.
#[derive(Debug, Clone, Copy)]
pub struct HistoryRequest<'a> {
    pub symbol: &'a str,
    /// Canonical resolution.
    pub resolution: &'a str,
    pub from_ms: i64,
    pub to_ms: i64,
    pub count_back: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub page_cap: u32,
    /// Pause between consecutive pages.
    pub delay: Duration,
}

impl FetchOptions {
    pub fn for_exchange(handle: &ExchangeHandle, page_cap: u32) -> Self {
        Self {
            page_cap: page_cap.max(1),
            delay: handle.page_delay(),
        }
    }
}

#[instrument(skip(handle, opts), fields(exchange = handle.id()))]
pub async fn fetch_bars(
    handle: &ExchangeHandle,
    request: HistoryRequest<'_>,
    opts: FetchOptions,
) -> Result<Vec<Bar>, FeedError> {
    let timeframe = handle
        .resolutions()
        .native(request.resolution)
        .ok_or_else(|| FeedError::UnsupportedResolution(request.resolution.to_string()))?;

    let caps = handle.capabilities();
    if !caps.fetch_ohlcv {
        return Err(FeedError::Fetch(anyhow!(
            "{} does not support historical candles",
            handle.id()
        )));
    }
    let end_time_ms = caps.ohlcv_end_time.then_some(request.to_ms);
    let page_cap = opts.page_cap.max(1);

    let mut bars: Vec<Bar> = Vec::new();
    let mut remaining = request.count_back;
    let mut cursor = request.from_ms;
    let mut pages = 0u32;

    while remaining > 0 {
        let limit = page_cap.min(remaining);
        let page = handle
            .client()
            .fetch_ohlcv(OhlcvRequest {
                symbol: request.symbol,
                timeframe,
                since_ms: cursor,
                limit,
                end_time_ms,
            })
            .await
            .with_context(|| format!("history page {} for {}", pages + 1, request.symbol))?;

        pages += 1;
        remaining -= limit;

        let full = page.len() == limit as usize;
        let last_time = page.last().map(|b| b.time);
        bars.extend(page);

        match last_time {
            Some(t) if full && remaining > 0 => {
                cursor = t + 1;
                if !opts.delay.is_zero() {
                    tokio::time::sleep(opts.delay).await;
                }
            }
            _ => break,
        }
    }

    debug!(
        symbol = %request.symbol,
        timeframe = %timeframe,
        pages,
        bars = bars.len(),
        "history fetched"
    );
    Ok(bars)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockExchange;
    use std::sync::Arc;

    const HOUR: i64 = 3_600_000;
    const FROM: i64 = 1_700_000_000_000 / HOUR * HOUR;

    fn opts() -> FetchOptions {
        FetchOptions { page_cap: 200, delay: Duration::ZERO }
    }

    fn request(count_back: u32, to_ms: i64) -> HistoryRequest<'static> {
        HistoryRequest {
            symbol: "BTCUSDT",
            resolution: "60",
            from_ms: FROM,
            to_ms,
            count_back,
        }
    }

    #[tokio::test]
    async fn paginates_450_as_200_200_50() {
        let mock = Arc::new(MockExchange::new("binance"));
        let handle = ExchangeHandle::new(mock.clone(), None);

        let bars = fetch_bars(&handle, request(450, FROM + 1000 * HOUR), opts())
            .await
            .unwrap();

        let reqs = mock.ohlcv_requests();
        let limits: Vec<u32> = reqs.iter().map(|r| r.limit).collect();
        assert_eq!(limits, vec![200, 200, 50]);
        assert_eq!(reqs[0].since_ms, FROM);
        assert_eq!(reqs[1].since_ms, FROM + 199 * HOUR + 1);
        assert_eq!(reqs[2].since_ms, FROM + 399 * HOUR + 1);
        assert!(reqs.iter().all(|r| r.timeframe == "1h"));

        assert_eq!(bars.len(), 450);
        assert!(bars.windows(2).all(|w| w[1].time - w[0].time == HOUR));
    }

    #[tokio::test]
    async fn short_page_stops_pagination() {
        let mock = Arc::new(MockExchange::new("binance"));
        let handle = ExchangeHandle::new(mock.clone(), None);

        // Only 250 candles exist before the end time.
        let bars = fetch_bars(&handle, request(450, FROM + 249 * HOUR), opts())
            .await
            .unwrap();

        assert_eq!(mock.ohlcv_requests().len(), 2);
        assert_eq!(bars.len(), 250);
    }

    #[tokio::test]
    async fn end_time_filter_follows_capability() {
        let mock = Arc::new(MockExchange::new("binance"));
        let handle = ExchangeHandle::new(mock.clone(), None);
        fetch_bars(&handle, request(10, FROM + 100 * HOUR), opts()).await.unwrap();
        assert_eq!(mock.ohlcv_requests()[0].end_time_ms, Some(FROM + 100 * HOUR));

        let plain = Arc::new(MockExchange::new("binance").without_end_time());
        let handle = ExchangeHandle::new(plain.clone(), None);
        fetch_bars(&handle, request(10, FROM + 100 * HOUR), opts()).await.unwrap();
        assert_eq!(plain.ohlcv_requests()[0].end_time_ms, None);
    }

    #[tokio::test]
    async fn zero_count_back_issues_no_request() {
        let mock = Arc::new(MockExchange::new("binance"));
        let handle = ExchangeHandle::new(mock.clone(), None);
        let bars = fetch_bars(&handle, request(0, FROM + HOUR), opts()).await.unwrap();
        assert!(bars.is_empty());
        assert!(mock.ohlcv_requests().is_empty());
    }

    #[tokio::test]
    async fn unsupported_resolution_is_rejected_before_fetching() {
        let mock = Arc::new(MockExchange::new("binance"));
        let handle = ExchangeHandle::new(mock.clone(), None);
        let req = HistoryRequest { resolution: "7", ..request(10, FROM) };
        let err = fetch_bars(&handle, req, opts()).await.unwrap_err();
        assert!(matches!(err, FeedError::UnsupportedResolution(ref r) if r == "7"));
        assert!(mock.ohlcv_requests().is_empty());
    }

    #[tokio::test]
    async fn page_failure_aborts_remaining_pages() {
        let mock = Arc::new(MockExchange::new("binance").failing_after_pages(1));
        let handle = ExchangeHandle::new(mock.clone(), None);
        let err = fetch_bars(&handle, request(450, FROM + 1000 * HOUR), opts())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch-error");
        assert_eq!(mock.ohlcv_requests().len(), 2);
    }

    #[tokio::test]
    async fn pages_are_spaced_by_the_delay() {
        let mock = Arc::new(MockExchange::new("binance"));
        let handle = ExchangeHandle::new(mock.clone(), None);
        let started = std::time::Instant::now();
        let opts = FetchOptions { page_cap: 200, delay: Duration::from_millis(50) };
        fetch_bars(&handle, request(450, FROM + 1000 * HOUR), opts).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
