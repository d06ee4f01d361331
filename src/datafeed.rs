// =============================================================================
// Datafeed — the consumer-facing contract of the chart bridge
// =============================================================================
//
// Owns the subscription multiplexer and borrows exchange handles from the
// registry. Every operation the charting front end calls lands here; the API
// layer only translates HTTP/WebSocket traffic into these calls.
//
// Inbound stream events are demultiplexed by `handle_event`, normally driven
// by `run_event_loop` on its own task.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::FeedError;
use crate::exchange::{interval_ms, union_resolutions, ExchangeHandle, ExchangeRegistry, Market};
use crate::feed_config::FeedConfig;
use crate::market_data::quotes::from_ticker;
use crate::market_data::{fetch_bars, FetchOptions, HistoryRequest, PushEvent};
use crate::subscriptions::{
    BarCallback, BarHandler, DepthCallback, InboundEvent, InboundPayload, MuxStats,
    QuoteHandler, QuotesCallback, ResetCallback, StreamTransport, SubscriptionMultiplexer,
};
use crate::types::{
    BarsResult, ChannelKey, DatafeedConfiguration, ExchangeDescriptor, PeriodParams, Quote,
    SearchResult, SymbolInfo, SymbolName, SymbolType,
};

const SYMBOL_TYPE: &str = "crypto";

pub struct Datafeed {
    registry: Arc<ExchangeRegistry>,
    mux: SubscriptionMultiplexer,
    page_cap: u32,
    depth_speed_ms: u32,
}

impl Datafeed {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        transport: Arc<dyn StreamTransport>,
        config: &FeedConfig,
    ) -> Self {
        Self {
            registry,
            mux: SubscriptionMultiplexer::new(transport),
            page_cap: config.page_cap,
            depth_speed_ms: config.depth_update_speed_ms,
        }
    }

    pub fn stats(&self) -> MuxStats {
        self.mux.stats()
    }

    fn exchange(&self, id: &str) -> Result<Arc<ExchangeHandle>, FeedError> {
        self.registry
            .resolve(id)
            .ok_or_else(|| FeedError::UnsupportedExchange(id.to_string()))
    }

    // -------------------------------------------------------------------------
    // Configuration & symbols
    // -------------------------------------------------------------------------

    pub fn get_configuration(&self) -> DatafeedConfiguration {
        let handles = self.registry.resolve_all();
        DatafeedConfiguration {
            exchanges: handles
                .iter()
                .map(|h| ExchangeDescriptor {
                    value: h.id().to_uppercase(),
                    name: h.name().to_string(),
                    desc: h.description(),
                })
                .collect(),
            symbols_types: vec![SymbolType {
                name: "Cryptocurrency".to_string(),
                value: SYMBOL_TYPE.to_string(),
            }],
            supported_resolutions: union_resolutions(handles.iter().map(|h| h.resolutions())),
            supports_time: true,
            supports_search: true,
            supports_marks: false,
            supports_timescale_marks: false,
            supports_group_request: false,
        }
    }

    /// Case-insensitive substring search over market ids. An empty `exchange`
    /// searches every enabled exchange.
    pub async fn search_symbols(
        &self,
        query: &str,
        exchange: &str,
        symbol_type: &str,
    ) -> Vec<SearchResult> {
        if !symbol_type.is_empty() && !symbol_type.eq_ignore_ascii_case(SYMBOL_TYPE) {
            return Vec::new();
        }

        let handles = if exchange.is_empty() {
            self.registry.resolve_all()
        } else {
            self.registry.resolve(exchange).into_iter().collect()
        };
        let needle = query.to_uppercase();

        let mut results = Vec::new();
        for handle in handles {
            let markets = match handle.markets().await {
                Ok(markets) => markets,
                Err(e) => {
                    warn!(exchange = handle.id(), error = %e, "market listing unavailable for search");
                    continue;
                }
            };
            let exchange_upper = handle.id().to_uppercase();
            let mut hits: Vec<&Market> = markets
                .values()
                .filter(|m| m.id.to_uppercase().contains(&needle))
                .collect();
            hits.sort_by(|a, b| a.id.cmp(&b.id));

            results.extend(hits.into_iter().map(|m| SearchResult {
                symbol: m.id.clone(),
                full_name: m.id.clone(),
                description: format!("{} / {}", m.base, m.quote),
                ticker: format!("{}:{}", exchange_upper, m.id),
                exchange: exchange_upper.clone(),
                symbol_type: SYMBOL_TYPE.to_string(),
            }));
        }
        results
    }

    pub async fn resolve_symbol(&self, ticker: &str) -> Result<SymbolInfo, FeedError> {
        let parsed = SymbolName::parse(ticker);
        let handle = self.exchange(&parsed.exchange)?;
        let market = handle
            .market(&parsed.symbol)
            .await?
            .ok_or_else(|| FeedError::UnresolvableSymbol(ticker.to_string()))?;

        let exchange_upper = handle.id().to_uppercase();
        Ok(SymbolInfo {
            name: market.id.clone(),
            ticker: parsed.ticker(),
            description: format!("{} / {}", market.base, market.quote),
            symbol_type: SYMBOL_TYPE.to_string(),
            session: "24x7".to_string(),
            exchange: exchange_upper,
            listed_exchange: handle.name().to_string(),
            timezone: "UTC".to_string(),
            minmov: 1,
            pricescale: 10u64.saturating_pow(market.price_decimals),
            supported_resolutions: handle.resolutions().resolutions(),
            has_intraday: true,
            has_daily: true,
            has_weekly_and_monthly: true,
            currency_code: market.quote.clone(),
            data_status: "streaming".to_string(),
        })
    }

    pub fn get_server_time(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    // -------------------------------------------------------------------------
    // Bars
    // -------------------------------------------------------------------------

    /// Historical bars for `[from, to]`, at most `count_back` of them. On the
    /// first request of a chart the last bar becomes the live seed.
    #[instrument(skip(self, symbol_info), fields(symbol = %symbol_info.name))]
    pub async fn get_bars(
        &self,
        symbol_info: &SymbolInfo,
        resolution: &str,
        params: PeriodParams,
    ) -> Result<BarsResult, FeedError> {
        let handle = self.exchange(&symbol_info.exchange)?;
        let timeframe = handle
            .resolutions()
            .native(resolution)
            .ok_or_else(|| FeedError::UnsupportedResolution(resolution.to_string()))?;
        let key = ChannelKey::bars(handle.id(), &symbol_info.name, timeframe);
        let epoch = self.mux.bar_epoch(&key);

        let bars = fetch_bars(
            &handle,
            HistoryRequest {
                symbol: &symbol_info.name,
                resolution,
                from_ms: params.from * 1000,
                to_ms: params.to * 1000,
                count_back: params.count_back,
            },
            FetchOptions::for_exchange(&handle, self.page_cap),
        )
        .await?;

        if params.first_data_request {
            if let Some(last) = bars.last() {
                self.mux.seed_last_bar(&key, *last, epoch);
            }
        }

        Ok(BarsResult {
            no_data: bars.is_empty(),
            bars,
        })
    }

    pub fn subscribe_bars(
        &self,
        symbol_info: &SymbolInfo,
        resolution: &str,
        subscriber_id: &str,
        on_bar: BarCallback,
        on_reset_cache: ResetCallback,
    ) -> Result<(), FeedError> {
        let handle = self.exchange(&symbol_info.exchange)?;
        let market = handle
            .socket_market()
            .ok_or_else(|| FeedError::UnsupportedExchange(symbol_info.exchange.clone()))?;
        let timeframe = handle
            .resolutions()
            .native(resolution)
            .ok_or_else(|| FeedError::UnsupportedResolution(resolution.to_string()))?;
        let interval = interval_ms(timeframe)
            .ok_or_else(|| FeedError::UnsupportedResolution(resolution.to_string()))?;

        self.mux.subscribe_bars(
            ChannelKey::bars(handle.id(), &symbol_info.name, timeframe),
            market,
            interval,
            BarHandler {
                subscriber_id: subscriber_id.to_string(),
                on_bar,
                on_reset_cache,
            },
        );
        Ok(())
    }

    pub fn unsubscribe_bars(&self, subscriber_id: &str) {
        self.mux.unsubscribe_bars(subscriber_id);
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// REST snapshot for every requested symbol. Unknown exchanges and
    /// symbols are skipped; a failed fetch yields an error-status quote.
    pub async fn get_quotes(&self, symbols: &[String]) -> Vec<Quote> {
        let mut quotes = Vec::with_capacity(symbols.len());

        for item in symbols {
            let parsed = SymbolName::parse(item);
            let Some(handle) = self.registry.resolve(&parsed.exchange) else {
                debug!(symbol = %item, "quote requested for unknown exchange");
                continue;
            };

            let market = match handle.market(&parsed.symbol).await {
                Ok(Some(market)) => market,
                Ok(None) => continue,
                Err(e) => {
                    warn!(symbol = %item, error = %e, "market listing unavailable for quote");
                    quotes.push(Quote::error(item.as_str()));
                    continue;
                }
            };

            match self.snapshot_quote(&handle, &parsed, &market, item).await {
                Ok(quote) => {
                    self.mux
                        .store_quote(ChannelKey::quotes(handle.id(), &parsed.symbol), quote.clone());
                    quotes.push(quote);
                }
                Err(e) => {
                    warn!(symbol = %item, error = %e, "quote snapshot failed");
                    quotes.push(Quote::error(item.as_str()));
                }
            }
        }
        quotes
    }

    async fn snapshot_quote(
        &self,
        handle: &ExchangeHandle,
        parsed: &SymbolName,
        market: &Market,
        original_name: &str,
    ) -> Result<Quote> {
        let client = handle.client();
        let mut ticker = client.fetch_ticker(&parsed.symbol).await?;
        debug!(exchange = handle.id(), symbol = %ticker.symbol, "ticker snapshot fetched");

        if (ticker.bid.is_none() || ticker.ask.is_none()) && handle.capabilities().fetch_bids_asks {
            let book = client.fetch_bids_asks(&parsed.symbol).await?;
            ticker.bid = book.bid;
            ticker.ask = book.ask;
        }

        let mut quote = Quote::ok(original_name);
        quote.values = from_ticker(&ticker);
        quote.values.short_name = Some(parsed.symbol.clone());
        quote.values.exchange = Some(handle.id().to_uppercase());
        quote.values.original_name = Some(original_name.to_string());
        quote.values.description = Some(format!("{} / {}", market.base, market.quote));
        Ok(quote)
    }

    /// Live quote streams are opened for `fast_symbols` only.
    pub fn subscribe_quotes(
        &self,
        symbols: &[String],
        fast_symbols: &[String],
        listener_id: &str,
        on_quotes: QuotesCallback,
    ) {
        debug!(
            listener = %listener_id,
            symbols = symbols.len(),
            fast_symbols = fast_symbols.len(),
            "quote subscription"
        );

        for item in fast_symbols {
            let parsed = SymbolName::parse(item);
            let Some(handle) = self.registry.resolve(&parsed.exchange) else {
                continue;
            };
            let Some(market) = handle.socket_market() else {
                continue;
            };
            self.mux.subscribe_quotes(
                ChannelKey::quotes(handle.id(), &parsed.symbol),
                &parsed.name,
                market,
                QuoteHandler {
                    listener_id: listener_id.to_string(),
                    on_quotes: on_quotes.clone(),
                },
            );
        }
    }

    pub fn unsubscribe_quotes(&self, listener_id: &str) {
        self.mux.unsubscribe_quotes(listener_id);
    }

    // -------------------------------------------------------------------------
    // Depth
    // -------------------------------------------------------------------------

    pub fn subscribe_depth(&self, ticker: &str, on_depth: DepthCallback) -> Result<String, FeedError> {
        let parsed = SymbolName::parse(ticker);
        let handle = self.exchange(&parsed.exchange)?;
        let market = handle
            .socket_market()
            .ok_or_else(|| FeedError::UnsupportedExchange(parsed.exchange.clone()))?;

        Ok(self.mux.subscribe_depth(
            ChannelKey::depth(handle.id(), &parsed.symbol),
            market,
            self.depth_speed_ms,
            on_depth,
        ))
    }

    pub fn unsubscribe_depth(&self, subscription_id: &str) {
        if !self.mux.unsubscribe_depth(subscription_id) {
            debug!(subscription = %subscription_id, "unsubscribe for unknown depth id ignored");
        }
    }

    // -------------------------------------------------------------------------
    // Inbound events
    // -------------------------------------------------------------------------

    pub fn handle_event(&self, event: InboundEvent) {
        let Some(handle) = self.registry.resolve_by_socket_id(event.market) else {
            debug!(market = %event.market, "event for disabled exchange dropped");
            return;
        };
        let exchange = handle.id();

        match event.payload {
            InboundPayload::Reconnected => self.mux.on_reconnected(event.connection),
            InboundPayload::Push(PushEvent::Kline(ev)) => {
                self.mux.on_kline(exchange, &ev);
            }
            InboundPayload::Push(PushEvent::TickerStats(ev)) => {
                self.mux.on_ticker_stats(exchange, &ev);
            }
            InboundPayload::Push(PushEvent::BookTicker(ev)) => {
                self.mux.on_book_ticker(exchange, &ev);
            }
            InboundPayload::Push(PushEvent::DepthDelta(ev)) => {
                self.mux.on_depth(exchange, event.connection, &ev);
            }
        }
    }

    /// Drain the inbound channel until every sender is gone.
    pub async fn run_event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<InboundEvent>) {
        info!("datafeed event loop started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!("datafeed event loop stopped");
    }
}
