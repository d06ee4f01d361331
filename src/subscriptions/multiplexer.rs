// =============================================================================
// Subscription Multiplexer — many logical subscribers, few physical streams
// =============================================================================
//
// Bars and quotes are reference-counted by handler list: the first handler on
// a channel opens the physical connection(s), later handlers only append, and
// the connection is closed (and the channel's cached state evicted) once the
// last handler is removed. Depth is not multiplexed: every subscription owns
// its own connection and is torn down by its generated id.
//
// All state lives behind one mutex. Callbacks are collected while the lock is
// held and invoked after it is released, in registration order, so a callback
// may safely call back into the multiplexer.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::exchange::SocketMarket;
use crate::market_data::depth::to_depth_update;
use crate::market_data::quotes::{apply_book_ticker, apply_ticker_stats};
use crate::market_data::{
    fold_kline, BookTickerEvent, DepthDeltaEvent, KlineEvent, TickerStatsEvent,
};
use crate::types::{Bar, ChannelKey, DepthUpdate, Quote};

use super::transport::{ConnectionId, StreamKind, StreamTransport};

pub type BarCallback = Arc<dyn Fn(&Bar) + Send + Sync>;
pub type ResetCallback = Arc<dyn Fn() + Send + Sync>;
pub type QuotesCallback = Arc<dyn Fn(&[Quote]) + Send + Sync>;
pub type DepthCallback = Arc<dyn Fn(&DepthUpdate) + Send + Sync>;

#[derive(Clone)]
pub struct BarHandler {
    pub subscriber_id: String,
    pub on_bar: BarCallback,
    pub on_reset_cache: ResetCallback,
}

#[derive(Clone)]
pub struct QuoteHandler {
    pub listener_id: String,
    pub on_quotes: QuotesCallback,
}

// ---------------------------------------------------------------------------
// Subscription records
// ---------------------------------------------------------------------------

struct BarSubscription {
    interval_ms: i64,
    connection: ConnectionId,
    last_bar: Option<Bar>,
    handlers: Vec<BarHandler>,
}

struct QuoteSubscription {
    /// Display name the composite quote is published under.
    name: String,
    ticker_connection: ConnectionId,
    book_connection: ConnectionId,
    handlers: Vec<QuoteHandler>,
}

struct DepthSubscription {
    channel: ChannelKey,
    connection: ConnectionId,
    callback: DepthCallback,
}

#[derive(Default)]
struct MuxState {
    bars: HashMap<ChannelKey, BarSubscription>,
    /// Last bar per bar channel from historical loads, kept even while the
    /// channel has no live subscription.
    seeds: HashMap<ChannelKey, Bar>,
    /// Bumped on every bar-channel teardown.
    epochs: HashMap<ChannelKey, u64>,
    bar_connections: HashMap<ConnectionId, ChannelKey>,

    quotes: HashMap<ChannelKey, QuoteSubscription>,
    last_quotes: HashMap<ChannelKey, Quote>,

    depth: HashMap<String, DepthSubscription>,
}

pub struct SubscriptionMultiplexer {
    transport: Arc<dyn StreamTransport>,
    state: Mutex<MuxState>,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(MuxState::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Bars
    // -----------------------------------------------------------------------

    /// Attach `handler` to the bar channel, opening the kline stream if this
    /// is the channel's first handler. `key.resolution` is the native
    /// timeframe.
    pub fn subscribe_bars(
        &self,
        key: ChannelKey,
        market: SocketMarket,
        interval_ms: i64,
        handler: BarHandler,
    ) {
        let mut state = self.state.lock();

        if let Some(sub) = state.bars.get_mut(&key) {
            debug!(channel = %key, subscriber = %handler.subscriber_id, "bar handler attached");
            sub.handlers.push(handler);
            return;
        }

        let connection = self.transport.open(
            market,
            StreamKind::Kline {
                symbol: key.symbol.clone(),
                interval: key.resolution.clone().unwrap_or_default(),
            },
        );
        let last_bar = state.seeds.get(&key).copied();
        info!(
            channel = %key,
            connection = %connection,
            seeded = last_bar.is_some(),
            "bar channel opened"
        );

        state.bar_connections.insert(connection, key.clone());
        state.bars.insert(
            key,
            BarSubscription {
                interval_ms,
                connection,
                last_bar,
                handlers: vec![handler],
            },
        );
    }

    /// Remove every handler registered under `subscriber_id`. Unknown ids are
    /// a no-op.
    pub fn unsubscribe_bars(&self, subscriber_id: &str) {
        let mut to_close = Vec::new();
        {
            let mut state = self.state.lock();
            let mut emptied = Vec::new();

            for (key, sub) in state.bars.iter_mut() {
                while let Some(pos) = sub
                    .handlers
                    .iter()
                    .position(|h| h.subscriber_id == subscriber_id)
                {
                    sub.handlers.remove(pos);
                }
                if sub.handlers.is_empty() {
                    emptied.push(key.clone());
                }
            }

            for key in emptied {
                if let Some(sub) = state.bars.remove(&key) {
                    state.bar_connections.remove(&sub.connection);
                    to_close.push(sub.connection);
                }
                state.seeds.remove(&key);
                *state.epochs.entry(key.clone()).or_insert(0) += 1;
                info!(channel = %key, "bar channel closed");
            }
        }

        if to_close.is_empty() {
            debug!(subscriber = %subscriber_id, "bar unsubscribe closed no channel");
        }
        for connection in to_close {
            self.transport.close(connection);
        }
    }

    /// Current teardown epoch of a bar channel. Capture it before a
    /// historical fetch and hand it back to `seed_last_bar`.
    pub fn bar_epoch(&self, key: &ChannelKey) -> u64 {
        self.state.lock().epochs.get(key).copied().unwrap_or(0)
    }

    /// Cache `bar` as the channel's live-aggregation seed. Dropped when the
    /// channel was torn down since `epoch` was read; a live bar at or past the
    /// seed's time is kept over the seed.
    pub fn seed_last_bar(&self, key: &ChannelKey, bar: Bar, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epochs.get(key).copied().unwrap_or(0) != epoch {
            debug!(channel = %key, "stale history seed dropped");
            return false;
        }

        state.seeds.insert(key.clone(), bar);
        if let Some(sub) = state.bars.get_mut(key) {
            match sub.last_bar {
                Some(live) if live.time >= bar.time => {}
                _ => sub.last_bar = Some(bar),
            }
        }
        true
    }

    #[cfg(test)]
    pub fn last_bar(&self, key: &ChannelKey) -> Option<Bar> {
        let state = self.state.lock();
        match state.bars.get(key) {
            Some(sub) => sub.last_bar,
            None => state.seeds.get(key).copied(),
        }
    }

    /// Fold a kline update into its channel and fan the bar out. Events for
    /// channels without subscribers are dropped.
    pub fn on_kline(&self, exchange_id: &str, ev: &KlineEvent) -> Option<Bar> {
        let key = ChannelKey::bars(exchange_id, &ev.symbol, &ev.interval);

        let (bar, callbacks) = {
            let mut state = self.state.lock();
            let Some(sub) = state.bars.get_mut(&key) else {
                debug!(channel = %key, "kline for inactive channel dropped");
                return None;
            };
            let bar = fold_kline(sub.last_bar.as_ref(), ev, sub.interval_ms);
            sub.last_bar = Some(bar);
            let callbacks: Vec<BarCallback> =
                sub.handlers.iter().map(|h| h.on_bar.clone()).collect();
            (bar, callbacks)
        };

        for callback in callbacks {
            callback(&bar);
        }
        Some(bar)
    }

    /// A physical connection came back after a drop. Bar handlers on it are
    /// told to reset their cache since updates may have been missed.
    pub fn on_reconnected(&self, connection: ConnectionId) {
        let callbacks: Vec<ResetCallback> = {
            let state = self.state.lock();
            let Some(key) = state.bar_connections.get(&connection) else {
                return;
            };
            info!(channel = %key, connection = %connection, "bar channel reconnected, resetting handlers");
            state
                .bars
                .get(key)
                .map(|sub| sub.handlers.iter().map(|h| h.on_reset_cache.clone()).collect())
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback();
        }
    }

    // -----------------------------------------------------------------------
    // Quotes
    // -----------------------------------------------------------------------

    /// Attach `handler` to the quote channel, opening the ticker and
    /// book-ticker streams if this is the first handler.
    pub fn subscribe_quotes(
        &self,
        key: ChannelKey,
        name: &str,
        market: SocketMarket,
        handler: QuoteHandler,
    ) {
        let mut state = self.state.lock();

        if let Some(sub) = state.quotes.get_mut(&key) {
            sub.handlers.push(handler);
            return;
        }

        let symbol = key.symbol.clone();
        let ticker_connection = self
            .transport
            .open(market, StreamKind::Ticker24h { symbol: symbol.clone() });
        let book_connection = self.transport.open(market, StreamKind::BookTicker { symbol });
        info!(channel = %key, "quote channel opened");

        state.quotes.insert(
            key,
            QuoteSubscription {
                name: name.to_uppercase(),
                ticker_connection,
                book_connection,
                handlers: vec![handler],
            },
        );
    }

    pub fn unsubscribe_quotes(&self, listener_id: &str) {
        let mut to_close = Vec::new();
        {
            let mut state = self.state.lock();
            let mut emptied = Vec::new();

            for (key, sub) in state.quotes.iter_mut() {
                while let Some(pos) = sub.handlers.iter().position(|h| h.listener_id == listener_id) {
                    sub.handlers.remove(pos);
                }
                if sub.handlers.is_empty() {
                    emptied.push(key.clone());
                }
            }

            for key in emptied {
                if let Some(sub) = state.quotes.remove(&key) {
                    to_close.push(sub.ticker_connection);
                    to_close.push(sub.book_connection);
                }
                state.last_quotes.remove(&key);
                info!(channel = %key, "quote channel closed");
            }
        }

        for connection in to_close {
            self.transport.close(connection);
        }
    }

    /// Store a REST snapshot as the channel's last-known quote.
    pub fn store_quote(&self, key: ChannelKey, quote: Quote) {
        self.state.lock().last_quotes.insert(key, quote);
    }

    #[cfg(test)]
    pub fn last_quote(&self, key: &ChannelKey) -> Option<Quote> {
        self.state.lock().last_quotes.get(key).cloned()
    }

    pub fn on_ticker_stats(&self, exchange_id: &str, ev: &TickerStatsEvent) -> Option<Quote> {
        self.patch_quote(exchange_id, &ev.symbol, |q| apply_ticker_stats(&mut q.values, ev))
    }

    pub fn on_book_ticker(&self, exchange_id: &str, ev: &BookTickerEvent) -> Option<Quote> {
        self.patch_quote(exchange_id, &ev.symbol, |q| apply_book_ticker(&mut q.values, ev))
    }

    fn patch_quote(
        &self,
        exchange_id: &str,
        symbol: &str,
        patch: impl FnOnce(&mut Quote),
    ) -> Option<Quote> {
        let key = ChannelKey::quotes(exchange_id, symbol);

        let (quote, callbacks) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(sub) = state.quotes.get(&key) else {
                return None;
            };
            let quote = state
                .last_quotes
                .entry(key)
                .or_insert_with(|| Quote::ok(sub.name.clone()));
            patch(quote);
            let callbacks: Vec<QuotesCallback> =
                sub.handlers.iter().map(|h| h.on_quotes.clone()).collect();
            (quote.clone(), callbacks)
        };

        let batch = [quote];
        for callback in callbacks {
            callback(&batch);
        }
        let [quote] = batch;
        Some(quote)
    }

    // -----------------------------------------------------------------------
    // Depth
    // -----------------------------------------------------------------------

    /// Open a dedicated diff-depth stream and return its subscription id.
    pub fn subscribe_depth(
        &self,
        key: ChannelKey,
        market: SocketMarket,
        speed_ms: u32,
        callback: DepthCallback,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let connection = self.transport.open(
            market,
            StreamKind::DiffDepth {
                symbol: key.symbol.clone(),
                speed_ms,
            },
        );
        info!(channel = %key, subscription = %id, "depth subscription opened");

        self.state.lock().depth.insert(
            id.clone(),
            DepthSubscription {
                channel: key,
                connection,
                callback,
            },
        );
        id
    }

    /// Returns false for unknown ids.
    pub fn unsubscribe_depth(&self, subscription_id: &str) -> bool {
        let removed = self.state.lock().depth.remove(subscription_id);
        match removed {
            Some(sub) => {
                self.transport.close(sub.connection);
                info!(channel = %sub.channel, subscription = %subscription_id, "depth subscription closed");
                true
            }
            None => false,
        }
    }

    /// Relay a depth delta to the subscriptions on its channel whose own
    /// connection produced it.
    pub fn on_depth(&self, exchange_id: &str, connection: ConnectionId, ev: &DepthDeltaEvent) -> usize {
        let key = ChannelKey::depth(exchange_id, &ev.symbol);
        let callbacks: Vec<DepthCallback> = {
            let state = self.state.lock();
            state
                .depth
                .values()
                .filter(|sub| sub.channel == key && sub.connection == connection)
                .map(|sub| sub.callback.clone())
                .collect()
        };
        if callbacks.is_empty() {
            return 0;
        }

        let update = to_depth_update(ev);
        for callback in &callbacks {
            callback(&update);
        }
        callbacks.len()
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> MuxStats {
        let state = self.state.lock();
        MuxStats {
            bar_channels: state.bars.len(),
            bar_handlers: state.bars.values().map(|s| s.handlers.len()).sum(),
            quote_channels: state.quotes.len(),
            quote_handlers: state.quotes.values().map(|s| s.handlers.len()).sum(),
            depth_subscriptions: state.depth.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MuxStats {
    pub bar_channels: usize,
    pub bar_handlers: usize,
    pub quote_channels: usize,
    pub quote_handlers: usize,
    pub depth_subscriptions: usize,
}
