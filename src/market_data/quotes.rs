// =============================================================================
// Quote patching
// =============================================================================
//
// A composite quote is built from two independent partial sources. Each patch
// touches only its own fields; everything else already on the quote stays.

use crate::exchange::Ticker;
use crate::types::QuoteValues;

use super::events::{BookTickerEvent, TickerStatsEvent};

pub fn apply_ticker_stats(values: &mut QuoteValues, ev: &TickerStatsEvent) {
    values.change = Some(ev.price_change);
    values.change_percent = Some(ev.price_change_percent);
    values.last_price = Some(ev.last_price);
    values.open_price = Some(ev.open);
    values.high_price = Some(ev.high);
    values.low_price = Some(ev.low);
    if ev.prev_close.is_some() {
        values.prev_close_price = ev.prev_close;
    }
    values.volume = Some(ev.volume);
}

pub fn apply_book_ticker(values: &mut QuoteValues, ev: &BookTickerEvent) {
    values.ask = Some(ev.ask);
    values.bid = Some(ev.bid);
}

/// Quote values from a REST ticker snapshot.
pub fn from_ticker(ticker: &Ticker) -> QuoteValues {
    QuoteValues {
        change: ticker.change,
        change_percent: ticker.percentage,
        last_price: ticker.last,
        ask: ticker.ask,
        bid: ticker.bid,
        open_price: ticker.open,
        high_price: ticker.high,
        low_price: ticker.low,
        prev_close_price: ticker.previous_close,
        volume: ticker.base_volume,
        ..QuoteValues::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(last: f64) -> TickerStatsEvent {
        TickerStatsEvent {
            symbol: "BTCUSDT".into(),
            price_change: 10.0,
            price_change_percent: 0.5,
            last_price: last,
            open: 36990.0,
            high: 37500.0,
            low: 36500.0,
            prev_close: None,
            volume: 1234.0,
        }
    }

    #[test]
    fn ticker_then_book_then_ticker() {
        let mut v = QuoteValues::default();

        apply_ticker_stats(&mut v, &stats(37000.0));
        apply_book_ticker(
            &mut v,
            &BookTickerEvent { symbol: "BTCUSDT".into(), bid: 36999.5, ask: 37000.5 },
        );
        assert_eq!(v.last_price, Some(37000.0));
        assert_eq!(v.bid, Some(36999.5));
        assert_eq!(v.ask, Some(37000.5));

        apply_ticker_stats(&mut v, &stats(37010.0));
        assert_eq!(v.last_price, Some(37010.0));
        assert_eq!(v.bid, Some(36999.5));
        assert_eq!(v.ask, Some(37000.5));
    }

    #[test]
    fn missing_prev_close_keeps_earlier_value() {
        let mut v = QuoteValues { prev_close_price: Some(36900.0), ..QuoteValues::default() };
        apply_ticker_stats(&mut v, &stats(37000.0));
        assert_eq!(v.prev_close_price, Some(36900.0));
    }

    #[test]
    fn snapshot_maps_ticker_fields() {
        let ticker = Ticker {
            symbol: "BTCUSDT".into(),
            last: Some(37000.0),
            base_volume: Some(99.0),
            bid: Some(36999.0),
            ..Ticker::default()
        };
        let v = from_ticker(&ticker);
        assert_eq!(v.last_price, Some(37000.0));
        assert_eq!(v.volume, Some(99.0));
        assert_eq!(v.bid, Some(36999.0));
        assert_eq!(v.ask, None);
    }
}
