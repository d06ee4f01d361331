// =============================================================================
// Kline aggregation — folding partial kline updates into the forming bar
// =============================================================================

use crate::types::Bar;

use super::events::KlineEvent;

/// Fold one kline update into the channel's last bar.
///
/// * No last bar: the event seeds a bar at its own start time.
/// * `start_time >= last.time + interval`: a boundary was crossed. The new bar
///   is snapped to `last.time + interval` even across gaps, seeded entirely
///   from the event.
/// * Otherwise the event merges into the forming bar: high/low widen, close
///   and volume are taken from the event, open and time stay.
///
/// Volume is replaced rather than summed; kline updates report the
/// cumulative volume of the interval so far.
pub fn fold_kline(last: Option<&Bar>, event: &KlineEvent, interval_ms: i64) -> Bar {
    let Some(last) = last else {
        return seed(event.start_time, event);
    };

    let next_bar_time = last.time + interval_ms;
    if event.start_time >= next_bar_time {
        return seed(next_bar_time, event);
    }

    Bar {
        time: last.time,
        open: last.open,
        high: last.high.max(event.high),
        low: last.low.min(event.low),
        close: event.close,
        volume: event.volume,
    }
}

fn seed(time: i64, event: &KlineEvent) -> Bar {
    Bar {
        time,
        open: event.open,
        high: event.high,
        low: event.low,
        close: event.close,
        volume: event.volume,
    }
}
