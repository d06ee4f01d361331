pub mod depth;
pub mod events;
pub mod history;
pub mod kline_aggregator;
pub mod quotes;

pub use events::{BookTickerEvent, DepthDeltaEvent, KlineEvent, PushEvent, TickerStatsEvent};
pub use history::{fetch_bars, FetchOptions, HistoryRequest};
pub use kline_aggregator::fold_kline;
