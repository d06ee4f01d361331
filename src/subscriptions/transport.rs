// =============================================================================
// Stream transport — the physical-connection seam
// =============================================================================
//
// The multiplexer decides *when* a physical stream connection is needed; a
// `StreamTransport` decides *how* it is opened. Every open connection pushes
// its classified events into one shared inbound channel, tagged with the
// connection id and the socket family it belongs to.
// =============================================================================

use crate::exchange::SocketMarket;
use crate::market_data::PushEvent;

/// Opaque handle of one physical stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a physical connection streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Kline { symbol: String, interval: String },
    Ticker24h { symbol: String },
    BookTicker { symbol: String },
    DiffDepth { symbol: String, speed_ms: u32 },
}

impl StreamKind {
    /// Exchange stream name, e.g. `btcusdt@kline_1h`.
    pub fn stream_name(&self) -> String {
        match self {
            Self::Kline { symbol, interval } => {
                format!("{}@kline_{interval}", symbol.to_lowercase())
            }
            Self::Ticker24h { symbol } => format!("{}@ticker", symbol.to_lowercase()),
            Self::BookTicker { symbol } => format!("{}@bookTicker", symbol.to_lowercase()),
            Self::DiffDepth { symbol, speed_ms } => {
                format!("{}@depth@{speed_ms}ms", symbol.to_lowercase())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub connection: ConnectionId,
    pub market: SocketMarket,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Push(PushEvent),
    /// The connection dropped and has been re-established; anything pushed in
    /// between was missed.
    Reconnected,
}

pub trait StreamTransport: Send + Sync {
    /// Start a physical connection. Events flow until `close` is called.
    fn open(&self, market: SocketMarket, kind: StreamKind) -> ConnectionId;

    /// Stop a physical connection. Unknown ids are ignored.
    fn close(&self, id: ConnectionId);
}
