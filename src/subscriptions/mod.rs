pub mod multiplexer;
pub mod transport;

pub use multiplexer::{
    BarCallback, BarHandler, DepthCallback, MuxStats, QuoteHandler, QuotesCallback,
    ResetCallback, SubscriptionMultiplexer,
};
pub use transport::{ConnectionId, InboundEvent, InboundPayload, StreamKind, StreamTransport};
