pub mod client;
pub mod rate_limit;
pub mod streams;

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::exchange::{ExchangeClient, ExchangeRegistry, SocketMarket};
use crate::feed_config::TransportConfig;

pub use client::BinanceClient;
pub use streams::BinanceStreams;

/// Register a client factory for every enabled Binance family. Unknown ids
/// are logged and skipped.
pub fn register(registry: &mut ExchangeRegistry, enabled: &[String]) {
    for id in enabled {
        let Some(market) = SocketMarket::from_exchange_id(&id.to_lowercase()) else {
            warn!(exchange = %id, "no client available for configured exchange");
            continue;
        };
        registry.register(
            id,
            Box::new(
                move |transport: &TransportConfig| -> Result<Arc<dyn ExchangeClient>> {
                    Ok(Arc::new(BinanceClient::new(market, transport)?))
                },
            ),
        );
    }
}
