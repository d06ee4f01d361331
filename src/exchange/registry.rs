// =============================================================================
// Exchange registry — lazily built, cached exchange handles
// =============================================================================
//
// Factories are registered up front for the configured exchange ids; the
// client behind an id is only constructed on first resolve. Ids are matched
// case-insensitively. A factory that fails is logged and treated as an
// unsupported id; the failure is not cached, so the next resolve retries.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::feed_config::{FeedConfig, TransportConfig};

use super::resolution::ResolutionTable;
use super::{Capabilities, ExchangeClient, Market, SocketMarket};

pub type ExchangeFactory =
    Box<dyn Fn(&TransportConfig) -> Result<Arc<dyn ExchangeClient>> + Send + Sync>;

// -----------------------------------------------------------------------------
// ExchangeHandle
// -----------------------------------------------------------------------------

/// A constructed exchange client plus everything derived from it.
pub struct ExchangeHandle {
    client: Arc<dyn ExchangeClient>,
    resolutions: ResolutionTable,
    page_delay: Duration,
    markets: OnceCell<HashMap<String, Market>>,
}

impl ExchangeHandle {
    pub fn new(client: Arc<dyn ExchangeClient>, page_delay: Option<Duration>) -> Self {
        let resolutions = ResolutionTable::from_timeframes(&client.timeframes());
        let page_delay = page_delay.unwrap_or_else(|| client.rate_limit());
        Self {
            client,
            resolutions,
            page_delay,
            markets: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    /// "Name" or "Name (version)" when the client reports a version.
    pub fn description(&self) -> String {
        match self.client.version() {
            Some(v) => format!("{} ({})", self.client.name(), v),
            None => self.client.name().to_string(),
        }
    }

    pub fn client(&self) -> &dyn ExchangeClient {
        self.client.as_ref()
    }

    pub fn resolutions(&self) -> &ResolutionTable {
        &self.resolutions
    }

    /// Delay between consecutive historical pages.
    pub fn page_delay(&self) -> Duration {
        self.page_delay
    }

    pub fn capabilities(&self) -> Capabilities {
        self.client.capabilities()
    }

    pub fn socket_market(&self) -> Option<SocketMarket> {
        self.client.socket_market()
    }

    /// Market listing keyed by market id, loaded once per process.
    pub async fn markets(&self) -> Result<&HashMap<String, Market>> {
        self.markets
            .get_or_try_init(|| async {
                let list = self.client.load_markets().await?;
                info!(exchange = self.id(), markets = list.len(), "market listing loaded");
                Ok(list.into_iter().map(|m| (m.id.clone(), m)).collect())
            })
            .await
    }

    pub async fn market(&self, id: &str) -> Result<Option<Market>> {
        Ok(self.markets().await?.get(id).cloned())
    }
}

impl std::fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeHandle")
            .field("id", &self.id())
            .field("resolutions", &self.resolutions)
            .field("page_delay", &self.page_delay)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ExchangeRegistry
// -----------------------------------------------------------------------------

pub struct ExchangeRegistry {
    transport: TransportConfig,
    delay_overrides: HashMap<String, Duration>,
    /// Registration order, lower-case ids.
    order: Vec<String>,
    factories: HashMap<String, ExchangeFactory>,
    handles: RwLock<HashMap<String, Arc<ExchangeHandle>>>,
}

impl ExchangeRegistry {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            delay_overrides: HashMap::new(),
            order: Vec::new(),
            factories: HashMap::new(),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Registry carrying the transport settings and page-delay overrides of
    /// `config`. Factories still have to be registered by the caller.
    pub fn from_config(config: &FeedConfig) -> Self {
        let mut registry = Self::new(config.transport());
        for (id, ms) in &config.rate_limit_ms {
            registry
                .delay_overrides
                .insert(id.to_lowercase(), Duration::from_millis(*ms));
        }
        registry
    }

    pub fn register(&mut self, id: &str, factory: ExchangeFactory) {
        let id = id.to_lowercase();
        if self.factories.insert(id.clone(), factory).is_none() {
            self.order.push(id);
        }
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Handle for `id`, constructing the client on first use.
    pub fn resolve(&self, id: &str) -> Option<Arc<ExchangeHandle>> {
        let id = id.to_lowercase();

        if let Some(handle) = self.handles.read().get(&id) {
            return Some(handle.clone());
        }

        let factory = self.factories.get(&id)?;
        let client = match factory(&self.transport) {
            Ok(client) => client,
            Err(e) => {
                warn!(exchange = %id, error = %e, "exchange client construction failed");
                return None;
            }
        };
        let handle = Arc::new(ExchangeHandle::new(
            client,
            self.delay_overrides.get(&id).copied(),
        ));

        if handle.resolutions().is_empty() {
            warn!(exchange = %id, "exchange reports no chart resolutions");
        }
        let mut handles = self.handles.write();
        // Another caller may have raced us here; keep whichever landed first.
        let handle = handles.entry(id.clone()).or_insert(handle).clone();
        info!(
            exchange = %id,
            resolutions = handle.resolutions().len(),
            page_delay_ms = handle.page_delay().as_millis() as u64,
            "exchange client ready"
        );
        Some(handle)
    }

    /// Handle for the exchange whose events arrive on `market` streams.
    pub fn resolve_by_socket_id(&self, market: SocketMarket) -> Option<Arc<ExchangeHandle>> {
        self.resolve(market.exchange_id())
    }

    /// Every registered exchange that can be constructed, in order.
    pub fn resolve_all(&self) -> Vec<Arc<ExchangeHandle>> {
        self.order.iter().filter_map(|id| self.resolve(id)).collect()
    }
}
