//! Read-through product cache over the ledger.
//!
//! The cache only ever holds values read back from the ledger. Nothing a
//! caller submits is written here; the new stage arrives through
//! [`ProductStore::refresh_stage`] once the ledger reports it. A read that
//! shows an older stage than one already observed is treated as lagging and
//! ignored, so the stage seen through the store never goes backwards.

use std::collections::HashMap;
use std::sync::Arc;

use agri_lifecycle::{check_custody, Product, Stage};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::contract;
use crate::errors::{Result, TrackerError};
use crate::gateway::LedgerGateway;

#[derive(Default)]
struct Cache {
    products: HashMap<u64, Product>,
    stages: HashMap<u64, Stage>,
}

pub struct ProductStore {
    gateway: Arc<dyn LedgerGateway>,
    cache: RwLock<Cache>,
}

impl ProductStore {
    pub fn new(gateway: Arc<dyn LedgerGateway>) -> Self {
        Self {
            gateway,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Number of products ever registered. Ids run from 1 to this value.
    pub async fn count(&self) -> Result<u64> {
        let value = self.gateway.read(contract::PRODUCT_COUNT, &[]).await?;
        contract::decode_u64(&value)
    }

    /// Every product, fetched from the ledger one id at a time as the stream
    /// is polled. Each call starts over from a fresh count.
    pub fn list(&self) -> impl Stream<Item = Result<Product>> + Send + '_ {
        stream::once(self.count())
            .map_ok(move |count| stream::iter(1..=count).then(move |id| self.fetch(id)))
            .try_flatten()
    }

    pub async fn list_all(&self) -> Result<Vec<Product>> {
        self.list().try_collect().await
    }

    /// Products whose name or description contains `needle`, ignoring case.
    pub async fn search(&self, needle: &str) -> Result<Vec<Product>> {
        let needle = needle.trim();
        self.list()
            .try_filter(|product| std::future::ready(product.matches(needle)))
            .try_collect()
            .await
    }

    pub async fn get(&self, id: u64) -> Result<Product> {
        if let Some(product) = self.cache.read().await.products.get(&id) {
            return Ok(product.clone());
        }
        self.fetch(id).await
    }

    /// Read the full product from the ledger, bypassing the cache.
    pub async fn fetch(&self, id: u64) -> Result<Product> {
        let value = self.gateway.read(contract::PRODUCT, &[json!(id)]).await?;
        let product = contract::decode_product(&value)?
            .ok_or_else(|| TrackerError::NotFound(format!("product {id}")))?;
        if let Err(violation) = check_custody(&product) {
            warn!("Product {id}: {violation}");
        }
        Ok(self.merge(product).await)
    }

    /// Re-read only the stage of one product.
    pub async fn refresh_stage(&self, id: u64) -> Result<Stage> {
        let value = match self.gateway.read(contract::SHOW_STAGE, &[json!(id)]).await {
            Ok(value) => value,
            Err(TrackerError::Rejected(_)) => {
                return Err(TrackerError::NotFound(format!("product {id}")));
            }
            Err(e) => return Err(e),
        };
        let observed = contract::decode_stage(&value)?;

        let mut cache = self.cache.write().await;
        let known = cache.stages.get(&id).copied();
        match known {
            Some(known) if observed < known => {
                warn!("Product {id}: ledger read shows {observed}, already saw {known}; keeping {known}");
                Ok(known)
            }
            _ => {
                cache.stages.insert(id, observed);
                // Custodians may have changed along with the stage.
                if cache
                    .products
                    .get(&id)
                    .is_some_and(|p| p.stage != observed)
                {
                    cache.products.remove(&id);
                }
                debug!("Product {id} stage refreshed: {observed}");
                Ok(observed)
            }
        }
    }

    /// Last stage observed for `id`, without contacting the ledger.
    pub async fn cached_stage(&self, id: u64) -> Option<Stage> {
        self.cache.read().await.stages.get(&id).copied()
    }

    /// Forget one product, stage included, so the next read goes to the
    /// ledger.
    pub async fn invalidate(&self, id: u64) {
        let mut cache = self.cache.write().await;
        cache.products.remove(&id);
        cache.stages.remove(&id);
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.products.clear();
        cache.stages.clear();
    }

    async fn merge(&self, product: Product) -> Product {
        let mut cache = self.cache.write().await;
        let id = product.id;
        if let Some(known) = cache.stages.get(&id).copied() {
            if product.stage < known {
                warn!(
                    "Product {id}: ledger read shows {}, already saw {known}; keeping cached value",
                    product.stage
                );
                if let Some(cached) = cache.products.get(&id) {
                    return cached.clone();
                }
                return Product {
                    stage: known,
                    ..product
                };
            }
        }
        cache.stages.insert(id, product.stage);
        cache.products.insert(id, product.clone());
        product
    }
}
