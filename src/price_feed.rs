use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use crate::trade::execution::gateway::GatewayError;

/// No message within this window means the subscription is considered dead
/// and is torn down and rebuilt.
const FEED_LIVENESS_SECS: u64 = 30;
const RESUBSCRIBE_DELAY_SECS: u64 = 5;

/// Source of streamed mark prices. The transport behind it (websocket,
/// replay file, ...) lives outside the core; a subscription is just a
/// channel of prices that ends when the transport drops it.
#[async_trait]
pub trait MarkPriceStream: Send + Sync {
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Decimal>, GatewayError>;
}

/// Latest streamed mark price per symbol. Writers are the per-symbol feed
/// tasks, readers the reconciliation loop; reads never block on a stale
/// feed, they just see the last known value.
#[derive(Clone, Default)]
pub struct PriceCache {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, symbol: &str) -> Option<Decimal> {
        self.prices
            .read()
            .expect("price cache lock poisoned")
            .get(symbol)
            .copied()
    }

    pub fn update(&self, symbol: &str, price: Decimal) {
        self.prices
            .write()
            .expect("price cache lock poisoned")
            .insert(symbol.to_string(), price);
    }
}

/// Supervises one symbol's subscription forever: every disconnect, error or
/// liveness timeout is answered by a fresh subscribe, transparently to the
/// readers of the cache.
pub fn spawn_feed(
    cache: PriceCache,
    stream: Arc<dyn MarkPriceStream>,
    symbol: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut rx = match stream.subscribe(&symbol).await {
                Ok(rx) => rx,
                Err(err) => {
                    log::warn!("[FEED] {} subscribe failed: {}", symbol, err);
                    sleep(Duration::from_secs(RESUBSCRIBE_DELAY_SECS)).await;
                    continue;
                }
            };
            log::debug!("[FEED] {} subscribed", symbol);
            loop {
                match timeout(Duration::from_secs(FEED_LIVENESS_SECS), rx.recv()).await {
                    Ok(Some(price)) => cache.update(&symbol, price),
                    Ok(None) => {
                        log::warn!("[FEED] {} stream closed, resubscribing", symbol);
                        break;
                    }
                    Err(_) => {
                        log::warn!("[FEED] {} feed silent, resubscribing", symbol);
                        break;
                    }
                }
            }
        }
    })
}
