//! Live-update fan-out hub.
//!
//! Trade execution publishes through a bounded queue drained by a dedicated
//! worker; a full queue drops the message. Subscribers are keyed by integer
//! id in a lookup table, so nothing here holds a back-pointer to a
//! connection.

use crate::lmsr::Side;
use crate::store::Market;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 256;
const SUBSCRIBER_BUFFER: usize = 32;

/// Message pushed to live subscribers after each executed trade.
/// Quantities and prices travel as decimal strings.
#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub market_id: Uuid,
    pub contract_id: String,
    #[serde(rename = "h3_cell_id")]
    pub cell_id: String,
    pub price_yes: Decimal,
    pub price_no: Decimal,
    pub side: Side,
    pub quantity: Decimal,
}

impl PriceUpdate {
    pub fn trade_executed(market: &Market, side: Side, quantity: Decimal) -> Self {
        Self {
            kind: "trade_executed",
            market_id: market.id,
            contract_id: market.contract_id.clone(),
            cell_id: market.cell_id.clone(),
            price_yes: market.price_yes,
            price_no: market.price_no,
            side,
            quantity,
        }
    }
}

pub struct PriceFeedHub {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    queue: mpsc::Sender<String>,
}

impl PriceFeedHub {
    pub fn new() -> Arc<Self> {
        Self::with_queue_capacity(QUEUE_CAPACITY)
    }

    fn with_queue_capacity(capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<String>(capacity);
        let hub = Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue: tx,
        });

        let worker = Arc::clone(&hub);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                worker.fan_out(&frame);
            }
        });

        hub
    }

    /// Register a live subscriber; the returned receiver yields serialized
    /// frames in submission order.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subs = self.subscribers.write();
            subs.insert(id, tx);
            subs.len()
        };
        metrics::gauge!("ws_subscribers", count as f64);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let count = {
            let mut subs = self.subscribers.write();
            subs.remove(&id);
            subs.len()
        };
        metrics::gauge!("ws_subscribers", count as f64);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Serialize once and enqueue without blocking. A full queue drops the
    /// message so trade execution is never gated on subscriber health.
    pub fn broadcast(&self, update: &PriceUpdate) {
        let frame = match serde_json::to_string(update) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize price update");
                return;
            }
        };
        match self.queue.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::increment_counter!("ws_messages_dropped_total");
                tracing::debug!("broadcast queue full, dropping price update");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn fan_out(&self, frame: &str) {
        let mut dead = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, tx) in subs.iter() {
                match tx.try_send(frame.to_string()) {
                    Ok(()) => {}
                    // Slow subscriber: skip this frame, keep the connection.
                    Err(TrySendError::Full(_)) => {
                        metrics::increment_counter!("ws_messages_dropped_total");
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
    }
}
