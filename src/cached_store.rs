//! Redis read-through cache wrapped around the durable store.
//!
//! The wrapped store stays authoritative: every cache failure is logged and
//! treated as a miss (reads) or ignored (invalidations), so a degraded cache
//! never fails a request.

use crate::store::{LedgerEntry, Market, MarketStore, Position, StoreError};
use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct CachedStore {
    primary: Arc<dyn MarketStore>,
    redis: ConnectionManager,
    ttl_secs: u64,
}

fn market_key(id: Uuid) -> String {
    format!("market:{id}")
}

fn contract_key(contract_id: &str) -> String {
    format!("contract:{contract_id}")
}

fn positions_key(user_id: &str) -> String {
    format!("positions:{user_id}")
}

impl CachedStore {
    pub async fn connect(
        primary: Arc<dyn MarketStore>,
        redis_url: &str,
        ttl: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            primary,
            redis,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        raw.and_then(|json| match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "cache entry undecodable, treating as miss");
                None
            }
        })
    }

    async fn cache_put<T: Serialize>(&self, key: &str, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache value unserializable, skipping populate");
                return;
            }
        };
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(json)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(key, error = %e, "cache populate failed");
        }
    }

    async fn cache_del(&self, key: &str) {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> =
            redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        if let Err(e) = result {
            tracing::warn!(key, error = %e, "cache invalidation failed");
        }
    }
}

#[async_trait]
impl MarketStore for CachedStore {
    async fn create_market(&self, market: &Market) -> Result<(), StoreError> {
        self.primary.create_market(market).await?;
        self.cache_put(&market_key(market.id), market).await;
        Ok(())
    }

    async fn get_market(&self, id: Uuid) -> Result<Market, StoreError> {
        let key = market_key(id);
        if let Some(market) = self.cache_get::<Market>(&key).await {
            return Ok(market);
        }
        let market = self.primary.get_market(id).await?;
        self.cache_put(&key, &market).await;
        Ok(market)
    }

    async fn get_market_by_contract(&self, contract_id: &str) -> Result<Market, StoreError> {
        if let Some(id) = self.cache_get::<Uuid>(&contract_key(contract_id)).await {
            return self.get_market(id).await;
        }
        let market = self.primary.get_market_by_contract(contract_id).await?;
        self.cache_put(&contract_key(contract_id), &market.id).await;
        self.cache_put(&market_key(market.id), &market).await;
        Ok(market)
    }

    async fn list_markets(&self, cell_filter: Option<&str>) -> Result<Vec<Market>, StoreError> {
        self.primary.list_markets(cell_filter).await
    }

    async fn update_market_state(
        &self,
        id: Uuid,
        q_yes: Decimal,
        q_no: Decimal,
        price_yes: Decimal,
        price_no: Decimal,
    ) -> Result<(), StoreError> {
        self.primary
            .update_market_state(id, q_yes, q_no, price_yes, price_no)
            .await?;
        self.cache_del(&market_key(id)).await;
        Ok(())
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.primary.insert_ledger_entry(entry).await?;
        self.cache_del(&positions_key(&entry.user_id)).await;
        Ok(())
    }

    async fn ledger_for_market(&self, market_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        self.primary.ledger_for_market(market_id).await
    }

    async fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        self.primary.ledger_for_user(user_id).await
    }

    async fn user_positions(&self, user_id: &str) -> Result<Vec<Position>, StoreError> {
        let key = positions_key(user_id);
        if let Some(positions) = self.cache_get::<Vec<Position>>(&key).await {
            return Ok(positions);
        }
        let positions = self.primary.user_positions(user_id).await?;
        self.cache_put(&key, &positions).await;
        Ok(positions)
    }

    async fn user_cell_exposures(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, Decimal>, StoreError> {
        self.primary.user_cell_exposures(user_id).await
    }
}
