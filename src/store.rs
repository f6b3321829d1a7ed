//! Persistence contract for markets, the trade ledger, and derived positions.
//!
//! Positions are never stored; every implementation reconstructs them from
//! the append-only ledger at query time.

use crate::errors::EngineError;
use crate::lmsr::Side;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Settled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "open" => Ok(MarketStatus::Open),
            "settled" => Ok(MarketStatus::Settled),
            other => Err(StoreError::Internal(anyhow::anyhow!(
                "unknown market status '{other}'"
            ))),
        }
    }
}

/// Binary outcome market bound to one contract ticker and one spatial cell.
///
/// Money and quantity fields serialize as decimal strings; the two price
/// fields are probabilities and serialize as JSON numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: Uuid,
    pub contract_id: String,
    #[serde(rename = "h3_cell_id")]
    pub cell_id: String,
    pub q_yes: Decimal,
    pub q_no: Decimal,
    pub b: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_yes: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_no: Decimal,
    pub status: MarketStatus,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: String,
    pub market_id: Uuid,
    pub contract_id: String,
    pub side: Side,
    /// Positive buys, negative sells.
    pub quantity: Decimal,
    /// Average fill price for the trade.
    pub price: Decimal,
    /// Positive when the trader paid, negative when they received.
    pub cost: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Per-market position derived from the ledger, marked to current prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market_id: Uuid,
    pub contract_id: String,
    #[serde(rename = "h3_cell_id")]
    pub cell_id: String,
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    pub net_qty: Decimal,
    pub cost_basis: Decimal,
    pub current_value: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => EngineError::NotFound("market".to_string()),
            StoreError::Conflict(msg) => EngineError::Conflict(msg),
            StoreError::Cancelled => EngineError::Cancelled,
            StoreError::Internal(cause) => EngineError::Internal(cause),
        }
    }
}

/// Abstract persistence surface shared by the in-memory, durable, and cached
/// stores. Implementations must keep the ledger append-only.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Rejects a duplicate `contract_id` with `Conflict`.
    async fn create_market(&self, market: &Market) -> Result<(), StoreError>;

    async fn get_market(&self, id: Uuid) -> Result<Market, StoreError>;

    async fn get_market_by_contract(&self, contract_id: &str) -> Result<Market, StoreError>;

    async fn list_markets(&self, cell_filter: Option<&str>) -> Result<Vec<Market>, StoreError>;

    /// Updates only the four quantity/price fields.
    async fn update_market_state(
        &self,
        id: Uuid,
        q_yes: Decimal,
        q_no: Decimal,
        price_yes: Decimal,
        price_no: Decimal,
    ) -> Result<(), StoreError>;

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Entries for one market, oldest first.
    async fn ledger_for_market(&self, market_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Entries for one user, oldest first.
    async fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Ledger-derived positions marked to current market prices.
    async fn user_positions(&self, user_id: &str) -> Result<Vec<Position>, StoreError>;

    /// Net signed exposure per cell: YES quantity minus NO quantity.
    async fn user_cell_exposures(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, Decimal>, StoreError>;
}
