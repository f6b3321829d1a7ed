//! Trade service: market lifecycle, the trade-execution pipeline, and
//! portfolio queries.
//!
//! A single writer mutex serializes the read-market → compute → write-state
//! → append-entry sequence; without it concurrent trades on one market would
//! break LMSR path independence.

use crate::errors::{EngineError, Result};
use crate::hub::{PriceFeedHub, PriceUpdate};
use crate::limiter::PositionLimiter;
use crate::liquidity::{derive_liquidity, ForecastSpread};
use crate::lmsr::{Pricer, Side, DEFAULT_LIQUIDITY};
use crate::store::{LedgerEntry, Market, MarketStatus, MarketStore, Position, StoreError};
use crate::ticker::parse_ticker;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Optional forecast inputs for deriving liquidity at market creation.
#[derive(Debug, Clone, Copy)]
pub struct LiquidityRequest {
    pub spread: ForecastSpread,
    pub base_volume: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionSummary {
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeResponse {
    pub trade_id: Uuid,
    pub user_id: String,
    pub contract_id: String,
    pub side: Side,
    pub quantity: Decimal,
    pub fill_price: Decimal,
    pub cost: Decimal,
    pub position: PositionSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceQuote {
    #[serde(with = "rust_decimal::serde::float")]
    pub yes: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub no: Decimal,
    pub max_loss: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub user_id: String,
    pub positions: Vec<Position>,
    pub total_pnl: Decimal,
    pub total_exposure: Decimal,
    pub cell_exposures: HashMap<String, Decimal>,
    pub margin_utilization: Decimal,
}

pub struct TradeService {
    store: Arc<dyn MarketStore>,
    limiter: PositionLimiter,
    hub: Option<Arc<PriceFeedHub>>,
    margin_limit: Decimal,
    write_lock: Mutex<()>,
}

impl TradeService {
    pub fn new(
        store: Arc<dyn MarketStore>,
        limiter: PositionLimiter,
        hub: Option<Arc<PriceFeedHub>>,
        margin_limit: Decimal,
    ) -> Self {
        Self {
            store,
            limiter,
            hub,
            margin_limit,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a market for a contract ticker. A non-positive `b` falls back
    /// to the forecast-derived value when forecast inputs are supplied, and
    /// to the default liquidity otherwise.
    pub async fn create_market(
        &self,
        contract_id: &str,
        requested_b: Decimal,
        forecast: Option<LiquidityRequest>,
    ) -> Result<Market> {
        let parsed = parse_ticker(contract_id)?;

        let b = if requested_b > Decimal::ZERO {
            requested_b
        } else if let Some(forecast) = forecast {
            derive_liquidity(&forecast.spread, forecast.base_volume)
        } else {
            DEFAULT_LIQUIDITY
        };
        Pricer::new(b)?;

        let market = Market {
            id: Uuid::new_v4(),
            contract_id: parsed.ticker,
            cell_id: parsed.cell_id,
            q_yes: Decimal::ZERO,
            q_no: Decimal::ZERO,
            b,
            price_yes: dec!(0.5),
            price_no: dec!(0.5),
            status: MarketStatus::Open,
            created_at: Utc::now(),
        };

        self.store.create_market(&market).await?;
        metrics::increment_gauge!("active_markets", 1.0);
        tracing::info!(
            contract_id = %market.contract_id,
            market_id = %market.id,
            b = %market.b,
            "market created"
        );
        Ok(market)
    }

    pub async fn get_market(&self, id: Uuid) -> Result<Market> {
        Ok(self.store.get_market(id).await?)
    }

    pub async fn list_markets(&self, cell_filter: Option<&str>) -> Result<Vec<Market>> {
        Ok(self.store.list_markets(cell_filter).await?)
    }

    pub async fn get_price(&self, id: Uuid) -> Result<PriceQuote> {
        let market = self.store.get_market(id).await?;
        let pricer = Pricer::new(market.b)
            .map_err(|e| EngineError::internal(anyhow::anyhow!("stored liquidity invalid: {e}")))?;
        Ok(PriceQuote {
            yes: market.price_yes,
            no: market.price_no,
            max_loss: pricer.max_loss()?,
        })
    }

    pub async fn get_market_history(&self, id: Uuid) -> Result<Vec<LedgerEntry>> {
        Ok(self.store.ledger_for_market(id).await?)
    }

    /// Execute one trade through the full pipeline. See the module docs for
    /// why the body runs under the writer lock.
    pub async fn execute_trade(
        &self,
        user_id: &str,
        contract_id: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<TradeResponse> {
        if user_id.is_empty() {
            return Err(EngineError::BadRequest("user_id must not be empty".into()));
        }
        if quantity.is_zero() {
            return Err(EngineError::BadRequest("quantity must not be zero".into()));
        }

        let started = std::time::Instant::now();
        let result = self
            .execute_trade_locked(user_id, contract_id, side, quantity)
            .await;
        metrics::histogram!("trade_duration_seconds", started.elapsed().as_secs_f64());

        match &result {
            Ok(resp) => {
                metrics::increment_counter!("trades_total", "side" => side.as_str());
                metrics::increment_gauge!(
                    "market_volume_total",
                    quantity.abs().to_f64().unwrap_or(0.0),
                    "contract" => contract_id.to_string()
                );
                tracing::info!(
                    user_id,
                    contract_id,
                    side = side.as_str(),
                    quantity = %quantity,
                    fill_price = %resp.fill_price,
                    cost = %resp.cost,
                    trade_id = %resp.trade_id,
                    outcome = "executed",
                    "trade executed"
                );
            }
            Err(e) => {
                if matches!(
                    e,
                    EngineError::PerCellLimit { .. } | EngineError::CorrelatedLimit { .. }
                ) {
                    metrics::increment_counter!("position_limit_rejections_total");
                }
                tracing::warn!(
                    user_id,
                    contract_id,
                    side = side.as_str(),
                    quantity = %quantity,
                    outcome = e.kind(),
                    "trade rejected"
                );
            }
        }

        result
    }

    async fn execute_trade_locked(
        &self,
        user_id: &str,
        contract_id: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<TradeResponse> {
        let _guard = self.write_lock.lock().await;

        let market = match self.store.get_market_by_contract(contract_id).await {
            Ok(market) => market,
            Err(StoreError::NotFound) => {
                return Err(EngineError::NotFound(format!("market {contract_id}")))
            }
            Err(e) => return Err(e.into()),
        };

        if market.status != MarketStatus::Open {
            return Err(EngineError::Conflict(format!(
                "market {contract_id} is not open"
            )));
        }

        let pricer = Pricer::new(market.b).map_err(|e| {
            EngineError::internal(anyhow::anyhow!(
                "market {} carries invalid liquidity: {e}",
                market.id
            ))
        })?;

        let exposure_delta = match side {
            Side::Yes => quantity,
            Side::No => -quantity,
        };
        let exposures = self.store.user_cell_exposures(user_id).await?;
        self.limiter
            .check(&market.cell_id, exposure_delta, &exposures)?;

        pricer.validate_trade(market.q_yes, market.q_no, side, quantity)?;

        let cost = pricer.trade_cost(market.q_yes, market.q_no, side, quantity)?;
        let fill_price = pricer.fill_price(market.q_yes, market.q_no, side, quantity)?;
        let (q_yes, q_no) = match side {
            Side::Yes => (market.q_yes + quantity, market.q_no),
            Side::No => (market.q_yes, market.q_no + quantity),
        };
        let (price_yes, price_no) = pricer.prices(q_yes, q_no)?;

        // State before entry: a crash between the two calls leaves slightly
        // inflated market quantities but no phantom position, because the
        // ledger alone is the source of truth for accounting.
        self.store
            .update_market_state(market.id, q_yes, q_no, price_yes, price_no)
            .await?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            market_id: market.id,
            contract_id: market.contract_id.clone(),
            side,
            quantity,
            price: fill_price,
            cost,
            timestamp: Utc::now(),
        };
        self.store.insert_ledger_entry(&entry).await?;

        let positions = self.store.user_positions(user_id).await?;
        let position = positions
            .iter()
            .find(|p| p.market_id == market.id)
            .map(|p| PositionSummary {
                yes_qty: p.yes_qty,
                no_qty: p.no_qty,
                cost_basis: p.cost_basis,
                unrealized_pnl: p.unrealized_pnl,
            })
            .unwrap_or_default();

        if let Some(hub) = &self.hub {
            let updated = Market {
                q_yes,
                q_no,
                price_yes,
                price_no,
                ..market.clone()
            };
            hub.broadcast(&PriceUpdate::trade_executed(&updated, side, quantity));
        }

        Ok(TradeResponse {
            trade_id: entry.id,
            user_id: entry.user_id,
            contract_id: entry.contract_id,
            side,
            quantity,
            fill_price,
            cost,
            position,
        })
    }

    pub async fn get_portfolio(&self, user_id: &str) -> Result<Portfolio> {
        let positions = self.store.user_positions(user_id).await?;
        let cell_exposures = self.store.user_cell_exposures(user_id).await?;

        let total_pnl: Decimal = positions.iter().map(|p| p.unrealized_pnl).sum();
        let total_exposure: Decimal = positions.iter().map(|p| p.net_qty.abs()).sum();

        // Conservative worst-case-loss proxy for $1-payout binary contracts.
        let total_margin: Decimal = positions
            .iter()
            .map(|p| {
                (p.cost_basis - p.yes_qty)
                    .max(p.cost_basis - p.no_qty)
                    .max(Decimal::ZERO)
            })
            .sum();
        let margin_utilization = if self.margin_limit > Decimal::ZERO {
            dec!(100) * total_margin / self.margin_limit
        } else {
            Decimal::ZERO
        };

        Ok(Portfolio {
            user_id: user_id.to_string(),
            positions,
            total_pnl: round2(total_pnl),
            total_exposure: round2(total_exposure),
            cell_exposures,
            margin_utilization: round2(margin_utilization),
        })
    }
}

fn round2(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
