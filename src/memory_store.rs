//! In-memory reference store.
//!
//! Authoritative for tests and used in production when no database is
//! configured. A single readers-writer lock guards both tables; derived
//! queries aggregate in one pass under the read guard and never re-enter
//! public methods (which would re-acquire the lock).

use crate::store::{LedgerEntry, Market, MarketStore, Position, StoreError};
use crate::lmsr::Side;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    markets: HashMap<Uuid, Market>,
    ledger: Vec<LedgerEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn positions_of(tables: &Tables, user_id: &str) -> Vec<Position> {
    struct Acc {
        yes_qty: Decimal,
        no_qty: Decimal,
        cost_basis: Decimal,
    }

    let mut by_market: HashMap<Uuid, Acc> = HashMap::new();
    for entry in tables.ledger.iter().filter(|e| e.user_id == user_id) {
        let acc = by_market.entry(entry.market_id).or_insert(Acc {
            yes_qty: Decimal::ZERO,
            no_qty: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
        });
        match entry.side {
            Side::Yes => acc.yes_qty += entry.quantity,
            Side::No => acc.no_qty += entry.quantity,
        }
        acc.cost_basis += entry.cost;
    }

    let mut positions: Vec<Position> = by_market
        .into_iter()
        .filter_map(|(market_id, acc)| {
            let market = tables.markets.get(&market_id)?;
            let current_value =
                market.price_yes * acc.yes_qty + market.price_no * acc.no_qty;
            Some(Position {
                market_id,
                contract_id: market.contract_id.clone(),
                cell_id: market.cell_id.clone(),
                yes_qty: acc.yes_qty,
                no_qty: acc.no_qty,
                net_qty: acc.yes_qty - acc.no_qty,
                cost_basis: acc.cost_basis,
                current_value,
                unrealized_pnl: current_value - acc.cost_basis,
            })
        })
        .collect();
    positions.sort_by(|a, b| a.contract_id.cmp(&b.contract_id));
    positions
}

fn exposures_of(tables: &Tables, user_id: &str) -> HashMap<String, Decimal> {
    let mut exposures: HashMap<String, Decimal> = HashMap::new();
    for entry in tables.ledger.iter().filter(|e| e.user_id == user_id) {
        let Some(market) = tables.markets.get(&entry.market_id) else {
            continue;
        };
        let signed = match entry.side {
            Side::Yes => entry.quantity,
            Side::No => -entry.quantity,
        };
        *exposures.entry(market.cell_id.clone()).or_default() += signed;
    }
    exposures
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn create_market(&self, market: &Market) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables
            .markets
            .values()
            .any(|m| m.contract_id == market.contract_id)
        {
            return Err(StoreError::Conflict(format!(
                "market for contract {} already exists",
                market.contract_id
            )));
        }
        tables.markets.insert(market.id, market.clone());
        Ok(())
    }

    async fn get_market(&self, id: Uuid) -> Result<Market, StoreError> {
        let tables = self.tables.read().await;
        tables.markets.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_market_by_contract(&self, contract_id: &str) -> Result<Market, StoreError> {
        let tables = self.tables.read().await;
        tables
            .markets
            .values()
            .find(|m| m.contract_id == contract_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_markets(&self, cell_filter: Option<&str>) -> Result<Vec<Market>, StoreError> {
        let tables = self.tables.read().await;
        let mut markets: Vec<Market> = tables
            .markets
            .values()
            .filter(|m| cell_filter.map_or(true, |cell| m.cell_id == cell))
            .cloned()
            .collect();
        markets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(markets)
    }

    async fn update_market_state(
        &self,
        id: Uuid,
        q_yes: Decimal,
        q_no: Decimal,
        price_yes: Decimal,
        price_no: Decimal,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let market = tables.markets.get_mut(&id).ok_or(StoreError::NotFound)?;
        market.q_yes = q_yes;
        market.q_no = q_no;
        market.price_yes = price_yes;
        market.price_no = price_no;
        Ok(())
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.markets.contains_key(&entry.market_id) {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "ledger entry references unknown market {}",
                entry.market_id
            )));
        }
        tables.ledger.push(entry.clone());
        Ok(())
    }

    async fn ledger_for_market(&self, market_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables = self.tables.read().await;
        let mut entries: Vec<LedgerEntry> = tables
            .ledger
            .iter()
            .filter(|e| e.market_id == market_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables = self.tables.read().await;
        let mut entries: Vec<LedgerEntry> = tables
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn user_positions(&self, user_id: &str) -> Result<Vec<Position>, StoreError> {
        let tables = self.tables.read().await;
        Ok(positions_of(&tables, user_id))
    }

    async fn user_cell_exposures(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, Decimal>, StoreError> {
        let tables = self.tables.read().await;
        Ok(exposures_of(&tables, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MarketStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn market(contract_id: &str, cell_id: &str) -> Market {
        Market {
            id: Uuid::new_v4(),
            contract_id: contract_id.to_string(),
            cell_id: cell_id.to_string(),
            q_yes: Decimal::ZERO,
            q_no: Decimal::ZERO,
            b: dec!(100),
            price_yes: dec!(0.5),
            price_no: dec!(0.5),
            status: MarketStatus::Open,
            created_at: Utc::now(),
        }
    }

    fn entry(market: &Market, user: &str, side: Side, qty: Decimal, cost: Decimal) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            market_id: market.id,
            contract_id: market.contract_id.clone(),
            side,
            quantity: qty,
            price: dec!(0.5),
            cost,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_contract_is_a_conflict() {
        let store = MemoryStore::new();
        let m = market("ATMX-872a1070b-PRECIP-25MM-20250815", "872a1070b");
        store.create_market(&m).await.unwrap();

        let mut dup = market("ATMX-872a1070b-PRECIP-25MM-20250815", "872a1070b");
        dup.id = Uuid::new_v4();
        assert!(matches!(
            store.create_market(&dup).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn missing_market_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_market(Uuid::new_v4()).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_market_by_contract("ATMX-ffff-TEMP-30C-20250901").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_markets_filters_by_cell() {
        let store = MemoryStore::new();
        store
            .create_market(&market("ATMX-872a1070b-PRECIP-25MM-20250815", "872a1070b"))
            .await
            .unwrap();
        store
            .create_market(&market("ATMX-872b20000-WIND-30KT-20250815", "872b20000"))
            .await
            .unwrap();

        assert_eq!(store.list_markets(None).await.unwrap().len(), 2);
        let filtered = store.list_markets(Some("872a1070b")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].cell_id, "872a1070b");
    }

    #[tokio::test]
    async fn positions_derive_from_ledger() {
        let store = MemoryStore::new();
        let m = market("ATMX-872a1070b-PRECIP-25MM-20250815", "872a1070b");
        store.create_market(&m).await.unwrap();

        store
            .insert_ledger_entry(&entry(&m, "alice", Side::Yes, dec!(10), dec!(5.2)))
            .await
            .unwrap();
        store
            .insert_ledger_entry(&entry(&m, "alice", Side::No, dec!(4), dec!(1.9)))
            .await
            .unwrap();
        store
            .insert_ledger_entry(&entry(&m, "bob", Side::Yes, dec!(1), dec!(0.5)))
            .await
            .unwrap();

        let positions = store.user_positions("alice").await.unwrap();
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.yes_qty, dec!(10));
        assert_eq!(p.no_qty, dec!(4));
        assert_eq!(p.net_qty, dec!(6));
        assert_eq!(p.cost_basis, dec!(7.1));
        assert_eq!(p.current_value, dec!(0.5) * dec!(10) + dec!(0.5) * dec!(4));
        assert_eq!(p.unrealized_pnl, p.current_value - p.cost_basis);
    }

    #[tokio::test]
    async fn exposures_net_yes_against_no() {
        let store = MemoryStore::new();
        let m = market("ATMX-872a1070b-PRECIP-25MM-20250815", "872a1070b");
        store.create_market(&m).await.unwrap();

        store
            .insert_ledger_entry(&entry(&m, "alice", Side::Yes, dec!(10), dec!(5)))
            .await
            .unwrap();
        store
            .insert_ledger_entry(&entry(&m, "alice", Side::No, dec!(3), dec!(1.4)))
            .await
            .unwrap();

        let exposures = store.user_cell_exposures("alice").await.unwrap();
        assert_eq!(exposures.get("872a1070b"), Some(&dec!(7)));
    }

    #[tokio::test]
    async fn update_market_state_touches_only_four_fields() {
        let store = MemoryStore::new();
        let m = market("ATMX-872a1070b-PRECIP-25MM-20250815", "872a1070b");
        store.create_market(&m).await.unwrap();

        store
            .update_market_state(m.id, dec!(12), dec!(3), dec!(0.52), dec!(0.48))
            .await
            .unwrap();

        let updated = store.get_market(m.id).await.unwrap();
        assert_eq!(updated.q_yes, dec!(12));
        assert_eq!(updated.q_no, dec!(3));
        assert_eq!(updated.price_yes, dec!(0.52));
        assert_eq!(updated.price_no, dec!(0.48));
        assert_eq!(updated.b, m.b);
        assert_eq!(updated.status, m.status);
    }
}
