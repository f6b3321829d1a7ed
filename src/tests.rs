//! End-to-end scenarios over the trade service and the in-memory store.

use crate::errors::EngineError;
use crate::hub::PriceFeedHub;
use crate::limiter::PositionLimiter;
use crate::lmsr::Side;
use crate::memory_store::MemoryStore;
use crate::service::TradeService;
use crate::store::{Market, MarketStatus, MarketStore};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

const CONTRACT_A: &str = "ATMX-872a1070b-PRECIP-25MM-20250815";
const CONTRACT_B: &str = "ATMX-872a1070c-PRECIP-25MM-20250815";

fn engine(limiter: PositionLimiter) -> (TradeService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let service = TradeService::new(store.clone(), limiter, None, dec!(10000));
    (service, store)
}

fn default_engine() -> (TradeService, Arc<MemoryStore>) {
    engine(PositionLimiter::new(dec!(1000), dec!(5000), 5))
}

#[tokio::test]
async fn create_market_applies_defaults() {
    let (service, _) = default_engine();

    let market = service
        .create_market(CONTRACT_A, Decimal::ZERO, None)
        .await
        .unwrap();
    assert_eq!(market.b, dec!(100));
    assert_eq!(market.q_yes, Decimal::ZERO);
    assert_eq!(market.q_no, Decimal::ZERO);
    assert_eq!(market.price_yes, dec!(0.5));
    assert_eq!(market.price_no, dec!(0.5));
    assert_eq!(market.status, MarketStatus::Open);
    assert_eq!(market.cell_id, "872a1070b");

    let err = service
        .create_market(CONTRACT_A, dec!(200), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn create_market_rejects_bad_tickers() {
    let (service, _) = default_engine();

    let err = service
        .create_market("BTC-872a1070b-PRECIP-25MM-20250815", dec!(100), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTicker(_)));

    let err = service
        .create_market("ATMX-872a1070b-HAIL-25MM-20250815", dec!(100), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedType(_)));
}

#[tokio::test]
async fn buy_yes_moves_the_price_up() {
    let (service, _) = default_engine();
    service
        .create_market(CONTRACT_A, dec!(100), None)
        .await
        .unwrap();

    let resp = service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(50))
        .await
        .unwrap();
    assert!(resp.fill_price > dec!(0.5) && resp.fill_price < dec!(0.65));
    assert!(resp.cost > Decimal::ZERO);
    assert_eq!(resp.position.yes_qty, dec!(50));

    let market = service
        .list_markets(Some("872a1070b"))
        .await
        .unwrap()
        .remove(0);
    assert!(market.price_yes > dec!(0.5));
    assert!((market.price_yes + market.price_no - Decimal::ONE).abs() < dec!(0.0000001));
}

#[tokio::test]
async fn oversized_trade_hits_the_price_bound() {
    // Position limits would also fire at this size; widen them so the
    // price-bound check is the one that trips.
    let (unlimited, _) = engine(PositionLimiter::new(
        dec!(10000000),
        dec!(10000000),
        5,
    ));
    unlimited
        .create_market(CONTRACT_A, dec!(100), None)
        .await
        .unwrap();
    let err = unlimited
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(100000))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PriceBoundExceeded));
}

#[tokio::test]
async fn trade_validation_rejects_bad_input() {
    let (service, _) = default_engine();
    service
        .create_market(CONTRACT_A, dec!(100), None)
        .await
        .unwrap();

    let err = service
        .execute_trade("", CONTRACT_A, Side::Yes, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let err = service
        .execute_trade("alice", CONTRACT_A, Side::Yes, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let err = service
        .execute_trade("alice", "ATMX-ffffffff-TEMP-30C-20250901", Side::Yes, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn settled_market_rejects_trades() {
    let (service, store) = default_engine();
    let market = Market {
        id: Uuid::new_v4(),
        contract_id: CONTRACT_A.to_string(),
        cell_id: "872a1070b".to_string(),
        q_yes: Decimal::ZERO,
        q_no: Decimal::ZERO,
        b: dec!(100),
        price_yes: dec!(0.5),
        price_no: dec!(0.5),
        status: MarketStatus::Settled,
        created_at: Utc::now(),
    };
    store.create_market(&market).await.unwrap();

    let err = service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn per_cell_limit_gates_exposure() {
    let (service, _) = default_engine();
    // Deep market so the limiter, not the price bound, is what trips.
    service
        .create_market(CONTRACT_A, dec!(10000), None)
        .await
        .unwrap();
    service
        .create_market(CONTRACT_B, dec!(10000), None)
        .await
        .unwrap();

    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(950))
        .await
        .unwrap();

    let err = service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(100))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PerCellLimit { .. }));

    // Sibling cell shares the "872a1" prefix: allowed, correlated total 1000.
    service
        .execute_trade("alice", CONTRACT_B, Side::Yes, dec!(50))
        .await
        .unwrap();

    // Exactly at the per-cell cap is allowed.
    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(50))
        .await
        .unwrap();
}

#[tokio::test]
async fn hurricane_path_trips_the_correlated_cap() {
    let (service, _) = engine(PositionLimiter::new(dec!(500), dec!(3000), 5));

    for i in 0..15 {
        let contract = format!("ATMX-872a1{i:04x}-WIND-64KT-20250901");
        service
            .create_market(&contract, dec!(10000), None)
            .await
            .unwrap();
        service
            .execute_trade("alice", &contract, Side::Yes, dec!(200))
            .await
            .unwrap();
    }

    let fresh = "ATMX-872a1ffff-WIND-64KT-20250901";
    service
        .create_market(fresh, dec!(10000), None)
        .await
        .unwrap();
    let err = service
        .execute_trade("alice", fresh, Side::Yes, dec!(100))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CorrelatedLimit { .. }));

    // A cell outside the storm corridor is unaffected.
    let elsewhere = "ATMX-90ab2cdef-WIND-64KT-20250901";
    service
        .create_market(elsewhere, dec!(10000), None)
        .await
        .unwrap();
    service
        .execute_trade("alice", elsewhere, Side::Yes, dec!(100))
        .await
        .unwrap();
}

#[tokio::test]
async fn split_trade_costs_the_same_as_one() {
    let (service, _) = default_engine();
    service
        .create_market(CONTRACT_A, dec!(100), None)
        .await
        .unwrap();
    service
        .create_market(CONTRACT_B, dec!(100), None)
        .await
        .unwrap();

    let first = service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(10))
        .await
        .unwrap();
    let second = service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(5))
        .await
        .unwrap();
    let combined = service
        .execute_trade("bob", CONTRACT_B, Side::Yes, dec!(15))
        .await
        .unwrap();

    let split_total = first.cost + second.cost;
    assert!(
        (split_total - combined.cost).abs() < dec!(0.0000001),
        "split={split_total} combined={}",
        combined.cost
    );
}

#[tokio::test]
async fn positions_net_out_against_the_ledger() {
    let (service, store) = default_engine();
    service
        .create_market(CONTRACT_A, dec!(1000), None)
        .await
        .unwrap();

    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(30))
        .await
        .unwrap();
    service
        .execute_trade("alice", CONTRACT_A, Side::No, dec!(12))
        .await
        .unwrap();
    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(-10))
        .await
        .unwrap();

    let positions = store.user_positions("alice").await.unwrap();
    assert_eq!(positions.len(), 1);
    let p = &positions[0];
    assert_eq!(p.yes_qty, dec!(20));
    assert_eq!(p.no_qty, dec!(12));
    assert_eq!(p.net_qty, dec!(8));

    let entries = store.ledger_for_user("alice").await.unwrap();
    let yes_sum: Decimal = entries
        .iter()
        .filter(|e| e.side == Side::Yes)
        .map(|e| e.quantity)
        .sum();
    let no_sum: Decimal = entries
        .iter()
        .filter(|e| e.side == Side::No)
        .map(|e| e.quantity)
        .sum();
    assert_eq!(yes_sum - no_sum, p.net_qty);
    let cost_sum: Decimal = entries.iter().map(|e| e.cost).sum();
    assert_eq!(cost_sum, p.cost_basis);
}

#[tokio::test]
async fn selling_returns_cash_and_reduces_exposure() {
    let (service, store) = default_engine();
    service
        .create_market(CONTRACT_A, dec!(1000), None)
        .await
        .unwrap();

    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(100))
        .await
        .unwrap();
    let sale = service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(-40))
        .await
        .unwrap();
    assert!(sale.cost < Decimal::ZERO, "seller should receive cash");

    let exposures = store.user_cell_exposures("alice").await.unwrap();
    assert_eq!(exposures.get("872a1070b"), Some(&dec!(60)));
}

#[tokio::test]
async fn portfolio_aggregates_and_rounds() {
    let (service, _) = default_engine();
    service
        .create_market(CONTRACT_A, dec!(1000), None)
        .await
        .unwrap();
    let far_cell = "ATMX-90ab2cdef-TEMP-35C-20250901";
    service
        .create_market(far_cell, dec!(1000), None)
        .await
        .unwrap();

    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(10))
        .await
        .unwrap();
    service
        .execute_trade("alice", far_cell, Side::No, dec!(5))
        .await
        .unwrap();

    let portfolio = service.get_portfolio("alice").await.unwrap();
    assert_eq!(portfolio.positions.len(), 2);
    assert_eq!(portfolio.total_exposure, dec!(15));
    assert_eq!(portfolio.cell_exposures.get("872a1070b"), Some(&dec!(10)));
    assert_eq!(portfolio.cell_exposures.get("90ab2cdef"), Some(&dec!(-5)));
    assert!(portfolio.margin_utilization >= Decimal::ZERO);
    assert!(portfolio.margin_utilization.scale() <= 2);
    assert!(portfolio.total_pnl.scale() <= 2);

    let expected_pnl: Decimal = portfolio.positions.iter().map(|p| p.unrealized_pnl).sum();
    assert!((portfolio.total_pnl - expected_pnl).abs() <= dec!(0.01));
}

#[tokio::test]
async fn ledger_entries_never_change_once_written() {
    let (service, store) = default_engine();
    let market = service
        .create_market(CONTRACT_A, dec!(1000), None)
        .await
        .unwrap();

    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(10))
        .await
        .unwrap();
    service
        .execute_trade("bob", CONTRACT_A, Side::No, dec!(7))
        .await
        .unwrap();

    let before = store.ledger_for_market(market.id).await.unwrap();
    assert_eq!(before.len(), 2);

    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(3))
        .await
        .unwrap();

    let after = store.ledger_for_market(market.id).await.unwrap();
    assert_eq!(after.len(), 3);
    for (old, new) in before.iter().zip(after.iter()) {
        assert_eq!(old.id, new.id);
        assert_eq!(old.quantity, new.quantity);
        assert_eq!(old.price, new.price);
        assert_eq!(old.cost, new.cost);
        assert_eq!(old.timestamp, new.timestamp);
    }
}

#[tokio::test]
async fn executed_trades_reach_live_subscribers() {
    let store = Arc::new(MemoryStore::new());
    let hub = PriceFeedHub::new();
    let service = TradeService::new(
        store,
        PositionLimiter::new(dec!(1000), dec!(5000), 5),
        Some(hub.clone()),
        dec!(10000),
    );

    let (_id, mut rx) = hub.subscribe();

    service
        .create_market(CONTRACT_A, dec!(100), None)
        .await
        .unwrap();
    service
        .execute_trade("alice", CONTRACT_A, Side::Yes, dec!(25))
        .await
        .unwrap();

    let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("open channel");
    let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(parsed["type"], "trade_executed");
    assert_eq!(parsed["contract_id"], CONTRACT_A);
    assert_eq!(parsed["h3_cell_id"], "872a1070b");
    assert_eq!(parsed["side"], "YES");
    assert_eq!(parsed["quantity"], "25");
    // prices ride along as decimal strings
    assert!(parsed["price_yes"].is_string());
}

#[tokio::test]
async fn random_trade_walk_preserves_invariants() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let (service, store) = engine(PositionLimiter::new(dec!(100000), dec!(500000), 5));
    service
        .create_market(CONTRACT_A, dec!(1000), None)
        .await
        .unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..50 {
        let side = if rng.gen_bool(0.5) { Side::Yes } else { Side::No };
        let qty = Decimal::from(rng.gen_range(1..50));
        service
            .execute_trade("alice", CONTRACT_A, side, qty)
            .await
            .unwrap();

        let market = service.list_markets(None).await.unwrap().remove(0);
        assert!(market.price_yes >= dec!(0.001) && market.price_yes <= dec!(0.999));
        assert!((market.price_yes + market.price_no - Decimal::ONE).abs() < dec!(0.0000001));
    }

    let positions = store.user_positions("alice").await.unwrap();
    let entries = store.ledger_for_user("alice").await.unwrap();
    assert_eq!(entries.len(), 50);
    let yes: Decimal = entries
        .iter()
        .filter(|e| e.side == Side::Yes)
        .map(|e| e.quantity)
        .sum();
    let no: Decimal = entries
        .iter()
        .filter(|e| e.side == Side::No)
        .map(|e| e.quantity)
        .sum();
    assert_eq!(positions[0].net_qty, yes - no);
}

#[tokio::test]
async fn market_history_is_oldest_first() {
    let (service, _) = default_engine();
    let market = service
        .create_market(CONTRACT_A, dec!(1000), None)
        .await
        .unwrap();

    for qty in [5, 10, 15] {
        service
            .execute_trade("alice", CONTRACT_A, Side::Yes, Decimal::from(qty))
            .await
            .unwrap();
    }

    let history = service.get_market_history(market.id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(history[0].quantity, dec!(5));
    assert_eq!(history[2].quantity, dec!(15));
}
