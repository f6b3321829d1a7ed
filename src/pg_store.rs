//! PostgreSQL-backed source-of-truth store.
//!
//! Money and quantity columns are NUMERIC without scale restriction so the
//! database round-trips the exact decimals the engine computes. Ledger
//! immutability is enforced at the role level (UPDATE/DELETE revoked), not in
//! application code.

use crate::lmsr::Side;
use crate::store::{LedgerEntry, Market, MarketStatus, MarketStore, Position, StoreError};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

/// PostgreSQL SQLSTATE codes the store maps to domain errors.
/// Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
mod pg_error_codes {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS markets (
    id          UUID PRIMARY KEY,
    contract_id TEXT NOT NULL UNIQUE,
    cell_id     TEXT NOT NULL,
    q_yes       NUMERIC NOT NULL DEFAULT 0,
    q_no        NUMERIC NOT NULL DEFAULT 0,
    b           NUMERIC NOT NULL,
    price_yes   NUMERIC NOT NULL DEFAULT 0.5,
    price_no    NUMERIC NOT NULL DEFAULT 0.5,
    status      TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'settled')),
    created_at  TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_markets_contract_id ON markets (contract_id);
CREATE INDEX IF NOT EXISTS idx_markets_cell_id ON markets (cell_id);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id          UUID PRIMARY KEY,
    user_id     TEXT NOT NULL,
    market_id   UUID NOT NULL REFERENCES markets (id),
    contract_id TEXT NOT NULL,
    side        TEXT NOT NULL CHECK (side IN ('YES', 'NO')),
    quantity    NUMERIC NOT NULL,
    price       NUMERIC NOT NULL,
    cost        NUMERIC NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_user_id ON ledger_entries (user_id);
CREATE INDEX IF NOT EXISTS idx_ledger_market_id ON ledger_entries (market_id);
CREATE INDEX IF NOT EXISTS idx_ledger_user_market ON ledger_entries (user_id, market_id);
CREATE INDEX IF NOT EXISTS idx_ledger_created_at ON ledger_entries (created_at);
"#;

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let store = Self::new(create_pool(database_url).await?);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes, then revoke ledger mutation from
    /// application roles. The revoke cannot bind the table owner, so it is
    /// best-effort when the engine connects as owner.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        if let Err(e) = sqlx::query("REVOKE UPDATE, DELETE ON ledger_entries FROM PUBLIC")
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %e, "could not revoke ledger mutation from PUBLIC");
        }

        Ok(())
    }
}

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    if matches!(err, sqlx::Error::RowNotFound) {
        return StoreError::NotFound;
    }
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(pg_error_codes::UNIQUE_VIOLATION) => {
                return StoreError::Conflict(db.message().to_string());
            }
            Some(pg_error_codes::FOREIGN_KEY_VIOLATION) => {
                return StoreError::Internal(anyhow::anyhow!(
                    "foreign key violation: {}",
                    db.message()
                ));
            }
            _ => {}
        }
    }
    StoreError::Internal(err.into())
}

fn market_from_row(row: &PgRow) -> Result<Market, StoreError> {
    let status: String = row.try_get("status").map_err(map_sqlx_err)?;
    Ok(Market {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        contract_id: row.try_get("contract_id").map_err(map_sqlx_err)?,
        cell_id: row.try_get("cell_id").map_err(map_sqlx_err)?,
        q_yes: row.try_get("q_yes").map_err(map_sqlx_err)?,
        q_no: row.try_get("q_no").map_err(map_sqlx_err)?,
        b: row.try_get("b").map_err(map_sqlx_err)?,
        price_yes: row.try_get("price_yes").map_err(map_sqlx_err)?,
        price_no: row.try_get("price_no").map_err(map_sqlx_err)?,
        status: MarketStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let side: String = row.try_get("side").map_err(map_sqlx_err)?;
    Ok(LedgerEntry {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        user_id: row.try_get("user_id").map_err(map_sqlx_err)?,
        market_id: row.try_get("market_id").map_err(map_sqlx_err)?,
        contract_id: row.try_get("contract_id").map_err(map_sqlx_err)?,
        side: Side::parse(&side)
            .map_err(|_| StoreError::Internal(anyhow::anyhow!("unknown side '{side}'")))?,
        quantity: row.try_get("quantity").map_err(map_sqlx_err)?,
        price: row.try_get("price").map_err(map_sqlx_err)?,
        cost: row.try_get("cost").map_err(map_sqlx_err)?,
        timestamp: row.try_get("created_at").map_err(map_sqlx_err)?,
    })
}

#[async_trait]
impl MarketStore for PgStore {
    async fn create_market(&self, market: &Market) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO markets
                (id, contract_id, cell_id, q_yes, q_no, b, price_yes, price_no, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(market.id)
        .bind(&market.contract_id)
        .bind(&market.cell_id)
        .bind(market.q_yes)
        .bind(market.q_no)
        .bind(market.b)
        .bind(market.price_yes)
        .bind(market.price_no)
        .bind(market.status.as_str())
        .bind(market.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_market(&self, id: Uuid) -> Result<Market, StoreError> {
        let row = sqlx::query("SELECT * FROM markets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(StoreError::NotFound)?;
        market_from_row(&row)
    }

    async fn get_market_by_contract(&self, contract_id: &str) -> Result<Market, StoreError> {
        let row = sqlx::query("SELECT * FROM markets WHERE contract_id = $1")
            .bind(contract_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(StoreError::NotFound)?;
        market_from_row(&row)
    }

    async fn list_markets(&self, cell_filter: Option<&str>) -> Result<Vec<Market>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM markets
             WHERE ($1::TEXT IS NULL OR cell_id = $1)
             ORDER BY created_at DESC",
        )
        .bind(cell_filter)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(market_from_row).collect()
    }

    async fn update_market_state(
        &self,
        id: Uuid,
        q_yes: Decimal,
        q_no: Decimal,
        price_yes: Decimal,
        price_no: Decimal,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE markets
             SET q_yes = $1, q_no = $2, price_yes = $3, price_no = $4
             WHERE id = $5",
        )
        .bind(q_yes)
        .bind(q_no)
        .bind(price_yes)
        .bind(price_no)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ledger_entries
                (id, user_id, market_id, contract_id, side, quantity, price, cost, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(&entry.user_id)
        .bind(entry.market_id)
        .bind(&entry.contract_id)
        .bind(entry.side.as_str())
        .bind(entry.quantity)
        .bind(entry.price)
        .bind(entry.cost)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn ledger_for_market(&self, market_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM ledger_entries WHERE market_id = $1 ORDER BY created_at ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM ledger_entries WHERE user_id = $1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn user_positions(&self, user_id: &str) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                m.id AS market_id,
                m.contract_id,
                m.cell_id,
                m.price_yes,
                m.price_no,
                COALESCE(SUM(CASE WHEN l.side = 'YES' THEN l.quantity ELSE 0 END), 0) AS yes_qty,
                COALESCE(SUM(CASE WHEN l.side = 'NO' THEN l.quantity ELSE 0 END), 0) AS no_qty,
                COALESCE(SUM(l.cost), 0) AS cost_basis
            FROM ledger_entries l
            JOIN markets m ON m.id = l.market_id
            WHERE l.user_id = $1
            GROUP BY m.id, m.contract_id, m.cell_id, m.price_yes, m.price_no
            ORDER BY m.contract_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter()
            .map(|row| {
                let yes_qty: Decimal = row.try_get("yes_qty").map_err(map_sqlx_err)?;
                let no_qty: Decimal = row.try_get("no_qty").map_err(map_sqlx_err)?;
                let cost_basis: Decimal = row.try_get("cost_basis").map_err(map_sqlx_err)?;
                let price_yes: Decimal = row.try_get("price_yes").map_err(map_sqlx_err)?;
                let price_no: Decimal = row.try_get("price_no").map_err(map_sqlx_err)?;
                let current_value = price_yes * yes_qty + price_no * no_qty;
                Ok(Position {
                    market_id: row.try_get("market_id").map_err(map_sqlx_err)?,
                    contract_id: row.try_get("contract_id").map_err(map_sqlx_err)?,
                    cell_id: row.try_get("cell_id").map_err(map_sqlx_err)?,
                    yes_qty,
                    no_qty,
                    net_qty: yes_qty - no_qty,
                    cost_basis,
                    current_value,
                    unrealized_pnl: current_value - cost_basis,
                })
            })
            .collect()
    }

    async fn user_cell_exposures(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, Decimal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                m.cell_id,
                COALESCE(SUM(CASE WHEN l.side = 'YES' THEN l.quantity ELSE -l.quantity END), 0)
                    AS exposure
            FROM ledger_entries l
            JOIN markets m ON m.id = l.market_id
            WHERE l.user_id = $1
            GROUP BY m.cell_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut exposures = HashMap::with_capacity(rows.len());
        for row in &rows {
            let cell_id: String = row.try_get("cell_id").map_err(map_sqlx_err)?;
            let exposure: Decimal = row.try_get("exposure").map_err(map_sqlx_err)?;
            exposures.insert(cell_id, exposure);
        }
        Ok(exposures)
    }
}
