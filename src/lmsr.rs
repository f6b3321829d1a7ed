//! Numerically stable LMSR pricer.
//!
//! All transcendental math runs on f64 inside this module; every public input
//! and output is an exact `Decimal` rounded to a fixed scale. No native float
//! crosses a module boundary.

use crate::errors::EngineError;
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Price clamp bounds for a binary market.
pub const MIN_PRICE: f64 = 0.001;
pub const MAX_PRICE: f64 = 0.999;

/// Fractional digits kept on every pricer output.
pub const PRICE_SCALE: u32 = 8;

/// Liquidity used when market creation does not specify one.
pub const DEFAULT_LIQUIDITY: Decimal = dec!(100);

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    /// Strict parse at the API/database boundary; unknown sides are rejected.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "YES" => Ok(Side::Yes),
            "NO" => Ok(Side::No),
            other => Err(EngineError::BadRequest(format!(
                "invalid side '{other}', expected YES or NO"
            ))),
        }
    }
}

/// Stateless LMSR market maker over a fixed liquidity parameter.
#[derive(Debug, Clone, Copy)]
pub struct Pricer {
    b: f64,
}

impl Pricer {
    pub fn new(b: Decimal) -> Result<Self, EngineError> {
        if b <= Decimal::ZERO {
            return Err(EngineError::InvalidLiquidity(b));
        }
        let b_f = to_f64(b)?;
        if !b_f.is_finite() || b_f <= 0.0 {
            return Err(EngineError::InvalidLiquidity(b));
        }
        Ok(Self { b: b_f })
    }

    /// Cost function C(qY, qN) = b * lse(qY/b, qN/b).
    pub fn cost(&self, q_yes: Decimal, q_no: Decimal) -> Result<Decimal, EngineError> {
        let (qy, qn) = (to_f64(q_yes)?, to_f64(q_no)?);
        round_out(raw_cost(qy, qn, self.b))
    }

    /// Instantaneous YES price, clamped to [MIN_PRICE, MAX_PRICE].
    pub fn price_yes(&self, q_yes: Decimal, q_no: Decimal) -> Result<Decimal, EngineError> {
        let (qy, qn) = (to_f64(q_yes)?, to_f64(q_no)?);
        round_out(raw_price_yes(qy, qn, self.b).clamp(MIN_PRICE, MAX_PRICE))
    }

    /// Instantaneous NO price, complementary to YES and clamped the same way.
    pub fn price_no(&self, q_yes: Decimal, q_no: Decimal) -> Result<Decimal, EngineError> {
        let (qy, qn) = (to_f64(q_yes)?, to_f64(q_no)?);
        let p = 1.0 - raw_price_yes(qy, qn, self.b);
        round_out(p.clamp(MIN_PRICE, MAX_PRICE))
    }

    /// Both clamped prices in one call.
    pub fn prices(&self, q_yes: Decimal, q_no: Decimal) -> Result<(Decimal, Decimal), EngineError> {
        Ok((self.price_yes(q_yes, q_no)?, self.price_no(q_yes, q_no)?))
    }

    /// Incremental cost of trading `delta` shares on `side` from the given state.
    /// Positive delta buys, negative sells; the sign of the result follows.
    pub fn trade_cost(
        &self,
        q_yes: Decimal,
        q_no: Decimal,
        side: Side,
        delta: Decimal,
    ) -> Result<Decimal, EngineError> {
        let (qy, qn, d) = (to_f64(q_yes)?, to_f64(q_no)?, to_f64(delta)?);
        round_out(raw_trade_cost(qy, qn, self.b, side, d))
    }

    /// Average price per share for the trade; the current side price when delta is zero.
    pub fn fill_price(
        &self,
        q_yes: Decimal,
        q_no: Decimal,
        side: Side,
        delta: Decimal,
    ) -> Result<Decimal, EngineError> {
        if delta.is_zero() {
            return match side {
                Side::Yes => self.price_yes(q_yes, q_no),
                Side::No => self.price_no(q_yes, q_no),
            };
        }
        let (qy, qn, d) = (to_f64(q_yes)?, to_f64(q_no)?, to_f64(delta)?);
        round_out(raw_trade_cost(qy, qn, self.b, side, d) / d)
    }

    /// Reject trades whose post-trade YES price leaves the clamp band.
    pub fn validate_trade(
        &self,
        q_yes: Decimal,
        q_no: Decimal,
        side: Side,
        delta: Decimal,
    ) -> Result<(), EngineError> {
        let (mut qy, mut qn) = (to_f64(q_yes)?, to_f64(q_no)?);
        let d = to_f64(delta)?;
        match side {
            Side::Yes => qy += d,
            Side::No => qn += d,
        }
        let p = raw_price_yes(qy, qn, self.b);
        if !p.is_finite() || p < MIN_PRICE || p > MAX_PRICE {
            return Err(EngineError::PriceBoundExceeded);
        }
        Ok(())
    }

    /// Worst-case market-maker loss for a binary market: b * ln 2.
    pub fn max_loss(&self) -> Result<Decimal, EngineError> {
        round_out(self.b * std::f64::consts::LN_2)
    }
}

// -----------------------
// f64 core
// -----------------------

#[inline]
fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

#[inline]
fn raw_cost(q_yes: f64, q_no: f64, b: f64) -> f64 {
    b * log_sum_exp(q_yes / b, q_no / b)
}

#[inline]
fn raw_price_yes(q_yes: f64, q_no: f64, b: f64) -> f64 {
    let a = q_yes / b;
    let c = q_no / b;
    let m = a.max(c);
    let ey = (a - m).exp();
    let en = (c - m).exp();
    ey / (ey + en)
}

/// C(a, b) = C(b, a), so the NO-side cost reuses the YES formula with the
/// arguments swapped.
#[inline]
fn raw_trade_cost(q_yes: f64, q_no: f64, b: f64, side: Side, delta: f64) -> f64 {
    match side {
        Side::Yes => raw_cost(q_yes + delta, q_no, b) - raw_cost(q_yes, q_no, b),
        Side::No => raw_cost(q_no + delta, q_yes, b) - raw_cost(q_no, q_yes, b),
    }
}

fn to_f64(d: Decimal) -> Result<f64, EngineError> {
    d.to_f64()
        .filter(|x| x.is_finite())
        .ok_or_else(|| EngineError::internal(anyhow::anyhow!("decimal {d} not representable")))
}

fn round_out(x: f64) -> Result<Decimal, EngineError> {
    if !x.is_finite() {
        return Err(EngineError::internal(anyhow::anyhow!(
            "non-finite pricer output: {x}"
        )));
    }
    let d = Decimal::from_f64(x)
        .ok_or_else(|| EngineError::internal(anyhow::anyhow!("pricer output {x} out of range")))?;
    Ok(d.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

// -----------------------
// Tests
// -----------------------
