//! Derives the LMSR liquidity parameter from forecast-uncertainty percentiles.
//!
//! A wide interquartile range relative to the median means an uncertain
//! forecast, which warrants a deeper (more liquid) market.

use crate::errors::EngineError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Floor applied to every derived liquidity parameter.
pub const MIN_LIQUIDITY: Decimal = dec!(10);

/// Forecast distribution summary with a guaranteed positive spread.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ForecastSpread {
    pub p25: Decimal,
    pub p50: Decimal,
    pub p75: Decimal,
}

impl ForecastSpread {
    /// Fails when the percentiles are inverted; callers holding a
    /// `ForecastSpread` can rely on `iqr() >= 0`.
    pub fn new(p25: Decimal, p50: Decimal, p75: Decimal) -> Result<Self, EngineError> {
        if p25 > p75 {
            return Err(EngineError::BadRequest(format!(
                "forecast percentiles inverted: p25={p25} > p75={p75}"
            )));
        }
        Ok(Self { p25, p50, p75 })
    }

    pub fn iqr(&self) -> Decimal {
        self.p75 - self.p25
    }
}

/// Map a forecast spread and base volume to a liquidity parameter.
///
/// `b = base_volume * IQR / P50` for a positive median, falling back to the
/// absolute interval width when the median is non-positive, and to the floor
/// when the spread carries no information.
pub fn derive_liquidity(spread: &ForecastSpread, base_volume: Decimal) -> Decimal {
    let iqr = spread.iqr();
    let b = if iqr <= Decimal::ZERO {
        MIN_LIQUIDITY
    } else if spread.p50 > Decimal::ZERO {
        base_volume * iqr / spread.p50
    } else {
        base_volume * iqr
    };
    b.max(MIN_LIQUIDITY)
}
