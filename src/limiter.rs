//! Correlation-aware position limits.
//!
//! Cells whose identifiers share a prefix sit in the same weather system and
//! move together; exposure across them is capped as a group on top of the
//! per-cell cap.

use crate::errors::EngineError;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PositionLimiter {
    max_per_cell: Decimal,
    max_correlated: Decimal,
    prefix_len: usize,
}

impl PositionLimiter {
    pub fn new(max_per_cell: Decimal, max_correlated: Decimal, prefix_len: usize) -> Self {
        Self {
            max_per_cell,
            max_correlated,
            prefix_len: prefix_len.max(1),
        }
    }

    /// Gate a prospective exposure change against both caps.
    ///
    /// `existing` is the user's current net exposure per cell; missing cells
    /// count as zero. Exposure exactly at a cap is allowed. The per-cell
    /// check is reported before the correlated-group check.
    pub fn check(
        &self,
        target_cell: &str,
        exposure_delta: Decimal,
        existing: &HashMap<String, Decimal>,
    ) -> Result<(), EngineError> {
        let current = existing
            .get(target_cell)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let new_in_cell = current + exposure_delta;

        if new_in_cell.abs() > self.max_per_cell {
            return Err(EngineError::PerCellLimit {
                new_exposure: new_in_cell,
                limit: self.max_per_cell,
            });
        }

        let prefix = cell_prefix(target_cell, self.prefix_len);
        let mut correlated = new_in_cell.abs();
        for (cell, exposure) in existing {
            if cell != target_cell && cell_prefix(cell, self.prefix_len) == prefix {
                correlated += exposure.abs();
            }
        }

        if correlated > self.max_correlated {
            return Err(EngineError::CorrelatedLimit {
                total: correlated,
                limit: self.max_correlated,
            });
        }

        Ok(())
    }
}

fn cell_prefix(cell: &str, len: usize) -> &str {
    // Cell ids are ASCII hex, so byte slicing is safe; guard anyway.
    cell.get(..len.min(cell.len())).unwrap_or(cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exposures(entries: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
        entries
            .iter()
            .map(|(cell, e)| (cell.to_string(), *e))
            .collect()
    }

    #[test]
    fn per_cell_cap_rejects_overflowing_delta() {
        let limiter = PositionLimiter::new(dec!(1000), dec!(5000), 5);
        let existing = exposures(&[("872a1070b", dec!(950))]);

        let err = limiter
            .check("872a1070b", dec!(100), &existing)
            .unwrap_err();
        assert!(matches!(err, EngineError::PerCellLimit { .. }));
    }

    #[test]
    fn exactly_at_cap_is_allowed() {
        let limiter = PositionLimiter::new(dec!(1000), dec!(5000), 5);
        let existing = exposures(&[("872a1070b", dec!(950))]);

        assert!(limiter.check("872a1070b", dec!(50), &existing).is_ok());
    }

    #[test]
    fn sibling_cell_counts_toward_correlated_total() {
        let limiter = PositionLimiter::new(dec!(1000), dec!(5000), 5);
        let existing = exposures(&[("872a1070b", dec!(950))]);

        // Same "872a1" prefix; correlated total becomes 1000, still allowed.
        assert!(limiter.check("872a1070c", dec!(50), &existing).is_ok());
    }

    #[test]
    fn hurricane_path_saturates_correlated_cap() {
        let limiter = PositionLimiter::new(dec!(500), dec!(3000), 5);
        let mut existing = HashMap::new();
        for i in 0..15 {
            existing.insert(format!("872a1{i:04x}"), dec!(200));
        }

        let err = limiter
            .check("872a1ffff", dec!(100), &existing)
            .unwrap_err();
        assert!(matches!(err, EngineError::CorrelatedLimit { .. }));
    }

    #[test]
    fn uncorrelated_prefix_is_ignored() {
        let limiter = PositionLimiter::new(dec!(500), dec!(3000), 5);
        let mut existing = HashMap::new();
        for i in 0..15 {
            existing.insert(format!("872a1{i:04x}"), dec!(200));
        }

        // Different prefix "872b2": only the new cell's own exposure counts.
        assert!(limiter.check("872b2aaaa", dec!(100), &existing).is_ok());
    }

    #[test]
    fn negative_exposure_counts_by_magnitude() {
        let limiter = PositionLimiter::new(dec!(1000), dec!(1500), 5);
        let existing = exposures(&[("872a1070b", dec!(-900))]);

        // |−900 − 200| = 1100 > 1000
        let err = limiter
            .check("872a1070b", dec!(-200), &existing)
            .unwrap_err();
        assert!(matches!(err, EngineError::PerCellLimit { .. }));

        // Selling against the short reduces magnitude and passes.
        assert!(limiter.check("872a1070b", dec!(200), &existing).is_ok());

        // Magnitudes accumulate across the group regardless of sign.
        let err = limiter.check("872a1070c", dec!(700), &existing).unwrap_err();
        assert!(matches!(err, EngineError::CorrelatedLimit { .. }));
    }

    #[test]
    fn per_cell_violation_reported_before_correlated() {
        let limiter = PositionLimiter::new(dec!(100), dec!(100), 5);
        let existing = exposures(&[("872a1070b", dec!(100))]);

        // Both caps would be breached; the per-cell error wins.
        let err = limiter
            .check("872a1070b", dec!(50), &existing)
            .unwrap_err();
        assert!(matches!(err, EngineError::PerCellLimit { .. }));
    }

    #[test]
    fn short_cell_id_uses_whole_id_as_prefix() {
        let limiter = PositionLimiter::new(dec!(1000), dec!(1000), 8);
        let existing = exposures(&[("872a", dec!(600))]);

        let err = limiter.check("872a", dec!(500), &existing).unwrap_err();
        assert!(matches!(err, EngineError::PerCellLimit { .. }));
    }
}
