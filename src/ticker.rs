//! Parser for the `ATMX-{cell}-{type}-{threshold}-{YYYYMMDD}` contract symbol.

use crate::errors::EngineError;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static TICKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ATMX-([0-9a-f]+)-([A-Z]+)-([0-9]+[A-Z]*)-([0-9]{8})$").expect("ticker regex")
});

/// Weather contract categories the engine knows how to price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractType {
    Precip,
    Temp,
    Wind,
    Snow,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Precip => "PRECIP",
            ContractType::Temp => "TEMP",
            ContractType::Wind => "WIND",
            ContractType::Snow => "SNOW",
        }
    }
}

/// Components of a validated contract ticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTicker {
    pub ticker: String,
    pub cell_id: String,
    pub contract_type: ContractType,
    pub threshold: String,
    /// Contract expiry at UTC midnight.
    pub expiry: DateTime<Utc>,
}

/// Parse and validate a contract ticker.
///
/// The cell segment is a lowercase hex identifier from the external spatial
/// index; the engine treats it as opaque beyond that character check.
pub fn parse_ticker(ticker: &str) -> Result<ParsedTicker, EngineError> {
    let caps = TICKER_RE
        .captures(ticker)
        .ok_or_else(|| EngineError::InvalidTicker(ticker.to_string()))?;

    let contract_type = match &caps[2] {
        "PRECIP" => ContractType::Precip,
        "TEMP" => ContractType::Temp,
        "WIND" => ContractType::Wind,
        "SNOW" => ContractType::Snow,
        other => return Err(EngineError::UnsupportedType(other.to_string())),
    };

    let date = NaiveDate::parse_from_str(&caps[4], "%Y%m%d")
        .map_err(|_| EngineError::InvalidTicker(format!("{ticker}: invalid expiry date")))?;
    let expiry = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| EngineError::InvalidTicker(ticker.to_string()))?
        .and_utc();

    Ok(ParsedTicker {
        ticker: ticker.to_string(),
        cell_id: caps[1].to_string(),
        contract_type,
        threshold: caps[3].to_string(),
        expiry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_valid_precip_ticker() {
        let parsed = parse_ticker("ATMX-872a1070b-PRECIP-25MM-20250815").unwrap();
        assert_eq!(parsed.cell_id, "872a1070b");
        assert_eq!(parsed.contract_type, ContractType::Precip);
        assert_eq!(parsed.threshold, "25MM");
        assert_eq!(parsed.expiry, Utc.with_ymd_and_hms(2025, 8, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn parses_all_contract_types() {
        for (token, expected) in [
            ("PRECIP", ContractType::Precip),
            ("TEMP", ContractType::Temp),
            ("WIND", ContractType::Wind),
            ("SNOW", ContractType::Snow),
        ] {
            let ticker = format!("ATMX-872a1070b-{token}-10-20251001");
            assert_eq!(parse_ticker(&ticker).unwrap().contract_type, expected);
        }
    }

    #[test]
    fn rejects_wrong_prefix() {
        let err = parse_ticker("BTC-872a1070b-PRECIP-25MM-20250815").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTicker(_)));
    }

    #[test]
    fn rejects_non_hex_cell() {
        let err = parse_ticker("ATMX-ZZZZ-PRECIP-25MM-20250815").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTicker(_)));
    }

    #[test]
    fn rejects_unknown_contract_type() {
        let err = parse_ticker("ATMX-872a1070b-HAIL-25MM-20250815").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedType(t) if t == "HAIL"));
    }

    #[test]
    fn rejects_malformed_date() {
        let err = parse_ticker("ATMX-872a1070b-PRECIP-25MM-notadate").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTicker(_)));
    }

    #[test]
    fn rejects_impossible_calendar_date() {
        // Feb 30 matches the regex but is not a real date.
        let err = parse_ticker("ATMX-872a1070b-PRECIP-25MM-20250230").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTicker(_)));
    }

    #[test]
    fn rejects_lowercase_threshold_suffix() {
        let err = parse_ticker("ATMX-872a1070b-PRECIP-25mm-20250815").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTicker(_)));
    }
}
