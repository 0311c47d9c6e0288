//! Minor-unit token amounts.
//!
//! Token amounts are integers at the smallest representable unit. With
//! 18-decimal tokens these values exceed 64-bit range, so amounts are
//! `U256` in memory and decimal strings at every storage and wire boundary.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A positive minor-unit amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(U256);

/// Rejections when parsing a decimal amount string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("amount must be a decimal integer string")]
    NotDecimal,
    #[error("amount must be greater than zero")]
    Zero,
    #[error("amount exceeds 256-bit range")]
    Overflow,
}

impl Amount {
    /// Parse a strictly-positive decimal integer string.
    pub fn from_decimal(s: &str) -> Result<Self, AmountParseError> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountParseError::NotDecimal);
        }
        let value = U256::from_str_radix(s, 10).map_err(|_| AmountParseError::Overflow)?;
        if value.is_zero() {
            return Err(AmountParseError::Zero);
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> U256 {
        self.0
    }
}

impl From<U256> for Amount {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::from_decimal(&s).map_err(serde::de::Error::custom)
    }
}

/// Format `credits - debits` as a signed decimal string.
///
/// Ledger sums can legitimately go negative (the clearing bucket mirrors
/// every merchant credit with a debit), so the result carries a sign rather
/// than forcing callers through a signed integer type.
pub fn signed_balance(credits: U256, debits: U256) -> String {
    if credits >= debits {
        (credits - debits).to_string()
    } else {
        format!("-{}", debits - credits)
    }
}
