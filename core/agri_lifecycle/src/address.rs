//! # Address
//!
//! Ledger account identities. Addresses are 20-byte accounts written as
//! `0x`-prefixed hex. The ledger treats the hex encoding case-insensitively,
//! so [`Address`] always holds the canonical lower-case form and plain
//! equality is the identity comparison.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of bytes in a ledger account.
pub const ADDRESS_BYTES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must start with 0x: {0:?}")]
    MissingPrefix(String),

    #[error("address must have {expected} hex digits, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("address is not valid hex: {0:?}")]
    NotHex(String),
}

/// A ledger account in canonical lower-case `0x…` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and canonicalise an address. Mixed-case (checksummed) input is
    /// accepted and folded to lower case.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| AddressError::MissingPrefix(trimmed.to_string()))?;

        if digits.len() != ADDRESS_BYTES * 2 {
            return Err(AddressError::BadLength {
                expected: ADDRESS_BYTES * 2,
                actual: digits.len(),
            });
        }
        hex::decode(digits).map_err(|_| AddressError::NotHex(trimmed.to_string()))?;

        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    /// The all-zero account. Ledgers report it for reference fields that were
    /// never assigned.
    pub fn zero() -> Self {
        Self(format!("0x{}", "0".repeat(ADDRESS_BYTES * 2)))
    }

    /// Build an address whose low 8 bytes hold `n`. Handy for fixtures and
    /// local ledgers.
    pub fn from_low_u64(n: u64) -> Self {
        Self(format!("0x{n:040x}"))
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated `0x1234…abcd` form for log lines.
    pub fn short(&self) -> String {
        format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}
