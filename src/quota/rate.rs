//! Rate definitions.
//!
//! A [`RateLimit`] is one quota rule: at most `limit` grants per window of
//! `unit`, counted under `key`. A [`RateIdent`] is the part of a rule that
//! addresses a counter and is what `flush` and `usage` take.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::window::TimeUnit;
use crate::error::QuotaError;

/// Identifies a counter: a key counted per window of `unit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateIdent {
    /// Limit identification
    pub key: String,
    /// Window length
    pub unit: TimeUnit,
}

impl RateIdent {
    pub fn new(key: impl Into<String>, unit: TimeUnit) -> Self {
        Self {
            key: key.into(),
            unit,
        }
    }
}

/// A quota rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimit {
    /// Limit identification
    pub key: String,
    /// Window length
    pub unit: TimeUnit,
    /// Maximum number of grants per window
    pub limit: u64,
}

impl RateLimit {
    pub fn new(key: impl Into<String>, unit: TimeUnit, limit: u64) -> Self {
        Self {
            key: key.into(),
            unit,
            limit,
        }
    }

    /// The counter this rule is evaluated against.
    pub fn ident(&self) -> RateIdent {
        RateIdent::new(self.key.clone(), self.unit)
    }
}

impl From<&RateLimit> for RateIdent {
    fn from(rate: &RateLimit) -> Self {
        rate.ident()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.key, self.unit, self.limit)
    }
}

/// Parses the compact `key:unit:limit` form used on the command line.
///
/// The key may itself contain colons; unit and limit are taken from the end.
impl FromStr for RateLimit {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let (Some(limit), Some(unit), Some(key)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(QuotaError::Config(format!(
                "expected `key:unit:limit`, got `{}`",
                s
            )));
        };

        let limit = limit
            .parse::<u64>()
            .map_err(|e| QuotaError::Config(format!("invalid limit `{}`: {}", limit, e)))?;

        Ok(Self::new(key, unit.parse()?, limit))
    }
}

impl fmt::Display for RateIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.unit)
    }
}

/// Parses the compact `key:unit` form.
impl FromStr for RateIdent {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, unit) = s
            .rsplit_once(':')
            .ok_or_else(|| QuotaError::Config(format!("expected `key:unit`, got `{}`", s)))?;
        Ok(Self::new(key, unit.parse()?))
    }
}
