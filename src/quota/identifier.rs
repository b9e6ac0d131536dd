//! Window identifier encoding and parsing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::rate::RateIdent;
use crate::error::{QuotaError, Result};

/// A key that uniquely identifies one counter window.
///
/// Encoded as `<prefix>-<windowStartMillis>-<<key>>`. The application key is
/// wrapped in angle brackets so it may itself contain the `-` delimiter; the
/// prefix may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowIdentifier {
    /// Namespace prefix shared by every counter of one engine
    pub prefix: String,
    /// Window start, in milliseconds since the Unix epoch
    pub window_start: i64,
    /// The rate's key
    pub key: String,
}

impl WindowIdentifier {
    /// Identifier of the window of `ident` that encloses `now`.
    pub fn build(prefix: &str, ident: &RateIdent, now: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.to_string(),
            window_start: ident.unit.window_start(now).timestamp_millis(),
            key: ident.key.clone(),
        }
    }

    /// Parse an encoded identifier.
    pub fn parse(identifier: &str) -> Result<Self> {
        let malformed = || QuotaError::MalformedIdentifier(identifier.to_string());

        let mut parts = identifier.splitn(3, '-');
        let (Some(prefix), Some(timestamp), Some(wrapped)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let window_start: i64 = timestamp.parse().map_err(|_| malformed())?;

        let key = wrapped
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(malformed)?;

        Ok(Self {
            prefix: prefix.to_string(),
            window_start,
            key: key.to_string(),
        })
    }

    /// Window start as an instant.
    pub fn window_start_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.window_start).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The identifier without its prefix, for stores that scope records by
    /// a separate namespace field.
    pub fn scoped_key(&self) -> String {
        format!("{}-<{}>", self.window_start, self.key)
    }
}

impl fmt::Display for WindowIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-<{}>", self.prefix, self.window_start, self.key)
    }
}

impl FromStr for WindowIdentifier {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
