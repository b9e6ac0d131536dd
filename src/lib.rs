//! Quotaflow - Distributed Quota Grants
//!
//! This crate decides, all-or-nothing across any number of named limits,
//! whether a unit of work may proceed. Counters live in a shared store as
//! one record per time window and expire with it; a rejected call rolls back
//! every increment it made and reports when the violated window ends.

pub mod clock;
pub mod config;
pub mod error;
pub mod quota;
pub mod store;

pub use error::{QuotaError, Result};
pub use quota::{GrantOutcome, Quota, RateIdent, RateLimit, TimeUnit, WindowIdentifier};
