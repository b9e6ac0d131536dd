//! Quota grants over time-windowed counters.

mod backend;
mod engine;
mod identifier;
mod rate;
mod window;

pub use backend::{CounterBackend, CounterSlot};
pub use engine::{GrantOutcome, Quota};
pub use identifier::WindowIdentifier;
pub use rate::{RateIdent, RateLimit};
pub use window::TimeUnit;
