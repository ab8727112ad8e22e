//! Rate limiting decisions.

mod identity;
mod limiter;

pub use identity::{normalize_address, ClientIdentity, LimitClass, UNKNOWN_CLIENT};
pub use limiter::{Decision, LimitConfig, RateLimiter};
