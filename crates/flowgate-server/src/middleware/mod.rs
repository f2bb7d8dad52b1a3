mod rate_limit;

pub use rate_limit::{RateDecision, RateLimiter, rate_limit_middleware};
