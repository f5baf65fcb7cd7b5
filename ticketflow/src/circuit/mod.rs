//! Circuit breakers protecting external dependencies.

mod breaker;
mod registry;

pub use breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use registry::CircuitBreakerRegistry;
