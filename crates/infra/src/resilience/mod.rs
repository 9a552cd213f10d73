//! Fault isolation for calls to external dependencies.

pub mod breaker;
pub mod config;
pub mod registry;
pub mod window;

pub use breaker::{BreakerError, BreakerEvent, BreakerStats, CircuitBreaker, CircuitState, Outcome};
pub use config::{BreakerConfig, BreakerConfigError};
pub use registry::{BreakerHealth, BreakerRegistry};
pub use window::{RollingWindow, WindowTotals};
