//! Load balancer: backend pool, circuit breaking, proxying and autoscaling

pub mod autoscale;
pub mod breaker;
pub mod pool;
pub mod proxy;

pub use autoscale::{AutoscalePolicy, Autoscaler, BackendLauncher, LaunchSettings};
pub use breaker::{BreakerPolicy, BreakerState, CircuitBreaker};
pub use pool::{BackendLease, BackendPool, PoolError, PoolSettings};
pub use proxy::{ProxyError, ProxySession};
