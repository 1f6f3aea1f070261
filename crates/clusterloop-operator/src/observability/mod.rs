//! Observability Module
//!
//! - `metrics`: Prometheus metrics for reconciles, work queues and the resolver
//! - `tracing`: log subscriber setup

pub mod metrics;
pub mod tracing;

pub use self::metrics::{init_metrics, MetricsState};
pub use self::tracing::{init_tracing, TracingConfig};
