//! # Utility Modules
//!
//! Supporting utilities for logging, timing and observability.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Default deadlines and async timeout wrappers
//! - **Metrics**: Thread-safe link counters

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{LinkMetrics, MetricsSnapshot};
