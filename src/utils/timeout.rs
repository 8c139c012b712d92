//! Timeout constants and async timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default deadline for tracked requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for establishing an outbound TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default grace period for links to close during server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `fut` for at most `duration`, mapping expiry to `LinkTimeout`.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::LinkTimeout),
    }
}
