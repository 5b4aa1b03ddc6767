//! # Timeouts
//!
//! Default durations shared by the server, client and bridge, plus async
//! wrappers that turn an elapsed deadline into [`ProtocolError::Timeout`].

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Read timeout for an idle connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on close-and-wait shutdown of a server or client
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay before a dropped bridge link is redialed
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Keep-alive pings go out at this fraction of the read timeout so a healthy
/// peer never trips its own read deadline
pub const KEEPALIVE_RATIO: f64 = 0.8;

/// Keep-alive interval derived from a read timeout
pub fn keepalive_interval(read_timeout: Duration) -> Duration {
    read_timeout.mul_f64(KEEPALIVE_RATIO)
}

/// Await `fut`, failing with [`ProtocolError::Timeout`] once `duration` elapses
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

/// Like [`with_timeout`] for futures that already return a protocol result
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(fut, duration).await?
}
