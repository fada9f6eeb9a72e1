//! TCP reachability probe run before any pool handshake.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{AcquireError, AcquireResult, Stage};

/// Dial `host:port` once and drop the socket.
///
/// Succeeds if a TCP connection is established within `timeout`. There are
/// no retries; the caller owns the retry policy.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> AcquireResult<()> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            tracing::debug!(%host, port, "tcp probe succeeded");
            Ok(())
        }
        Ok(Err(source)) => {
            tracing::warn!(%host, port, error = %source, "tcp probe failed");
            Err(AcquireError::Connectivity {
                host: host.to_string(),
                port,
                source,
            })
        }
        Err(_) => {
            tracing::warn!(%host, port, ?timeout, "tcp probe timed out");
            Err(AcquireError::Timeout {
                stage: Stage::Probe,
                host: host.to_string(),
                port,
                after: timeout,
            })
        }
    }
}
