use tokio::net::TcpListener;

use super::HarnessError;

/// Probe ports upward from `start`, returning the first one that can be bound on
/// loopback. The probe listener is released before returning.
pub async fn find_open_port(start: u16, attempts: u32) -> Result<u16, HarnessError> {
    for offset in 0..attempts {
        let Some(port) = u16::try_from(offset).ok().and_then(|o| start.checked_add(o)) else {
            break;
        };
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(err) => tracing::debug!(port, error = %err, "port unavailable"),
        }
    }
    Err(HarnessError::NoPort { start, attempts })
}
