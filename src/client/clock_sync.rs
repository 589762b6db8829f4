//! One-shot clock offset estimate between client and server.

use chrono::Utc;
use tracing::{debug, warn};

use super::ddp_client::DdpClient;
use super::errors::{ClientError, ClientResult};

/// Offsets beyond this are assumed to be measurement noise
pub const MAX_BELIEVABLE_OFFSET_MS: f64 = 5000.0;

/// Estimate `server clock - client clock` in milliseconds
///
/// `method` must return the server's time as epoch milliseconds. The
/// estimate assumes a symmetric round trip; an offset above
/// `MAX_BELIEVABLE_OFFSET_MS` in magnitude yields 0.
pub async fn discover_clock_offset(client: &DdpClient, method: &str) -> ClientResult<f64> {
    let sent_at = Utc::now().timestamp_millis();
    let reply = client.call_method(method, Vec::new()).await?;
    let received_at = Utc::now().timestamp_millis();

    let server_time = reply.as_f64().ok_or_else(|| {
        ClientError::Protocol(format!("{} returned a non-numeric time: {}", method, reply))
    })?;
    Ok(estimate_offset(sent_at, server_time, received_at))
}

fn estimate_offset(sent_at: i64, server_time: f64, received_at: i64) -> f64 {
    let rtt = (received_at - sent_at) as f64;
    let offset = server_time - (sent_at as f64 + rtt / 2.0);
    debug!(sent_at, server_time, received_at, rtt, offset, "clock offset measured");

    if offset.abs() > MAX_BELIEVABLE_OFFSET_MS {
        warn!(offset, "clock offset unbelievable, ignoring");
        return 0.0;
    }
    offset
}
