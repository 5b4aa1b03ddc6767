//! Wall-clock helpers for expiry checks and ping round-trip measurement.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::constants::ERR_SYSTEM_TIME;
use crate::error::{ProtocolError, Result};

/// Milliseconds since the Unix epoch
pub fn current_timestamp_millis() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(ERR_SYSTEM_TIME.to_string()))
}

/// Microseconds since the Unix epoch
pub fn current_timestamp_micros() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .map_err(|_| ProtocolError::Custom(ERR_SYSTEM_TIME.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_units_agree() {
        let millis = current_timestamp_millis().unwrap();
        let micros = current_timestamp_micros().unwrap();
        assert!(micros / 1000 >= millis);
        assert!(micros / 1000 - millis < 1000);
    }
}
