//! Node configuration.

use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Single budget for dialing plus completing the handshake; expiry
    /// fails and closes the connection.
    pub connect_timeout: Duration,

    /// Largest request/response body carried in one frame before the
    /// pattern engines fall back to head + continuation chunks. Must leave
    /// room for the message envelope inside the 64 KiB frame limit.
    pub max_chunk: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            max_chunk: 32 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::MAX_FRAME_PAYLOAD;

    #[test]
    fn default_chunk_fits_a_frame_with_envelope_overhead() {
        let config = NodeConfig::default();
        assert!(config.max_chunk * 2 <= MAX_FRAME_PAYLOAD);
    }
}
