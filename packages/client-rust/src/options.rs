//! Client configuration.

use std::time::Duration;

/// Tunable client behavior. [`ClientOptions::default`] matches the values
/// the hosted service is provisioned for; most deployments only override
/// the URL path and heartbeat.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Period of outbound PINGs and of the staleness check.
    pub heartbeat_interval: Duration,
    /// Multiple of `heartbeat_interval` after which a silent connection is
    /// considered dead. Must be at least 2.
    pub heartbeat_tolerance_factor: u32,
    /// Linear backoff step between reconnect attempts.
    pub reconnect_interval_increment: Duration,
    /// Cap on the reconnect backoff delay.
    pub max_reconnect_interval: Duration,
    /// Reconnection is abandoned after this many failed attempts.
    pub max_reconnect_attempts: u32,
    /// Outbound frames conflated into a single transport write.
    pub max_messages_per_packet: usize,
    /// How long an outbound frame may wait for companions before the
    /// buffer is flushed.
    pub send_delay: Duration,
    /// Default URL path appended to host-only endpoint URLs.
    pub path: String,
    /// Period of the record registry's idle-record pruning scan.
    pub prune_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_tolerance_factor: 2,
            reconnect_interval_increment: Duration::from_secs(4),
            max_reconnect_interval: Duration::from_secs(180),
            max_reconnect_attempts: 5,
            max_messages_per_packet: 100,
            send_delay: Duration::from_millis(16),
            path: "/sync".to_owned(),
            prune_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(options.heartbeat_tolerance_factor, 2);
        assert_eq!(options.reconnect_interval_increment, Duration::from_secs(4));
        assert_eq!(options.max_reconnect_interval, Duration::from_secs(180));
        assert_eq!(options.max_reconnect_attempts, 5);
        assert_eq!(options.max_messages_per_packet, 100);
        assert_eq!(options.send_delay, Duration::from_millis(16));
        assert_eq!(options.path, "/sync");
        assert_eq!(options.prune_interval, Duration::from_secs(10));
    }
}
