use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::bail;

use crate::handshake::ClusterOption;
use crate::packet::control_value::ControlValue;

pub struct TransportConfig {
    /// Interval of keep-alive pings once the connection reached a run state. A failed ping is
    ///  logged but does not close the connection: liveness is determined on the read side.
    pub ping_delay: Duration,

    /// The handshake is re-sent after this interval until a response arrives
    pub handshake_retry_interval: Duration,
    /// Upper bound for handshake attempts. After that, the connection stays in
    ///  `RunWithoutHandshake`.
    pub max_handshake_count: u32,

    /// default deadline for correlated requests
    pub request_timeout: Duration,
    /// How long `send_sync` and `ping_sync` wait for their write. A write that takes longer is not
    ///  cancelled, and the connection stays up.
    pub write_timeout: Duration,
    /// how long a client-initiated close waits for the close notification to be written
    pub close_packet_timeout: Duration,
    pub connect_timeout: Duration,

    /// Frames announcing a length beyond this are treated as a corrupted byte stream and close
    ///  the connection.
    pub max_packet_len: usize,
    pub read_buffer_size: usize,

    /// sent as part of the handshake, e.g. agent id and application name
    pub properties: BTreeMap<String, ControlValue>,
    pub cluster_option: ClusterOption,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            ping_delay: Duration::from_secs(5 * 60),
            handshake_retry_interval: Duration::from_secs(60),
            max_handshake_count: u32::MAX,
            request_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            close_packet_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            max_packet_len: 16*1024*1024,
            read_buffer_size: 64*1024,
            properties: BTreeMap::default(),
            cluster_option: ClusterOption::disabled(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_delay.is_zero() {
            bail!("ping delay must be positive");
        }
        if self.handshake_retry_interval.is_zero() {
            bail!("handshake retry interval must be positive");
        }
        if self.max_handshake_count == 0 {
            bail!("at least one handshake attempt is required");
        }
        if self.request_timeout.is_zero() || self.write_timeout.is_zero() {
            bail!("request and write timeouts must be positive");
        }
        if self.max_packet_len < 1024 {
            bail!("max packet length of {} bytes is too small", self.max_packet_len);
        }
        if self.read_buffer_size == 0 {
            bail!("read buffer size must be positive");
        }
        if self.properties.contains_key(crate::handshake::KEY_SOCKET_ID) || self.properties.contains_key(crate::handshake::KEY_CLUSTER) {
            bail!("handshake properties must not contain the reserved keys '{}' or '{}'", crate::handshake::KEY_SOCKET_ID, crate::handshake::KEY_CLUSTER);
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}


pub struct RetryQueueConfig {
    pub capacity: usize,
    /// messages that were retried this many times are discarded
    pub max_retry_count: u32,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        RetryQueueConfig {
            capacity: 1024,
            max_retry_count: 3,
        }
    }
}


pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// growth factor between attempts in eighths, i.e. 16 doubles the delay. Must be at least 8.
    pub factor_eighths: u32,
}

impl ReconnectConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.factor_eighths < 8 {
            bail!("reconnect backoff factor must not shrink the delay: {}/8", self.factor_eighths);
        }
        if self.max_delay < self.initial_delay {
            bail!("max reconnect delay {:?} is below the initial delay {:?}", self.max_delay, self.initial_delay);
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor_eighths: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_is_valid() {
        TransportConfig::default().validate().unwrap();
        ReconnectConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::zero_ping(|c: &mut TransportConfig| c.ping_delay = Duration::ZERO)]
    #[case::zero_handshake_count(|c: &mut TransportConfig| c.max_handshake_count = 0)]
    #[case::zero_request_timeout(|c: &mut TransportConfig| c.request_timeout = Duration::ZERO)]
    #[case::tiny_packets(|c: &mut TransportConfig| c.max_packet_len = 10)]
    #[case::reserved_socket_id(|c: &mut TransportConfig| { c.properties.insert("socketId".to_string(), ControlValue::Int(1)); })]
    #[case::reserved_cluster(|c: &mut TransportConfig| { c.properties.insert("cluster".to_string(), ControlValue::Null); })]
    fn test_invalid(#[case] f: fn(&mut TransportConfig)) {
        let mut config = TransportConfig::default();
        f(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::shrinking(7, 100, 200)]
    #[case::max_below_initial(16, 200, 100)]
    fn test_invalid_reconnect(#[case] factor_eighths: u32, #[case] initial_millis: u64, #[case] max_millis: u64) {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(initial_millis),
            max_delay: Duration::from_millis(max_millis),
            factor_eighths,
        };
        assert!(config.validate().is_err());
    }
}
