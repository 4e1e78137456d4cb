//! Session and transport configuration.

use crate::matcher::{EndpointMatcher, KeepaliveAddressMatcher};
use crate::queue::DEFAULT_MTU;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by a session and the transports it creates
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Largest single message, for socket reads/writes and queue items
    pub mtu: usize,
    /// Pause between worker iterations
    pub tick_interval: Duration,
    /// Interval between UDP keepalives
    pub keepalive_interval: Duration,
    /// Silence after which a UDP peer is disconnected
    pub keepalive_timeout: Duration,
    /// How the UDP listener maps datagrams to nodes
    pub endpoint_matcher: Arc<dyn EndpointMatcher>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            tick_interval: Duration::from_millis(5),
            keepalive_interval: Duration::from_secs(2),
            keepalive_timeout: Duration::from_secs(10),
            endpoint_matcher: Arc::new(KeepaliveAddressMatcher),
        }
    }
}
