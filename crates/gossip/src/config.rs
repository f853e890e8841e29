//! Transport configuration.

use core::time::Duration;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FANOUT: usize = 3;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct GossipConfig {
    /// Address to bind; port 0 picks an ephemeral port.
    pub listen: SocketAddr,

    /// Peers contacted on startup to join the mesh.
    #[serde(default)]
    pub bootstrap: Vec<SocketAddr>,

    /// Random peers addressed per broadcast.
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    #[serde(
        rename = "heartbeat_interval_ms",
        with = "serde_duration",
        default = "default_heartbeat"
    )]
    pub heartbeat_interval: Duration,

    /// Missed heartbeat windows before a peer is declared failed.
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,
}

impl GossipConfig {
    #[must_use]
    pub fn new(listen: SocketAddr, bootstrap: Vec<SocketAddr>) -> Self {
        Self {
            listen,
            bootstrap,
            fanout: DEFAULT_FANOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:0".parse().expect("valid address"), Vec::new())
    }
}

const fn default_fanout() -> usize {
    DEFAULT_FANOUT
}

const fn default_heartbeat() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

const fn default_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
