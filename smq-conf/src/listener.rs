use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use smq_utils::{deserialize_addr, deserialize_duration, Bytesize};

/// `[listener]` section
#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    #[serde(default = "Listener::name_default")]
    pub name: String,
    #[serde(default = "Listener::addr_default", deserialize_with = "deserialize_addr")]
    pub addr: SocketAddr,
    #[serde(default = "Listener::backlog_default")]
    pub backlog: i32,
    #[serde(default)]
    pub nodelay: bool,
    #[serde(default = "Listener::reuseaddr_default")]
    pub reuseaddr: bool,
    #[serde(default)]
    pub reuseport: bool,
    /// 0 means unlimited
    #[serde(default)]
    pub max_connections: usize,
    /// Largest accepted header block or body, 0 means unlimited
    #[serde(default = "Listener::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default = "Listener::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            name: Self::name_default(),
            addr: Self::addr_default(),
            backlog: Self::backlog_default(),
            nodelay: false,
            reuseaddr: Self::reuseaddr_default(),
            reuseport: false,
            max_connections: 0,
            max_packet_size: Self::max_packet_size_default(),
            send_timeout: Self::send_timeout_default(),
        }
    }
}

impl Listener {
    fn name_default() -> String {
        "external/tcp".into()
    }
    fn addr_default() -> SocketAddr {
        ([0, 0, 0, 0], 4000).into()
    }
    fn backlog_default() -> i32 {
        512
    }
    fn reuseaddr_default() -> bool {
        true
    }
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn send_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
}
