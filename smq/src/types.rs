use std::fmt;
use std::str::FromStr;

use crate::error::SmqError;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashSet<V> = std::collections::HashSet<V, ahash::RandomState>;

/// Connection serial number, also the multiplexer token of its stream
pub type ConnectionId = usize;
pub type ClientId = bytestring::ByteString;
/// Topic or queue name
pub type Destination = bytestring::ByteString;
pub type MessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationType {
    /// Every member receives every message
    Topic,
    /// Each message goes to one member, round-robin
    Queue,
}

impl FromStr for DestinationType {
    type Err = SmqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "topic" => Ok(DestinationType::Topic),
            "queue" => Ok(DestinationType::Queue),
            other => Err(SmqError::Protocol(format!("unknown destination type {other:?}"))),
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Topic => f.write_str("topic"),
            DestinationType::Queue => f.write_str("queue"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    /// Fire and forget, the store entry is dropped right after delivery
    AtMostOnce = 0,
    /// Kept in the store until acknowledged or expired
    AtLeastOnce = 1,
}

impl FromStr for QoS {
    type Err = SmqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(QoS::AtMostOnce),
            "1" => Ok(QoS::AtLeastOnce),
            other => Err(SmqError::Protocol(format!("unsupported qos {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_destination_type() {
        assert_eq!("Queue".parse::<DestinationType>().unwrap(), DestinationType::Queue);
        assert_eq!(" topic ".parse::<DestinationType>().unwrap(), DestinationType::Topic);
        assert!("fanout".parse::<DestinationType>().is_err());
    }

    #[test]
    fn parse_qos() {
        assert_eq!("1".parse::<QoS>().unwrap(), QoS::AtLeastOnce);
        assert!(QoS::AtLeastOnce > QoS::AtMostOnce);
        assert!("2".parse::<QoS>().is_err());
    }
}
