//! Utilities shared by the SMQ broker crates
//!
//! ## Core Features:
//! - **Byte Size Handling**: Human-readable byte size parsing/formatting with [`Bytesize`]
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Timestamp Utilities**: Millisecond timestamps used for message expiry
//! - **Timed Locking**: Bounded-wait acquisition of reader/writer locks ([`lock`])
//!
//! ## Usage Examples:
//! ```rust
//! use smq_utils::{Bytesize, to_bytesize, to_duration};
//!
//! let size = Bytesize::from("1M512K");
//! assert_eq!(size.as_usize(), 1_572_864);
//!
//! let duration = to_duration("1m30s");
//! assert_eq!(duration.as_secs(), 90);
//!
//! let poll = to_duration("100ms");
//! assert_eq!(poll.as_millis(), 100);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize, Serialize,
};

pub mod lock;

pub use lock::{read_for, write_for, LockTimeout};

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Human-readable byte size representation with parsing/serialization support
///
/// # Example:
/// ```
/// use smq_utils::Bytesize;
///
/// let size = Bytesize::from("2M");
/// assert_eq!(size.as_u32(), 2_097_152);
/// assert_eq!(Bytesize::from(1024).string(), "1K");
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    /// Convert to u32, saturating at `u32::MAX`
    #[inline]
    pub fn as_u32(&self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Format bytesize to human-readable string
    ///
    /// # Example:
    /// ```
    /// let mixed = smq_utils::Bytesize(2148532224);
    /// assert_eq!(mixed.string(), "2G1M");
    /// ```
    #[inline]
    pub fn string(&self) -> String {
        let mut v = self.0;
        let mut res = String::new();

        for (unit, size) in [('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K)] {
            let n = v / size;
            if n > 0 {
                res.push_str(&format!("{}{}", n, unit));
                v %= size;
            }
        }

        if v > 0 || res.is_empty() {
            res.push_str(&format!("{}B", v));
        }

        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = to_bytesize(&String::deserialize(deserializer)?);
        Ok(Bytesize(v))
    }
}

/// Parse human-readable byte size string to usize
///
/// A bare number is taken as bytes.
///
/// # Example:
/// ```
/// assert_eq!(smq_utils::to_bytesize("2G512K"), 2148007936);
/// assert_eq!(smq_utils::to_bytesize("4096"), 4096);
/// ```
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    if let Ok(v) = text.parse::<usize>() {
        return v;
    }
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<usize>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
///
/// # Example:
/// ```
/// let duration = smq_utils::to_duration("1h30m15s");
/// assert_eq!(duration.as_secs(), 5415);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Deserialize SocketAddr with error handling
#[inline]
pub fn deserialize_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    let addr = String::deserialize(deserializer)?.parse::<SocketAddr>().map_err(de::Error::custom)?;
    Ok(addr)
}

/// Current timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Local::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytesize() {
        assert_eq!(to_bytesize("1M"), 1048576);
        assert_eq!(to_bytesize("1mb"), 1048576);
        assert_eq!(to_bytesize("512"), 512);
        assert_eq!(to_bytesize("2K10B"), 2058);
        assert_eq!(to_bytesize("abc"), 0);
        assert_eq!(Bytesize(0).string(), "0B");
        assert_eq!(Bytesize(1048576 + 1024).string(), "1M1K");
        assert_eq!(Bytesize(usize::MAX).as_u32(), u32::MAX);
    }

    #[test]
    fn duration() {
        assert_eq!(to_duration("100ms"), Duration::from_millis(100));
        assert_eq!(to_duration("5m"), Duration::from_secs(300));
        assert_eq!(to_duration("1d1s"), Duration::from_secs(86401));
        assert_eq!(to_duration(""), Duration::ZERO);
    }

    #[test]
    fn timestamp() {
        let a = timestamp_millis();
        std::thread::sleep(Duration::from_millis(2));
        assert!(timestamp_millis() > a);
    }
}
