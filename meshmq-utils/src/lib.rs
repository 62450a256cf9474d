//! Small helpers shared by the meshmq crates.
//!
//! - [`Counter`]: current/peak gauge used by broker statistics
//! - duration strings such as `"1h30m15s"` or `"500ms"` via [`to_duration`] and the
//!   serde helper [`deserialize_duration`]
//! - millisecond timestamps and their formatting
//! - [`NodeAddr`], the `id@host:port` notation used to describe cluster peers
//!
//! ```
//! use meshmq_utils::{to_duration, NodeAddr};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//!
//! let node: NodeAddr = "2@10.0.0.2:5363".parse().unwrap();
//! assert_eq!(node.id, 2);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Error};
use bytestring::ByteString;
use serde::{
    de::{self, Deserializer},
    Deserialize, Serialize,
};

mod counter;

pub use counter::Counter;

/// Cluster node identifier
pub type NodeId = u64;

/// Network address in `host:port` form
pub type Addr = ByteString;

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

/// Parses a compound duration string.
///
/// Supported units are `ms`, `s`, `m`, `h`, `d` and `w`; segments are summed, unknown
/// or malformed segments count as zero.
///
/// ```
/// use meshmq_utils::to_duration;
/// assert_eq!(to_duration("2m").as_secs(), 120);
/// assert_eq!(to_duration("1s500ms").as_millis(), 1500);
/// ```
pub fn to_duration(text: &str) -> Duration {
    // `ms` is folded into a single marker so it does not split as `m` + `s`
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let millis: u64 = text
        .split_inclusive(['Y', 's', 'm', 'h', 'd', 'w'])
        .map(|seg| {
            let mut chars = seg.chars();
            let unit = match chars.next_back() {
                Some(u) => u,
                None => return 0,
            };
            let value = match chars.as_str().trim().parse::<u64>() {
                Ok(v) => v,
                Err(_) => return 0,
            };
            match unit {
                'Y' => value,
                's' => value * 1_000,
                'm' => value * 60_000,
                'h' => value * 3_600_000,
                'd' => value * 86_400_000,
                'w' => value * 604_800_000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(millis)
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Formats a millisecond timestamp in local time, `""` for non-positive values.
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    use chrono::TimeZone;
    if t <= 0 {
        return String::new();
    }
    match chrono::Local.timestamp_millis_opt(t) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        _ => String::new(),
    }
}

/// A cluster peer, written as `id@host:port`.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct NodeAddr {
    pub id: NodeId,
    pub addr: Addr,
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

impl FromStr for NodeAddr {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s.split_once('@').ok_or_else(|| anyhow!("NodeAddr format error, {}", s))?;
        if addr.is_empty() {
            return Err(anyhow!("NodeAddr address is empty, {}", s));
        }
        let id = NodeId::from_str(id.trim()).map_err(|e| anyhow!("NodeAddr id error, {}, {:?}", s, e))?;
        Ok(NodeAddr { id, addr: Addr::from(addr.trim()) })
    }
}

impl<'de> de::Deserialize<'de> for NodeAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        NodeAddr::from_str(&String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}
