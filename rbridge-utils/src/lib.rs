//! Small helpers shared by the rbridge crates.
//!
//! - [`Bytesize`]: "1M", "512K" or "2G512M" style sizes, usable directly in configuration files
//! - duration strings such as "30s" or "1h30m" via [`to_duration`] and [`deserialize_duration`]
//! - socket address deserializers for listener settings
//! - [`Counter`], a current/max gauge used for store and connection statistics
//!
//! ```
//! use rbridge_utils::{to_bytesize, to_duration, Bytesize};
//!
//! assert_eq!(Bytesize::from("1M").as_usize(), 1_048_576);
//! assert_eq!(to_bytesize("2K"), 2048);
//! assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
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

mod counter;

pub use counter::Counter;

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u32(&self) -> u32 {
        self.0.min(u32::MAX as usize) as u32
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Human readable form, `Bytesize(2148532224).string() == "2G1M"`.
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
        f.write_str(&self.string())
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
        Ok(Bytesize(to_bytesize(&String::deserialize(deserializer)?)))
    }
}

/// Parses "1G500M256K1024B" style text. Unknown units count as zero.
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let x = x.trim();
            //a bare number without unit, e.g. "4096"
            if let Ok(v) = x.parse::<usize>() {
                return v;
            }
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<usize>() {
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

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Converts "2w3d12h", "1h30m15s" or "500ms" into a [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`.
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

#[inline]
pub fn deserialize_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    let addr = String::deserialize(deserializer)?.parse::<SocketAddr>().map_err(de::Error::custom)?;
    Ok(addr)
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}
