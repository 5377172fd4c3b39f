//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::bluetooth::constants::SCAN_MATCH_BUDGET;

static MAC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("MAC pattern is valid")
});

/// Returned when a string is not a `XX:XX:XX:XX:XX:XX` hardware address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid hardware address: {0:?}")]
pub struct InvalidAddress(pub String);

/// Hardware address of the one robot this application talks to.
///
/// Stored upper-cased with `:` separators so comparisons are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Finds the last MAC-looking substring in a platform device id.
    ///
    /// Windows and Linux embed the address in the device id; on macOS the id is
    /// an opaque UUID and this returns `None`.
    pub fn extract_from(device_id: &str) -> Option<Self> {
        MAC_PATTERN
            .find_iter(device_id)
            .last()
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl FromStr for PeerIdentity {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let octets: Vec<&str> = trimmed.split([':', '-']).collect();
        let well_formed = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !well_formed {
            return Err(InvalidAddress(s.to_string()));
        }
        Ok(Self(octets.join(":").to_ascii_uppercase()))
    }
}

impl TryFrom<String> for PeerIdentity {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerIdentity> for String {
    fn from(value: PeerIdentity) -> Self {
        value.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters of one discovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilterSpec {
    pub target: PeerIdentity,
    pub match_budget: usize,
    pub duration: Duration,
}

impl ScanFilterSpec {
    pub fn new(target: PeerIdentity, duration: Duration) -> Self {
        Self {
            target,
            match_budget: SCAN_MATCH_BUDGET,
            duration,
        }
    }

    /// Returns true if the discovered peer is the target
    pub fn matches(&self, peer: &DiscoveredPeer) -> bool {
        peer.address.as_ref() == Some(&self.target)
    }
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Platform-specific unique identifier, used to look the live device handle back up
    pub id: String,
    /// The hardware address, when the platform exposes it
    pub address: Option<PeerIdentity>,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
}

impl DiscoveredPeer {
    pub fn new(id: String, address: Option<PeerIdentity>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id,
            address,
            name,
            rssi,
        }
    }
}

/// One discovery event reported by the radio
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub peer: DiscoveredPeer,
}

/// Connection state of a link session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    ResolvingServices,
    Ready,
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ResolvingServices => "resolving services",
            Self::Ready => "ready",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Identifies one `open` of a link session.
///
/// Every platform callback and every emitted event carries the id of the
/// session it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
