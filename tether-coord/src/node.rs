use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The single overlay address every agent announced before nodes became
/// multi-homed. An agent whose primary address still matches it must be
/// reached over the fallback transport.
pub const LEGACY_AGENT_IP: IpAddr = IpAddr::V6(Ipv6Addr::new(
    0xfd7a, 0x115c, 0xa1e0, 0x49d6, 0xb259, 0xb7ac, 0xb1b2, 0x48f4,
));

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("invalid key encoding: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// A peer's public key. Carried opaquely; the coordinator never uses it
/// for anything but forwarding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub [u8; 32]);

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf)?;

        Ok(Self(buf))
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(D::Error::custom)
    }
}

/// A peer's current reachability, as produced by the tailnet library.
///
/// The coordinator stores and forwards nodes without interpreting them,
/// save for the sequence number and the legacy address check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Sequence number assigned by the announcing peer. Strictly increasing
    /// within one connection of that peer.
    pub seq: u64,
    /// The peer's public key.
    pub key: Key,
    /// Overlay addresses assigned to the peer.
    pub addresses: Vec<IpAddr>,
    /// Candidate UDP endpoints for direct connections.
    pub endpoints: Vec<SocketAddr>,
    /// Home DERP region to relay through when no endpoint works.
    pub preferred_derp: u16,
}

impl Node {
    /// The peer's primary overlay address, if it announced any.
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses.first().copied()
    }

    /// Whether this node pre-dates multi-homing and requires the legacy
    /// per-agent transport.
    pub fn is_legacy(&self) -> bool {
        self.primary_address() == Some(LEGACY_AGENT_IP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(addresses: Vec<IpAddr>) -> Node {
        Node {
            seq: 1,
            key: Key([7; 32]),
            addresses,
            endpoints: vec![],
            preferred_derp: 0,
        }
    }

    #[test]
    fn test_legacy_address() {
        assert!(node(vec![LEGACY_AGENT_IP]).is_legacy());
        assert!(node(vec![LEGACY_AGENT_IP, "10.0.0.1".parse().unwrap()]).is_legacy());
        assert!(!node(vec!["10.0.0.1".parse().unwrap(), LEGACY_AGENT_IP]).is_legacy());
        assert!(!node(vec![]).is_legacy());
    }

    #[test]
    fn test_key_encoding() {
        let key = Key([0xab; 32]);
        let json = serde_json::to_string(&key).unwrap();

        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        assert_eq!(serde_json::from_str::<Key>(&json).unwrap(), key);
    }

    #[test]
    fn test_node_json_roundtrip() {
        let n = Node {
            seq: 42,
            key: Key([1; 32]),
            addresses: vec![LEGACY_AGENT_IP],
            endpoints: vec!["192.168.1.1:41641".parse().unwrap()],
            preferred_derp: 9,
        };
        let json = serde_json::to_vec(&n).unwrap();

        assert_eq!(serde_json::from_slice::<Node>(&json).unwrap(), n);
    }
}
