use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a peer on the network.
///
/// The empty identity is reserved: it never names a remote peer and callers
/// use it to mean "this process".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The empty identity
    pub fn local() -> Self {
        Self::default()
    }

    pub fn is_local(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<local>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Protocol identifier a stream is opened under (e.g. `"rpc"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ProtocolId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_peer_is_empty() {
        assert!(PeerId::local().is_local());
        assert!(PeerId::default().is_local());
        assert!(!PeerId::from("QmPeer").is_local());
        assert_eq!(PeerId::local().to_string(), "<local>");
    }

    #[test]
    fn test_random_peers_differ() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert!(!a.is_local());
    }

    #[test]
    fn test_peer_id_serializes_as_string() {
        let json = serde_json::to_string(&PeerId::from("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
        let protocol: ProtocolId = serde_json::from_str("\"rpc\"").unwrap();
        assert_eq!(protocol.as_str(), "rpc");
    }
}
