//! Identifier types shared by the reactor, the correlator and the runners

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Unique identifier assigned to every decoded message before it is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random message id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Connection Key
// ----------------------------------------------------------------------------

/// Identity of one accepted connection
///
/// Many clients share one listening port, so the key pairs the local port
/// with the remote address. The remote port disambiguates clients on the
/// same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl ConnectionKey {
    pub fn new(local_port: u16, remote: SocketAddr) -> Self {
        Self {
            local_port,
            remote_ip: remote.ip(),
            remote_port: remote.port(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_ip, self.remote_port)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<-{}", self.local_port, self.remote_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("urn:uuid:"));
    }

    #[test]
    fn test_connection_key_distinguishes_remote_ports() {
        let k1 = ConnectionKey::new(2575, "127.0.0.1:40001".parse().unwrap());
        let k2 = ConnectionKey::new(2575, "127.0.0.1:40002".parse().unwrap());
        assert_ne!(k1, k2);
        assert_eq!(k1.remote_addr().port(), 40001);
        assert_eq!(k1.to_string(), "2575<-127.0.0.1:40001");
    }
}
