//! Peer identities and multiaddrs
//!
//! Peers are addressed by `/ip4/<host>/tcp/<port>` or `/dns4/<host>/tcp/
//! <port>` multiaddrs, optionally suffixed with `/p2p/<peer-id>`. Peer ids
//! are the base58 form of an ed25519 public key; when present in the
//! address, the id claimed in the peer's `Hello` must match it.

use std::fmt;

use ed25519_dalek::VerifyingKey;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AddrError {
    #[error("malformed multiaddr '{0}'")]
    BadFormat(String),

    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("invalid port '{0}'")]
    BadPort(String),

    #[error("invalid peer id '{0}'")]
    BadPeerId(String),
}

/// Base58 form of an ed25519 public key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(bs58::encode(key.as_bytes()).into_string())
    }

    pub fn parse(text: &str) -> Result<Self, AddrError> {
        let decoded =
            bs58::decode(text).into_vec().map_err(|_| AddrError::BadPeerId(text.to_string()))?;
        if decoded.len() != 32 {
            return Err(AddrError::BadPeerId(text.to_string()));
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostProto {
    Ip4,
    Dns4,
}

/// A peer network address plus its expected identity, if known
#[derive(Clone, Debug, PartialEq)]
pub struct PeerAddr {
    pub proto: HostProto,
    pub host: String,
    pub port: u16,
    pub peer_id: Option<PeerId>,
}

impl PeerAddr {
    pub fn parse(text: &str) -> Result<Self, AddrError> {
        let parts: Vec<&str> = text.split('/').collect();
        // leading '/' yields an empty first element
        if parts.len() < 5 || !parts[0].is_empty() {
            return Err(AddrError::BadFormat(text.to_string()));
        }

        let proto = match parts[1] {
            "ip4" => HostProto::Ip4,
            "dns4" => HostProto::Dns4,
            other => return Err(AddrError::UnsupportedProtocol(other.to_string())),
        };
        if parts[3] != "tcp" {
            return Err(AddrError::UnsupportedProtocol(parts[3].to_string()));
        }
        let port = parts[4].parse::<u16>().map_err(|_| AddrError::BadPort(parts[4].to_string()))?;

        let peer_id = match parts.get(5..) {
            None | Some([]) => None,
            Some(["p2p", id]) => Some(PeerId::parse(id)?),
            Some(_) => return Err(AddrError::BadFormat(text.to_string())),
        };

        Ok(Self {
            proto,
            host: parts[2].to_string(),
            port,
            peer_id,
        })
    }

    /// The host:port endpoint to dial
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            HostProto::Ip4 => "ip4",
            HostProto::Dns4 => "dns4",
        };
        write!(f, "/{}/{}/tcp/{}", proto, self.host, self.port)?;
        if let Some(id) = &self.peer_id {
            write!(f, "/p2p/{id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn parses_plain_address() {
        let addr = PeerAddr::parse("/ip4/45.32.243.35/tcp/4001").unwrap();
        assert_eq!(addr.proto, HostProto::Ip4);
        assert_eq!(addr.endpoint(), "45.32.243.35:4001");
        assert!(addr.peer_id.is_none());
    }

    #[test]
    fn parses_address_with_peer_id() {
        let key = SigningKey::generate(&mut OsRng);
        let id = PeerId::from_public_key(&key.verifying_key());
        let text = format!("/dns4/peer.example.org/tcp/4001/p2p/{id}");
        let addr = PeerAddr::parse(&text).unwrap();
        assert_eq!(addr.proto, HostProto::Dns4);
        assert_eq!(addr.peer_id, Some(id));
        assert_eq!(addr.to_string(), text);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(
            PeerAddr::parse("45.32.243.35:4001").unwrap_err(),
            AddrError::BadFormat(_)
        ));
        assert!(matches!(
            PeerAddr::parse("/udp/1.2.3.4/tcp/4001").unwrap_err(),
            AddrError::UnsupportedProtocol(_)
        ));
        assert!(matches!(
            PeerAddr::parse("/ip4/1.2.3.4/tcp/hello").unwrap_err(),
            AddrError::BadPort(_)
        ));
        assert!(matches!(
            PeerAddr::parse("/ip4/1.2.3.4/tcp/4001/p2p/!!!").unwrap_err(),
            AddrError::BadPeerId(_)
        ));
    }
}
