/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::mesh::SessionConfig;
use crate::nat_traversal::hole_punching::PunchConfig;
use crate::nat_traversal::stun::StunConfig;
use crate::nat_traversal::turn::TurnConfig;

/// Transport protocol of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// An ip:port/protocol triple. Equality is the exact tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl TransportAddress {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            protocol: Protocol::Udp,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        };
        write!(f, "{}/{}", self.socket_addr(), proto)
    }
}

/// NAT classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// Any external host can send to the mapped port
    FullCone,
    /// Only previously contacted IPs (any port) can send
    RestrictedCone,
    /// Only previously contacted IP:port pairs can send
    PortRestrictedCone,
    /// A distinct mapping per destination
    Symmetric,
    /// Probes were inconclusive
    Unknown,
}

impl NatType {
    /// The type to plan punching around. Unknown is treated as the
    /// most conservative cone type.
    pub fn assumed(self) -> NatType {
        match self {
            NatType::Unknown => NatType::PortRestrictedCone,
            other => other,
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatType::FullCone => write!(f, "Full Cone"),
            NatType::RestrictedCone => write!(f, "Restricted Cone"),
            NatType::PortRestrictedCone => write!(f, "Port-Restricted Cone"),
            NatType::Symmetric => write!(f, "Symmetric"),
            NatType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How the NAT picks the external mapping for outbound flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingBehavior {
    EndpointIndependent,
    /// Mapping changes with the destination (symmetric)
    AddressDependent,
    Unknown,
}

/// Which unsolicited inbound traffic the NAT lets through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilteringBehavior {
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
    Unknown,
}

/// Result of NAT classification, produced once per setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatProfile {
    pub nat_type: NatType,
    pub mapping: MappingBehavior,
    pub filtering: FilteringBehavior,
    pub external_address: Option<TransportAddress>,
}

impl NatProfile {
    pub fn unknown(external_address: Option<TransportAddress>) -> Self {
        Self {
            nat_type: NatType::Unknown,
            mapping: MappingBehavior::Unknown,
            filtering: FilteringBehavior::Unknown,
            external_address,
        }
    }

    /// Profile known only from what a remote peer advertised
    pub fn advertised(nat_type: NatType, external_address: TransportAddress) -> Self {
        let (mapping, filtering) = match nat_type {
            NatType::FullCone => (
                MappingBehavior::EndpointIndependent,
                FilteringBehavior::EndpointIndependent,
            ),
            NatType::RestrictedCone => (
                MappingBehavior::EndpointIndependent,
                FilteringBehavior::AddressDependent,
            ),
            NatType::PortRestrictedCone => (
                MappingBehavior::EndpointIndependent,
                FilteringBehavior::AddressAndPortDependent,
            ),
            NatType::Symmetric => (
                MappingBehavior::AddressDependent,
                FilteringBehavior::AddressAndPortDependent,
            ),
            NatType::Unknown => (MappingBehavior::Unknown, FilteringBehavior::Unknown),
        };
        Self {
            nat_type,
            mapping,
            filtering,
            external_address: Some(external_address),
        }
    }
}

impl fmt::Display for NatProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.external_address {
            Some(addr) => write!(f, "{} NAT (external {})", self.nat_type, addr.socket_addr()),
            None => write!(f, "{} NAT (no external address)", self.nat_type),
        }
    }
}

/// Expected hole-punching result for a pair of NAT types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchOutlook {
    Likely,
    Possible,
    Unlikely,
}

impl fmt::Display for PunchOutlook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PunchOutlook::Likely => write!(f, "likely"),
            PunchOutlook::Possible => write!(f, "possible"),
            PunchOutlook::Unlikely => write!(f, "unlikely"),
        }
    }
}

/// Compatibility matrix. Symmetric against a port-restricted or symmetric
/// peer is expected to fail; Restricted against Port-Restricted is timing
/// dependent and only ever "possible".
pub fn punch_outlook(local: NatType, remote: NatType) -> PunchOutlook {
    use NatType::*;

    match (local.assumed(), remote.assumed()) {
        (Symmetric, Symmetric)
        | (Symmetric, PortRestrictedCone)
        | (PortRestrictedCone, Symmetric) => PunchOutlook::Unlikely,
        (RestrictedCone, PortRestrictedCone)
        | (PortRestrictedCone, RestrictedCone)
        | (RestrictedCone, Symmetric)
        | (Symmetric, RestrictedCone) => PunchOutlook::Possible,
        _ => PunchOutlook::Likely,
    }
}

/// Peer connection information learned at rendezvous.
///
/// The shared secret is held separately as a [`crate::mesh::NetworkKey`];
/// nothing in here is secret.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub peer_id: String,
    pub reflexive_address: TransportAddress,
    pub nat_profile: NatProfile,
    pub nonce: u64,
    pub virtual_ip: Ipv4Addr,
}

/// Derive a peer's address on the virtual subnet: `10.<net>.<a>.<b>`.
/// The second octet depends only on the network name so all members
/// share a /16.
pub fn virtual_ip(network: &str, peer_id: &str) -> Ipv4Addr {
    let net = blake3::hash(network.as_bytes());
    let host = blake3::Hasher::new()
        .update(network.as_bytes())
        .update(b"/")
        .update(peer_id.as_bytes())
        .finalize();
    let host = host.as_bytes();

    let last = match host[1] {
        0 => 1,
        255 => 254,
        b => b,
    };
    Ipv4Addr::new(10, net.as_bytes()[0], host[0], last)
}

/// NAT traversal configuration
#[derive(Clone, Debug)]
pub struct NatTraversalConfig {
    /// Network name; also salts the key derivation
    pub network: String,

    /// Local identity (like a username)
    pub local_peer_id: String,

    /// Local UDP bind address (port 0 for random)
    pub bind_addr: SocketAddr,

    /// STUN servers, probed in order
    pub stun_servers: Vec<SocketAddr>,

    pub stun: StunConfig,

    /// Bounded wait for the peer's rendezvous record
    pub rendezvous_timeout: Duration,

    /// Retransmit interval for the local rendezvous record
    pub rendezvous_retransmit: Duration,

    pub punch: PunchConfig,

    pub session: SessionConfig,

    /// TURN relay used when punching fails
    pub relay: Option<TurnConfig>,
}

/// Connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    StunDiscovery,
    Rendezvous,
    HolePunching,
    Relaying,
    Handshaking,
    Connected,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_address_equality_is_exact() {
        let a = TransportAddress::udp("203.0.113.1:40000".parse().unwrap());
        let b = TransportAddress::udp("203.0.113.1:40000".parse().unwrap());
        let c = TransportAddress {
            protocol: Protocol::Tcp,
            ..a
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "203.0.113.1:40000/udp");
    }

    #[test]
    fn unknown_is_assumed_port_restricted() {
        assert_eq!(NatType::Unknown.assumed(), NatType::PortRestrictedCone);
        assert_eq!(NatType::FullCone.assumed(), NatType::FullCone);
    }

    #[test]
    fn outlook_matrix() {
        use NatType::*;
        assert_eq!(punch_outlook(Symmetric, Symmetric), PunchOutlook::Unlikely);
        assert_eq!(punch_outlook(Symmetric, PortRestrictedCone), PunchOutlook::Unlikely);
        assert_eq!(punch_outlook(Unknown, Symmetric), PunchOutlook::Unlikely);
        assert_eq!(punch_outlook(RestrictedCone, PortRestrictedCone), PunchOutlook::Possible);
        assert_eq!(punch_outlook(FullCone, PortRestrictedCone), PunchOutlook::Likely);
        assert_eq!(punch_outlook(FullCone, Symmetric), PunchOutlook::Likely);
    }

    #[test]
    fn virtual_ip_shares_network_prefix() {
        let a = virtual_ip("lan-party", "alice");
        let b = virtual_ip("lan-party", "bob");
        assert_eq!(a.octets()[0], 10);
        assert_eq!(a.octets()[1], b.octets()[1]);
        assert_ne!(a, b);
        assert_eq!(a, virtual_ip("lan-party", "alice"));
        assert!(a.octets()[3] != 0 && a.octets()[3] != 255);
    }
}
