//! IPv4 socket addresses in the 6-byte host encoding.
//!
//! Layout: 4 address bytes followed by the port, big-endian. This is the
//! same byte order `sockaddr_in` uses, so the bytes can be copied into a
//! socket address without conversion.

use core::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{FlowError, FlowResult};

/// Encoded length of a [`SocketAddress`].
pub const ENCODED_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddress {
    pub ip: [u8; 4],
    pub port: u16,
}

impl SocketAddress {
    pub const fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }

    pub const fn localhost(port: u16) -> Self {
        Self::new([127, 0, 0, 1], port)
    }

    /// Decode from exactly six bytes.
    pub fn from_bytes(bytes: &[u8]) -> FlowResult<Self> {
        if bytes.len() != ENCODED_LEN {
            return Err(FlowError::InvalidArgument("address must be 6 bytes"));
        }
        Ok(Self {
            ip: [bytes[0], bytes[1], bytes[2], bytes[3]],
            port: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ENCODED_LEN] {
        let p = self.port.to_be_bytes();
        [self.ip[0], self.ip[1], self.ip[2], self.ip[3], p[0], p[1]]
    }
}

impl From<SocketAddrV4> for SocketAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(addr.ip().octets(), addr.port())
    }
}

impl From<SocketAddress> for SocketAddrV4 {
    fn from(addr: SocketAddress) -> Self {
        SocketAddrV4::new(Ipv4Addr::from(addr.ip), addr.port)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddrV4::from(*self))
    }
}

/// Remote end of a connected socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: SocketAddress,
    /// Reverse-resolved host name, when one exists
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_is_network_order() {
        let addr = SocketAddress::new([10, 0, 0, 7], 0x1F90); // 8080
        assert_eq!(addr.to_bytes(), [10, 0, 0, 7, 0x1F, 0x90]);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(SocketAddress::from_bytes(&[127, 0, 0, 1]).is_err());
        assert!(SocketAddress::from_bytes(&[0; 7]).is_err());
    }

    #[test]
    fn test_from_bytes_decodes() {
        let addr = SocketAddress::from_bytes(&[127, 0, 0, 1, 0x00, 0x50]).unwrap();
        assert_eq!(addr, SocketAddress::localhost(80));
    }

    #[test]
    fn test_std_conversion_and_display() {
        let std_addr: SocketAddrV4 = "192.168.1.9:53".parse().unwrap();
        let addr = SocketAddress::from(std_addr);
        assert_eq!(addr.ip, [192, 168, 1, 9]);
        assert_eq!(addr.to_string(), "192.168.1.9:53");
        assert_eq!(SocketAddrV4::from(addr), std_addr);
    }
}
