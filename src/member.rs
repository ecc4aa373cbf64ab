use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};

use anyhow::bail;
use bytes::{Buf, BufMut};

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Identifies a cluster member on the wire: its listening address plus an incarnation
///  number, so a process restarting on the same address is not mistaken for its
///  predecessor. The membership layer picks the incarnation; the transport only carries
///  and compares it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId {
    pub unique: u64,
    pub socket_addr: SocketAddr,
}

impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.socket_addr, self.unique)
    }
}

impl MemberId {
    /// Wire layout: address family tag, raw ip octets, port, incarnation.
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self.socket_addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(FAMILY_V4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(FAMILY_V6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16(self.socket_addr.port());
        buf.put_u64(self.unique);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MemberId> {
        let ip = match buf.try_get_u8()? {
            FAMILY_V4 => {
                let mut octets = [0u8; 4];
                buf.try_copy_to_slice(&mut octets)?;
                IpAddr::from(octets)
            }
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                buf.try_copy_to_slice(&mut octets)?;
                IpAddr::from(octets)
            }
            family => bail!("unknown address family {} in a member identity", family),
        };
        let port = buf.try_get_u16()?;
        let unique = buf.try_get_u64()?;

        Ok(MemberId {
            unique,
            socket_addr: SocketAddr::new(ip, port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::v4("192.168.7.21:21099", 1)]
    #[case::v4_port_zero("10.20.30.40:0", u64::MAX)]
    #[case::v6("[fe80::2]:39001", 1_699_000_000)]
    #[case::v6_loopback("[::1]:7100", 2)]
    fn test_wire_roundtrip(#[case] addr: &str, #[case] unique: u64) {
        let member = MemberId {
            unique,
            socket_addr: addr.parse().unwrap(),
        };

        let mut encoded = BytesMut::new();
        member.ser(&mut encoded);
        assert_eq!(MemberId::deser(&mut encoded).unwrap(), member);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_unknown_address_family_is_rejected() {
        let mut encoded = BytesMut::new();
        MemberId { unique: 3, socket_addr: "10.0.0.1:20".parse().unwrap() }.ser(&mut encoded);
        encoded[0] = 7;

        assert!(MemberId::deser(&mut encoded).is_err());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let mut encoded = BytesMut::new();
        MemberId { unique: 3, socket_addr: "10.0.0.1:20".parse().unwrap() }.ser(&mut encoded);
        let short = encoded.len() - 1;
        encoded.truncate(short);

        assert!(MemberId::deser(&mut encoded).is_err());
    }

    #[test]
    fn test_incarnations_of_the_same_address_differ() {
        let first = MemberId { unique: 10, socket_addr: "10.0.0.1:20".parse().unwrap() };
        let second = MemberId { unique: 11, ..first };
        assert_ne!(first, second);
    }
}
