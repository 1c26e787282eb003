use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use chunkcast_config::{ANY_IFACE, FALLBACK_BROADCAST};

/// The local IPv4 most likely to reach other peers. The socket is
/// "connected" to a routable address purely to make the OS pick a source
/// address; no packet is sent.
pub fn best_local_ip() -> Ipv4Addr {
    probe_local_ip().unwrap_or(Ipv4Addr::LOCALHOST)
}

fn probe_local_ip() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((ANY_IFACE, 0))?;
    socket.connect(("8.8.8.8", 80))?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "local address is not IPv4",
        )),
    }
}

/// Broadcast address for discovery traffic: the /24 directed broadcast of
/// the local interface when one is known, the limited broadcast otherwise.
pub fn broadcast_addr() -> Ipv4Addr {
    match probe_local_ip() {
        Ok(ip) if !ip.is_loopback() => {
            let [a, b, c, _] = ip.octets();
            Ipv4Addr::new(a, b, c, 255)
        }
        _ => FALLBACK_BROADCAST,
    }
}

/// Parse a `host:port` peer key into a socket address. Hosts must be IPv4
/// literals; anything else is rejected and the peer is skipped.
pub fn parse_peer_key(key: &str) -> Option<SocketAddr> {
    let (host, port) = key.split_once(':')?;
    let ip: Ipv4Addr = host.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Canonical `host:port` peer key.
pub fn peer_key(ip: Ipv4Addr, port: u16) -> String {
    format!("{}:{}", ip, port)
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_parse_peer_key_valid() {
        let addr = parse_peer_key("192.168.1.10:5050").unwrap();
        assert_eq!(addr.to_string(), "192.168.1.10:5050");
    }

    #[test]
    fn test_parse_peer_key_rejects_missing_port() {
        assert!(parse_peer_key("192.168.1.10").is_none());
    }

    #[test]
    fn test_parse_peer_key_rejects_hostname() {
        assert!(parse_peer_key("example.com:80").is_none());
    }

    #[test]
    fn test_parse_peer_key_rejects_ipv6() {
        assert!(parse_peer_key("::1:80").is_none());
    }

    #[test]
    fn test_parse_peer_key_rejects_bad_port() {
        assert!(parse_peer_key("10.0.0.1:notaport").is_none());
        assert!(parse_peer_key("10.0.0.1:70000").is_none());
    }

    #[test]
    fn test_peer_key_roundtrip() {
        let key = peer_key(Ipv4Addr::new(10, 1, 2, 3), 8080);
        assert_eq!(key, "10.1.2.3:8080");
        assert!(parse_peer_key(&key).is_some());
    }
}
