//! UDP keepalive datagrams.
//!
//! A keepalive is plain ASCII, `"<dotted-IPv4>:<listening-port>:KeepAlive."`,
//! with no length prefix. Any datagram containing the marker is treated as a
//! handshake/liveness signal instead of application data.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Literal identifying a keepalive datagram
pub const KEEPALIVE_MARKER: &str = "KeepAlive.";

/// Build the keepalive announcing `ip:port`
pub fn build_keepalive(ip: IpAddr, port: u16) -> Bytes {
    Bytes::from(format!("{ip}:{port}:{KEEPALIVE_MARKER}"))
}

/// Whether a datagram carries the keepalive marker
pub fn is_keepalive(data: &[u8]) -> bool {
    let marker = KEEPALIVE_MARKER.as_bytes();
    data.windows(marker.len()).any(|w| w == marker)
}

/// Recover the announced endpoint from a keepalive
///
/// Returns `None` for datagrams without the marker or with malformed
/// address fields.
pub fn parse_keepalive(data: &[u8]) -> Option<SocketAddr> {
    if !is_keepalive(data) {
        return None;
    }

    let text = std::str::from_utf8(data).ok()?.trim_matches('\0');
    let mut fields = text.split(':');
    let ip = fields.next()?.trim().parse::<Ipv4Addr>().ok()?;
    let port = fields.next()?.trim().parse::<u16>().ok()?;
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_text() {
        let datagram = build_keepalive(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 50765);
        assert_eq!(&datagram[..], b"192.168.1.20:50765:KeepAlive.");
        assert!(is_keepalive(&datagram));
        assert_eq!(
            parse_keepalive(&datagram),
            Some("192.168.1.20:50765".parse().unwrap())
        );
    }

    #[test]
    fn test_padded_keepalive() {
        let mut datagram = b"127.0.0.1:4000:KeepAlive.".to_vec();
        datagram.resize(64, 0);
        assert_eq!(
            parse_keepalive(&datagram),
            Some("127.0.0.1:4000".parse().unwrap())
        );
    }

    #[test]
    fn test_data_is_not_keepalive() {
        assert!(!is_keepalive(b"\0\0\0\x05ping"));
        assert!(!is_keepalive(b""));
        assert_eq!(parse_keepalive(b"127.0.0.1:4000:Hello."), None);
    }

    #[test]
    fn test_malformed_keepalive() {
        assert!(is_keepalive(b"KeepAlive."));
        assert_eq!(parse_keepalive(b"KeepAlive."), None);
        assert_eq!(parse_keepalive(b"not-an-ip:4000:KeepAlive."), None);
        assert_eq!(parse_keepalive(b"10.0.0.1:99999:KeepAlive."), None);
    }
}
