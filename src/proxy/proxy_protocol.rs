//! PROXY protocol v1/v2 headers.
//!
//! Outbound: a header is written to the backend before any client bytes so
//! the backend learns the real client address. Inbound: listeners placed
//! behind another proxy can strip a header and use the address it carries.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::models::forward::ProxyVersion;

/// PROXY protocol v2 signature (12 bytes).
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const V1_PREFIX: &[u8; 6] = b"PROXY ";

/// Longest legal v1 line including CRLF.
const V1_MAX_LEN: usize = 107;

/// Upper bound on the v2 address block we are willing to read (TLVs included).
const V2_MAX_BLOCK: usize = 1024;

const VERSION_COMMAND_LOCAL: u8 = 0x20;
const VERSION_COMMAND_PROXY: u8 = 0x21;
const AF_UNSPEC: u8 = 0x00;
const AF_INET_STREAM: u8 = 0x11;
const AF_INET6_STREAM: u8 = 0x21;
const IPV4_ADDR_LEN: u16 = 12;
const IPV6_ADDR_LEN: u16 = 36;

/// Both addresses share a family in the header. Mixed pairs are written as
/// IPv6 with the IPv4 side mapped.
fn unify(src: SocketAddr, dst: SocketAddr) -> (IpAddr, IpAddr) {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (IpAddr::V4(s), IpAddr::V4(d)),
        (s, d) => (IpAddr::V6(as_v6(s)), IpAddr::V6(as_v6(d))),
    }
}

fn as_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

pub fn encode_v1(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let (family, s, d) = match unify(src, dst) {
        (s @ IpAddr::V4(_), d) => ("TCP4", s, d),
        (s, d) => ("TCP6", s, d),
    };
    format!("PROXY {} {} {} {} {}\r\n", family, s, d, src.port(), dst.port()).into_bytes()
}

pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + IPV6_ADDR_LEN as usize);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);

    match unify(src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            buf.push(AF_INET_STREAM);
            buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());
            buf.extend_from_slice(&s.octets());
            buf.extend_from_slice(&d.octets());
        }
        (s, d) => {
            buf.push(AF_INET6_STREAM);
            buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());
            buf.extend_from_slice(&as_v6(s).octets());
            buf.extend_from_slice(&as_v6(d).octets());
        }
    }

    buf.extend_from_slice(&src.port().to_be_bytes());
    buf.extend_from_slice(&dst.port().to_be_bytes());
    buf
}

pub fn encode(version: ProxyVersion, src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    match version {
        ProxyVersion::V1 => encode_v1(src, dst),
        ProxyVersion::V2 => encode_v2(src, dst),
    }
}

/// Write a header for `src -> dst` to the freshly dialed backend.
pub async fn write_header(
    backend: &mut TcpStream,
    version: ProxyVersion,
    src: SocketAddr,
    dst: SocketAddr,
) -> io::Result<()> {
    let header = encode(version, src, dst);
    backend.write_all(&header).await?;
    backend.flush().await
}

enum Sniffed {
    V1,
    V2,
    Plain,
}

/// Peek until the first bytes either match a signature or rule both out.
async fn sniff(stream: &TcpStream) -> io::Result<Sniffed> {
    let mut buf = [0u8; 12];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Sniffed::Plain);
        }
        let seen = &buf[..n];

        let v2_possible = V2_SIGNATURE[..n] == *seen;
        let v1_len = n.min(V1_PREFIX.len());
        let v1_possible = V1_PREFIX[..v1_len] == seen[..v1_len];

        if v2_possible && n == V2_SIGNATURE.len() {
            return Ok(Sniffed::V2);
        }
        if v1_possible && n >= V1_PREFIX.len() {
            return Ok(Sniffed::V1);
        }
        if !v1_possible && !v2_possible {
            return Ok(Sniffed::Plain);
        }
        // Partial prefix so far; give the peer a moment to send more.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Strip a PROXY header from an accepted connection, if one is present.
///
/// Returns the source address the header carries, or `None` when there is
/// no header within `wait`, or it is a LOCAL/UNKNOWN header. A malformed or
/// truncated header is an error and the connection should be dropped.
pub async fn read_header(stream: &mut TcpStream, wait: Duration) -> io::Result<Option<SocketAddr>> {
    let deadline = tokio::time::Instant::now() + wait;
    let kind = match tokio::time::timeout_at(deadline, sniff(stream)).await {
        Ok(kind) => kind?,
        Err(_) => return Ok(None),
    };
    let parsed = match kind {
        Sniffed::Plain => return Ok(None),
        Sniffed::V1 => tokio::time::timeout_at(deadline, read_v1(stream)).await,
        Sniffed::V2 => tokio::time::timeout_at(deadline, read_v2(stream)).await,
    };
    // A header that started but never finished is malformed.
    parsed.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "PROXY header incomplete"))?
}

async fn read_v1(stream: &mut TcpStream) -> io::Result<Option<SocketAddr>> {
    // Byte at a time: nothing past the CRLF may be consumed.
    let mut line = Vec::with_capacity(V1_MAX_LEN);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() >= V1_MAX_LEN {
            return Err(invalid("PROXY v1 header too long"));
        }
    }
    let text = std::str::from_utf8(&line).map_err(|_| invalid("PROXY v1 header is not UTF-8"))?;
    parse_v1(text)
}

/// Parse a complete v1 line (CRLF optional).
pub fn parse_v1(line: &str) -> io::Result<Option<SocketAddr>> {
    let parts: Vec<&str> = line.trim_end_matches("\r\n").split(' ').collect();
    match parts.as_slice() {
        ["PROXY", "UNKNOWN", ..] => Ok(None),
        ["PROXY", family @ ("TCP4" | "TCP6"), src, _dst, sport, _dport] => {
            let ip: IpAddr = src.parse().map_err(|_| invalid("PROXY v1 bad source address"))?;
            if (*family == "TCP4") != ip.is_ipv4() {
                return Err(invalid("PROXY v1 family does not match address"));
            }
            let port: u16 = sport.parse().map_err(|_| invalid("PROXY v1 bad source port"))?;
            Ok(Some(SocketAddr::new(ip.to_canonical(), port)))
        }
        _ => Err(invalid("malformed PROXY v1 header")),
    }
}

async fn read_v2(stream: &mut TcpStream) -> io::Result<Option<SocketAddr>> {
    let mut head = [0u8; 16];
    stream.read_exact(&mut head).await?;
    let len = u16::from_be_bytes([head[14], head[15]]) as usize;
    if len > V2_MAX_BLOCK {
        return Err(invalid("PROXY v2 address block too large"));
    }
    let mut block = vec![0u8; len];
    stream.read_exact(&mut block).await?;
    parse_v2(&head, &block)
}

/// Parse a v2 header given its fixed 16-byte head and the address block.
pub fn parse_v2(head: &[u8; 16], block: &[u8]) -> io::Result<Option<SocketAddr>> {
    if head[..12] != V2_SIGNATURE {
        return Err(invalid("PROXY v2 bad signature"));
    }
    match head[12] {
        VERSION_COMMAND_LOCAL => return Ok(None),
        VERSION_COMMAND_PROXY => {}
        _ => return Err(invalid("PROXY v2 unsupported version/command")),
    }

    match head[13] {
        AF_UNSPEC => Ok(None),
        AF_INET_STREAM => {
            if block.len() < IPV4_ADDR_LEN as usize {
                return Err(invalid("PROXY v2 IPv4 block too short"));
            }
            let ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let port = u16::from_be_bytes([block[8], block[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        AF_INET6_STREAM => {
            if block.len() < IPV6_ADDR_LEN as usize {
                return Err(invalid("PROXY v2 IPv6 block too short"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&block[..16]);
            let port = u16::from_be_bytes([block[32], block[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)).to_canonical(), port)))
        }
        _ => Err(invalid("PROXY v2 unsupported address family")),
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_encode_v1_ipv4() {
        let header = encode_v1(addr("203.0.113.7:51000"), addr("10.0.0.1:22"));
        assert_eq!(header, b"PROXY TCP4 203.0.113.7 10.0.0.1 51000 22\r\n");
    }

    #[test]
    fn test_encode_v1_mixed_families_maps_to_v6() {
        let header = encode_v1(addr("203.0.113.7:51000"), addr("[2001:db8::1]:22"));
        let text = String::from_utf8(header).unwrap();
        assert_eq!(text, "PROXY TCP6 ::ffff:203.0.113.7 2001:db8::1 51000 22\r\n");
    }

    #[test]
    fn test_encode_v2_layout() {
        let header = encode_v2(addr("192.168.1.100:12345"), addr("10.0.0.1:443"));
        assert_eq!(header.len(), 28);
        assert_eq!(&header[..12], &V2_SIGNATURE);
        assert_eq!(header[12], 0x21);
        assert_eq!(header[13], 0x11);
        assert_eq!(u16::from_be_bytes([header[14], header[15]]), 12);
        assert_eq!(&header[16..20], &[192, 168, 1, 100]);
        assert_eq!(u16::from_be_bytes([header[24], header[25]]), 12345);

        let v6 = encode_v2(addr("[2001:db8::1]:1"), addr("[2001:db8::2]:2"));
        assert_eq!(v6.len(), 52);
        assert_eq!(v6[13], 0x21);
    }

    #[test]
    fn test_parse_v1_variants() {
        assert_eq!(
            parse_v1("PROXY TCP4 198.51.100.3 10.0.0.1 40000 22\r\n").unwrap(),
            Some(addr("198.51.100.3:40000"))
        );
        assert_eq!(parse_v1("PROXY UNKNOWN\r\n").unwrap(), None);
        assert!(parse_v1("PROXY TCP4 2001:db8::1 10.0.0.1 1 2\r\n").is_err());
        assert!(parse_v1("PROXY TCP4 1.2.3.4\r\n").is_err());
    }

    #[test]
    fn test_parse_v2_local_and_errors() {
        let mut head = [0u8; 16];
        head[..12].copy_from_slice(&V2_SIGNATURE);
        head[12] = VERSION_COMMAND_LOCAL;
        assert_eq!(parse_v2(&head, &[]).unwrap(), None);

        head[12] = VERSION_COMMAND_PROXY;
        head[13] = AF_INET_STREAM;
        assert!(parse_v2(&head, &[0u8; 4]).is_err());

        head[0] = 0;
        assert!(parse_v2(&head, &[0u8; 12]).is_err());
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_read_header_consumes_only_the_header() {
        for version in [ProxyVersion::V1, ProxyVersion::V2] {
            let (mut client, mut server) = pair().await;
            let header = encode(version, addr("198.51.100.9:41000"), addr("10.0.0.1:22"));
            client.write_all(&header).await.unwrap();
            client.write_all(b"SSH-2.0-test\r\n").await.unwrap();

            let src = read_header(&mut server, Duration::from_secs(1)).await.unwrap();
            assert_eq!(src, Some(addr("198.51.100.9:41000")));

            let mut rest = [0u8; 14];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest, b"SSH-2.0-test\r\n");
        }
    }

    #[tokio::test]
    async fn test_read_header_passes_plain_streams_through() {
        let (mut client, mut server) = pair().await;
        client.write_all(b"hello").await.unwrap();
        assert_eq!(read_header(&mut server, Duration::from_secs(1)).await.unwrap(), None);

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let (mut client, mut server) = pair().await;
        client.write_all(b"PROXY TCP4 198.51.100.9").await.unwrap();
        assert!(read_header(&mut server, Duration::from_millis(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_read_header_times_out_on_silent_client() {
        let (_client, mut server) = pair().await;
        let src = read_header(&mut server, Duration::from_millis(50)).await.unwrap();
        assert_eq!(src, None);
    }
}
