use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::debug;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a non-blocking listener for one forward.
///
/// No SO_REUSEPORT: a second forward on the same port must fail to bind
/// rather than silently share the socket. IPv6 listeners are v6-only so
/// the IPv4 listener of the same forward can coexist on the port.
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Whether the host can open TCP sockets of this family at all.
pub fn family_supported(ipv6: bool) -> bool {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
        Ok(_) => true,
        Err(e) => {
            debug!(ipv6 = ipv6, error = %e, "Address family unavailable");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_bind_on_same_port_fails() {
        let first = bind_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(bind_tcp_listener(addr).is_err());
    }

    #[test]
    fn test_ipv4_is_supported() {
        assert!(family_supported(false));
    }
}
