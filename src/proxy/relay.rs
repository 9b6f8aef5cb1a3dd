use std::fmt;
use std::io;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which side ended a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    Client,
    Backend,
    Cancelled,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::Client => f.write_str("client closed"),
            RelayEnd::Backend => f.write_str("backend closed"),
            RelayEnd::Cancelled => f.write_str("force closed"),
        }
    }
}

/// Copy bytes both ways until either direction finishes or `cancel` fires.
///
/// Both sockets are dropped on return, so one side closing closes the other.
pub async fn relay(client: TcpStream, backend: TcpStream, cancel: CancellationToken) -> RelayEnd {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    tokio::select! {
        res = tokio::io::copy(&mut client_read, &mut backend_write) => {
            log_copy("client->backend", res);
            RelayEnd::Client
        }
        res = tokio::io::copy(&mut backend_read, &mut client_write) => {
            log_copy("backend->client", res);
            RelayEnd::Backend
        }
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    }
}

fn log_copy(direction: &'static str, res: io::Result<u64>) {
    match res {
        Ok(bytes) => debug!(direction = direction, bytes = bytes, "Relay direction finished"),
        Err(e) => debug!(direction = direction, error = %e, "Relay direction failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (b, _) = listener.accept().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_bytes_flow_and_client_close_ends_relay() {
        let (mut client, client_side) = pair().await;
        let (backend_side, mut backend) = pair().await;
        let task = tokio::spawn(relay(client_side, backend_side, CancellationToken::new()));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        assert_eq!(task.await.unwrap(), RelayEnd::Client);
        assert_eq!(backend.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_closes_both_sides() {
        let (mut client, client_side) = pair().await;
        let (backend_side, mut backend) = pair().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay(client_side, backend_side, cancel.clone()));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), RelayEnd::Cancelled);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(backend.read(&mut buf).await.unwrap(), 0);
    }
}
