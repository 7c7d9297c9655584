//! Socket creation. The broker's `open` is the only caller.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// Any bidirectional byte stream: TCP, a proxied tunnel or a Tor stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Connects to the first reachable address, each attempt bounded by `timeout`.
pub async fn connect_direct(addresses: &[IpAddr], port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;
    for ip in addresses {
        let addr = SocketAddr::new(*ip, port);
        match tokio::time::timeout(timeout, connect_one(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "direct connection established");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "direct connect failed");
                last_error = Some(e);
            }
            Err(_) => {
                last_error = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")))
}

async fn connect_one(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    let socket = TcpSocket::from_std_stream(socket.into());
    socket.connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_first_reachable_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"ok").await.unwrap();
        });

        let mut stream = connect_direct(&["127.0.0.1".parse().unwrap()], port, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn empty_address_list_is_an_error() {
        let err = connect_direct(&[], 443, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
