//! Network transport: listeners and streams over TCP and Unix sockets.
//!
//! The session layer works against boxed `AsyncRead`/`AsyncWrite` halves,
//! so everything network-specific stays in this module: address family
//! selection for `tcp4`/`tcp6`, Unix socket path handling, and stale
//! socket-file cleanup on bind.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::config::Network;
use crate::error::{Error, Result};

/// Boxed read half of a connection.
pub(crate) type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a connection.
pub(crate) type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// A bound listener on one of the supported networks.
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, String),
}

/// A connected stream on one of the supported networks.
pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Listener {
    /// Bind on the configured network.
    pub async fn bind(network: Network, addr: &str) -> Result<Listener> {
        if network.is_unix() {
            #[cfg(unix)]
            {
                // Remove a stale socket file left by a previous process.
                if std::path::Path::new(addr).exists() {
                    std::fs::remove_file(addr)?;
                }
                let listener = UnixListener::bind(addr)?;
                return Ok(Listener::Unix(listener, addr.to_string()));
            }
            #[cfg(not(unix))]
            {
                return Err(Error::Config(format!(
                    "network {:?} is unsupported on this platform",
                    network
                )));
            }
        }
        let addr = resolve(network, addr).await?;
        Ok(Listener::Tcp(TcpListener::bind(addr).await?))
    }

    /// Accept one connection.
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(l, path) => {
                let (stream, _) = l.accept().await?;
                // Unix peers have no useful address; identify by the path.
                Ok((Stream::Unix(stream), format!("unix:{}", path)))
            }
        }
    }

    /// Printable bound address.
    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            Listener::Unix(_, path) => path.clone(),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path.as_str());
        }
    }
}

impl Stream {
    /// Dial on the configured network.
    pub async fn dial(network: Network, addr: &str) -> Result<Stream> {
        if network.is_unix() {
            #[cfg(unix)]
            {
                return Ok(Stream::Unix(UnixStream::connect(addr).await?));
            }
            #[cfg(not(unix))]
            {
                return Err(Error::Config(format!(
                    "network {:?} is unsupported on this platform",
                    network
                )));
            }
        }
        let addr = resolve(network, addr).await?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Stream::Tcp(stream))
    }

    /// Printable remote address.
    pub fn remote_addr(&self) -> String {
        match self {
            Stream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            Stream::Unix(_) => "unix".to_string(),
        }
    }

    /// Split into boxed read and write halves.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Stream::Tcp(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            Stream::Unix(s) => {
                let (r, w) = s.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// Resolve a host:port string to one socket address, constrained to the
/// network's address family.
async fn resolve(network: Network, addr: &str) -> Result<std::net::SocketAddr> {
    // An empty host means "all interfaces".
    let target = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let mut candidates = lookup_host(&target).await?;
    let found = match network {
        Network::Tcp4 => candidates.find(|a| a.is_ipv4()),
        Network::Tcp6 => candidates.find(|a| a.is_ipv6()),
        _ => candidates.next(),
    };
    found.ok_or_else(|| {
        Error::Config(format!(
            "address {:?} has no candidate for network {:?}",
            addr, network
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_bind_accept_dial() {
        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let dial = tokio::spawn(async move { Stream::dial(Network::Tcp, &addr).await.unwrap() });

        let (accepted, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));

        let dialed = dial.await.unwrap();
        let (mut r, _w) = accepted.into_split();
        let (_dr, mut dw) = dialed.into_split();

        dw.write_all(b"ping").await.unwrap();
        dw.flush().await.unwrap();

        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_tcp4_resolution() {
        let addr = resolve(Network::Tcp4, "127.0.0.1:9000").await.unwrap();
        assert!(addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_leading_colon_means_all_interfaces() {
        let addr = resolve(Network::Tcp, ":0").await.unwrap();
        assert_eq!(addr.port(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_accept_dial() {
        let path = format!("/tmp/peerwire-test-{}.sock", std::process::id());
        let listener = Listener::bind(Network::Unix, &path).await.unwrap();
        assert_eq!(listener.local_addr(), path);

        let dial_path = path.clone();
        let dial =
            tokio::spawn(async move { Stream::dial(Network::Unix, &dial_path).await.unwrap() });

        let (accepted, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("unix:"));

        let dialed = dial.await.unwrap();
        let (mut r, _w) = accepted.into_split();
        let (_dr, mut dw) = dialed.into_split();

        dw.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        drop(listener);
        assert!(!std::path::Path::new(&path).exists());
    }
}
