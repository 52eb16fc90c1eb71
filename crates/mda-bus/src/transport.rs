//! Byte-stream transports for the remote channel.
//!
//! Any ordered, reliable stream works. Unix domain sockets are the default on
//! one host; TCP covers the rest. Both are `tokio::net` streams, so connecting,
//! binding and accepting must happen on the runtime that will drive the
//! connection.

use mda_core::{EdaError, EdaResult};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

/// How long `connect` waits for the listener.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected, bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Short description of the peer for logs.
    fn peer(&self) -> String;
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn peer(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => match addr.as_pathname() {
                Some(path) => format!("unix:{}", path.display()),
                None => "unix:(unnamed)".to_string(),
            },
            Err(_) => "unix:(unknown)".to_string(),
        }
    }
}

impl Transport for TcpStream {
    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| format!("tcp:{addr}"))
            .unwrap_or_else(|_| "tcp:(unknown)".to_string())
    }
}

/// Where the receiver listens and the forwarder connects.
///
/// Parsed from `unix:<path>` or `tcp:<host:port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = EdaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(EdaError::Configuration("empty unix socket path".into()));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix("tcp:") {
            if !addr.contains(':') {
                return Err(EdaError::Configuration(format!(
                    "tcp endpoint '{addr}' needs host:port"
                )));
            }
            Ok(Endpoint::Tcp(addr.to_string()))
        } else {
            Err(EdaError::Configuration(format!(
                "endpoint '{s}' must start with unix: or tcp:"
            )))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

impl Endpoint {
    /// Connect to a bound listener, giving up after [`CONNECT_TIMEOUT`].
    pub async fn connect(&self) -> EdaResult<Box<dyn Transport>> {
        let stream: Box<dyn Transport> = match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Box::new(
                timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
                    .await
                    .map_err(|_| self.connect_timed_out())??,
            ),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(EdaError::Configuration(
                    "unix sockets are not available on this platform".into(),
                ))
            }
            Endpoint::Tcp(addr) => {
                let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
                    .await
                    .map_err(|_| self.connect_timed_out())??;
                // Disable Nagle's algorithm, messages are small and latency matters
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        };
        tracing::info!(endpoint = %self, "Connected event channel");
        Ok(stream)
    }

    fn connect_timed_out(&self) -> EdaError {
        EdaError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connection to {self} timed out after {CONNECT_TIMEOUT:?}"),
        ))
    }

    /// Bind a listener. A stale unix socket file at the path is replaced.
    pub async fn bind(&self) -> EdaResult<Listener> {
        let listener = match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if tokio::fs::try_exists(path).await? {
                    tokio::fs::remove_file(path).await?;
                }
                Listener::Unix(UnixListener::bind(path)?)
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(EdaError::Configuration(
                    "unix sockets are not available on this platform".into(),
                ))
            }
            Endpoint::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr.as_str()).await?),
        };
        tracing::info!(endpoint = %self, "Listening for event channel");
        Ok(listener)
    }
}

#[derive(Debug)]
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Wait for one producer to connect.
    pub async fn accept(&self) -> EdaResult<Box<dyn Transport>> {
        let stream: Box<dyn Transport> = match self {
            #[cfg(unix)]
            Listener::Unix(listener) => Box::new(listener.accept().await?.0),
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        };
        tracing::info!(peer = %stream.peer(), "Accepted event channel connection");
        Ok(stream)
    }

    /// Bound endpoint, with the actual port for `tcp:host:0`.
    pub fn local_endpoint(&self) -> EdaResult<Endpoint> {
        match self {
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr
                    .as_pathname()
                    .ok_or_else(|| EdaError::Configuration("unnamed unix listener".into()))?;
                Ok(Endpoint::Unix(path.to_path_buf()))
            }
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            "unix:/tmp/mda.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/mda.sock"))
        );
        assert_eq!(
            "tcp:127.0.0.1:7878".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:7878".into())
        );
        assert!("unix:".parse::<Endpoint>().is_err());
        assert!("tcp:localhost".parse::<Endpoint>().is_err());
        assert!("pipe:/x".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for s in ["unix:/run/mda.sock", "tcp:localhost:9000"] {
            assert_eq!(s.parse::<Endpoint>().unwrap().to_string(), s);
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_accept() {
        let listener = Endpoint::Tcp("127.0.0.1:0".into()).bind().await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = endpoint.connect().await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(server.peer().starts_with("tcp:127.0.0.1:"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let listener = Endpoint::Tcp("127.0.0.1:0".into()).bind().await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        drop(listener);
        assert!(matches!(endpoint.connect().await, Err(EdaError::Io(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("events.sock"));
        let first = endpoint.bind().await.unwrap();
        drop(first);
        // socket file still exists after drop
        let second = endpoint.bind().await.unwrap();
        assert_eq!(second.local_endpoint().unwrap(), endpoint);
    }
}
