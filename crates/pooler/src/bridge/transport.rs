//! Socket transport for controller, worker and client endpoints.
//!
//! Platform-specific implementations:
//! - **Unix**: filesystem sockets under the run directory (`<run-dir>/<name>.sock`)
//! - **Tcp**: loopback TCP, used where unix sockets are unavailable

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Default run directory, relative to the working directory.
pub const DEFAULT_RUN_DIR: &str = ".pooler/run";

/// Socket name of the controller's control endpoint.
pub const CONTROLLER_SOCKET_NAME: &str = "controller";

pub const SOCKET_SUFFIX: &str = ".sock";

/// Default TCP port of the control endpoint when unix sockets are not used.
pub const DEFAULT_CONTROL_PORT: u16 = 5500;

/// Connection attempts made by [`connect_with_retry`] before giving up.
pub const CONNECT_ATTEMPTS: u32 = 10;

const UNIX_SCHEME: &str = "unix://";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(
        "\"{0}\" does not match a supported transport. Supported transports are: IPv4, IPv6 and unix://"
    )]
    Unsupported(String),
    #[error("could not connect to {address} after {attempts} attempts: {source}")]
    Connect {
        address: ControlAddress,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("could not bind {address}: {source}")]
    Bind {
        address: ControlAddress,
        #[source]
        source: io::Error,
    },
}

/// Address of a local endpoint: a unix socket path or a TCP socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl ControlAddress {
    /// Build an address from a host and port.
    ///
    /// `host` may be an IPv4 or IPv6 literal (combined with `port`) or a
    /// `unix://` URI (port ignored). Anything else is a configuration error.
    pub fn resolve(host: &str, port: u16) -> Result<Self, TransportError> {
        if let Some(path) = host.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(TransportError::Unsupported(host.to_string()));
            }
            return Ok(ControlAddress::Unix(PathBuf::from(path)));
        }

        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Ok(ControlAddress::Tcp(SocketAddr::new(ip, port))),
            Err(_) => Err(TransportError::Unsupported(host.to_string())),
        }
    }
}

impl FromStr for ControlAddress {
    type Err = TransportError;

    /// Parses `unix:///path/to.sock`, `127.0.0.1:5500` or `[::1]:5500`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(UNIX_SCHEME) {
            return Self::resolve(s, 0);
        }
        s.parse::<SocketAddr>()
            .map(ControlAddress::Tcp)
            .map_err(|_| TransportError::Unsupported(s.to_string()))
    }
}

impl std::fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlAddress::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
            ControlAddress::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// Which socket family local endpoints use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Unix,
    Tcp,
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(unix) {
            TransportKind::Unix
        } else {
            TransportKind::Tcp
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Unix => f.write_str("unix"),
            TransportKind::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(TransportKind::Unix),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(format!(
                "unknown transport '{}', expected 'unix' or 'tcp'",
                other
            )),
        }
    }
}

/// Naming scheme for local endpoints.
///
/// Unix: `<run-dir>/controller.sock` and `<run-dir>/<port>.sock`.
/// Tcp: `127.0.0.1:<control-port>` and `127.0.0.1:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    kind: TransportKind,
    run_dir: PathBuf,
    control_port: u16,
}

impl Endpoints {
    pub fn new(kind: TransportKind, run_dir: impl Into<PathBuf>, control_port: u16) -> Self {
        let run_dir = run_dir.into();
        // Workers inherit the working directory, but resolve now so every
        // process agrees on the same socket paths.
        let run_dir = std::path::absolute(&run_dir).unwrap_or(run_dir);
        Self {
            kind,
            run_dir,
            control_port,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}{}", name, SOCKET_SUFFIX))
    }

    pub fn controller(&self) -> ControlAddress {
        match self.kind {
            TransportKind::Unix => ControlAddress::Unix(self.socket_path(CONTROLLER_SOCKET_NAME)),
            TransportKind::Tcp => ControlAddress::Tcp(loopback(self.control_port)),
        }
    }

    /// Endpoint a worker listens on for proxied traffic, keyed by its port.
    pub fn worker(&self, port: u16) -> ControlAddress {
        match self.kind {
            TransportKind::Unix => ControlAddress::Unix(self.socket_path(&port.to_string())),
            TransportKind::Tcp => ControlAddress::Tcp(loopback(port)),
        }
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[cfg(not(unix))]
fn unix_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
    )
}

/// Listening endpoint.
///
/// A unix listener removes any stale socket file before binding and removes
/// its own file on drop.
pub enum Listener {
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    pub async fn bind(address: &ControlAddress) -> Result<Self, TransportError> {
        let bind_error = |source| TransportError::Bind {
            address: address.clone(),
            source,
        };

        match address {
            #[cfg(unix)]
            ControlAddress::Unix(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).map_err(bind_error)?;
                }
                if path.exists() {
                    tracing::debug!(path = %path.display(), "Removing stale socket file");
                    std::fs::remove_file(path).map_err(bind_error)?;
                }
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                tracing::trace!(path = %path.display(), "Bound unix socket");
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            ControlAddress::Unix(_) => Err(bind_error(unix_unsupported())),
            ControlAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
                Ok(Listener::Tcp(listener))
            }
        }
    }

    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Stream::Tcp(stream))
            }
        }
    }

    /// The address actually bound (resolves TCP port 0).
    pub fn local_address(&self) -> io::Result<ControlAddress> {
        match self {
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(ControlAddress::Unix(path.clone())),
            Listener::Tcp(listener) => Ok(ControlAddress::Tcp(listener.local_addr()?)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        match self {
            #[cfg(unix)]
            Listener::Unix { path, .. } => {
                if let Err(e) = std::fs::remove_file(&*path)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
            Listener::Tcp(_) => {}
        }
    }
}

/// Connected local stream.
#[derive(Debug)]
pub enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub async fn connect(address: &ControlAddress) -> io::Result<Self> {
        match address {
            #[cfg(unix)]
            ControlAddress::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            ControlAddress::Unix(_) => Err(unix_unsupported()),
            ControlAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Randomized pause between connection attempts (0.5–1 ms).
fn retry_pause() -> Duration {
    Duration::from_micros(rand::rng().random_range(500..=1000))
}

/// Connect to `address`, retrying up to [`CONNECT_ATTEMPTS`] times.
pub async fn connect_with_retry(address: &ControlAddress) -> Result<Stream, TransportError> {
    let mut attempt = 1;
    loop {
        match Stream::connect(address).await {
            Ok(stream) => return Ok(stream),
            Err(source) if attempt >= CONNECT_ATTEMPTS => {
                return Err(TransportError::Connect {
                    address: address.clone(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                tracing::trace!(%address, attempt, error = %e, "Connect failed, retrying");
                attempt += 1;
                tokio::time::sleep(retry_pause()).await;
            }
        }
    }
}
