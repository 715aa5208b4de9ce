use crate::C2Error;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::UnixStream;

pub trait SubstrateIo: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite + ?Sized> SubstrateIo for T {}

pub type SubstrateStream = Box<dyn SubstrateIo + Unpin + Send>;

/// Where the minimega control socket lives.
#[derive(Clone, Debug)]
pub enum SubstrateSocket {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl SubstrateSocket {
    /// Parse `host:port` as TCP, anything else as a Unix socket path.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Self::Tcp(addr);
        }

        #[cfg(unix)]
        {
            Self::Unix(PathBuf::from(value))
        }

        #[cfg(not(unix))]
        {
            Self::Tcp(SocketAddr::from(([127, 0, 0, 1], 9000)))
        }
    }
}

impl std::fmt::Display for SubstrateSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            SubstrateSocket::Unix(path) => write!(f, "{}", path.display()),
            SubstrateSocket::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// Connect to the control socket.
///
/// # Errors
/// Returns `C2Error::Substrate` if the socket cannot be opened.
pub async fn connect_substrate_socket(socket: &SubstrateSocket) -> Result<SubstrateStream, C2Error> {
    match socket {
        #[cfg(unix)]
        SubstrateSocket::Unix(path) => UnixStream::connect(path)
            .await
            .map(|stream| Box::new(stream) as SubstrateStream)
            .map_err(|e| C2Error::Substrate(format!("failed to connect to {socket}: {e}"))),
        SubstrateSocket::Tcp(addr) => TcpStream::connect(addr)
            .await
            .map(|stream| Box::new(stream) as SubstrateStream)
            .map_err(|e| C2Error::Substrate(format!("failed to connect to {socket}: {e}"))),
    }
}
