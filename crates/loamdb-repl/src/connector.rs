//! Outbound connection establishment.
//!
//! Workers dial destinations through this seam. Production uses plain TCP;
//! tests substitute in-process pipes with the same framing.

use async_trait::async_trait;
use tokio::net::TcpStream;

use loamdb_transport::{DynStream, TransportError};

use crate::error::Result;

/// Dials a destination URL and returns a framed byte stream.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to the given URL.
    async fn connect(&self, url: &str) -> Result<DynStream>;
}

/// Plain TCP connector. Accepts `tcp://host:port` or bare `host:port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &str) -> Result<DynStream> {
        let addr = url.strip_prefix("tcp://").unwrap_or(url);
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                }
            } else {
                TransportError::Io(e)
            }
        })?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        Ok(Box::new(stream))
    }
}
