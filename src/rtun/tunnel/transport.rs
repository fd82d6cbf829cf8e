use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait. Shutting down the write side
/// must only close that direction (a TCP half-close), which every relay relies on.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub type StreamReader = tokio::io::ReadHalf<BoxedStream>;
pub type StreamWriter = tokio::io::WriteHalf<BoxedStream>;

#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Local address the connection originates from.
    pub bind_addr: Option<SocketAddr>,
}

/// Connector/listener pair for one kind of network.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str, opts: DialOptions) -> anyhow::Result<BoxedStream>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Next inbound stream with the peer's address.
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp)"),
    }
}

pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        _ => anyhow::bail!("tunnel: transport {n:?} is not available"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names_are_normalized() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" TCP ").unwrap(), "tcp");
        assert!(parse_transport("quic").is_err());
    }
}
