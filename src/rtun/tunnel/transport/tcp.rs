use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::rtun::{
    net,
    tunnel::transport::{BoxedStream, DialOptions, Transport, TransportListener},
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(addr.as_ref())
            .await
            .with_context(|| format!("tcp: listen {addr}"))?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str, opts: DialOptions) -> anyhow::Result<BoxedStream> {
        let c = match opts.bind_addr {
            None => TcpStream::connect(addr).await?,
            Some(local) => {
                let remote = net::resolve_one(addr, local.is_ipv4()).await?;
                let sock = if local.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                sock.set_reuseaddr(true)?;
                sock.bind(local)
                    .with_context(|| format!("tcp: bind {local}"))?;
                sock.connect(remote).await?
            }
        };
        c.set_nodelay(true)?;
        Ok(Box::new(c))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok((Box::new(c), peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn write_shutdown_is_a_half_close() {
        let tr = TcpTransport::new();
        let ln = tr.listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut got = Vec::new();
            s.read_to_end(&mut got).await.unwrap();
            // Our read side saw EOF but the write side still works.
            s.write_all(&got).await.unwrap();
            s.shutdown().await.unwrap();
        });

        let c = tr.dial(&addr, DialOptions::default()).await.unwrap();
        let (mut r, mut w) = tokio::io::split(c);
        w.write_all(b"half").await.unwrap();
        w.shutdown().await.unwrap();

        let mut back = Vec::new();
        r.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"half");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_from_a_fixed_local_address() {
        let tr = TcpTransport::new();
        let ln = tr.listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();

        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let _c = tr
            .dial(&addr, DialOptions { bind_addr: Some(local) })
            .await
            .unwrap();
        let (_s, peer) = ln.accept().await.unwrap();
        assert_eq!(peer.ip(), local.ip());
    }
}
