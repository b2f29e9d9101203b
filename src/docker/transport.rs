//! Connection plumbing between hyper and the engine socket.
//!
//! The engine listens on a unix domain socket by default, or on TCP when
//! `DOCKER_HOST` says `tcp://`. Hyper's client pools connections per
//! authority, so one `Transport` shared by every worker gives the single
//! underlying connection pool with many concurrent streams.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Uri;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// How to reach the engine. The request URIs carry a placeholder authority
/// for the unix case; only the TCP case dials what the URI names.
#[derive(Clone, Debug)]
pub enum Transport {
    Unix { socket: PathBuf },
    Tcp,
}

impl Service<Uri> for Transport {
    type Response = EngineStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<EngineStream, io::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let transport = self.clone();
        Box::pin(async move {
            match transport {
                Transport::Unix { socket } => {
                    let stream = UnixStream::connect(&socket).await?;
                    Ok(EngineStream::Unix(stream))
                }
                Transport::Tcp => {
                    let host = uri.host().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, "engine URI has no host")
                    })?;
                    let port = uri.port_u16().unwrap_or(2375);
                    let stream = TcpStream::connect((host, port)).await?;
                    Ok(EngineStream::Tcp(stream))
                }
            }
        })
    }
}

pub enum EngineStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Connection for EngineStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for EngineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            EngineStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EngineStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            EngineStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_flush(cx),
            EngineStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            EngineStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
