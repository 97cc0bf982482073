//! Backend connectors for the proxy.
//!
//! hyper pools connections per destination authority, so handing it these
//! connectors gives us connection reuse for free: one shared pool for the
//! local socket, one keyed by node for remote backends. The stream wrappers
//! exist because hyper wants its connector's streams to implement
//! [`Connection`].

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Uri;
use rudder_state::constants;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::rustls::{ClientConfig, ServerName};
use tokio_rustls::TlsConnector;

/// Connector that ignores the request URI and always dials the one local
/// UNIX socket.
#[derive(Clone)]
pub(crate) struct UdsConnector {
    path: Arc<PathBuf>,
}

impl UdsConnector {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        UdsConnector {
            path: Arc::new(path.into()),
        }
    }
}

impl Service<Uri> for UdsConnector {
    type Response = UdsStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<UdsStream, io::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.path.clone();

        Box::pin(async move { Ok(UdsStream(UnixStream::connect(path.as_ref()).await?)) })
    }
}

pub(crate) struct UdsStream(UnixStream);

impl Connection for UdsStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for UdsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UdsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Connector dialing other nodes. With a client configuration every
/// connection is mutually-authenticated TLS sharing that one configuration;
/// without one, connections go over plain TCP (sockets behind a trusted
/// transport, tests).
#[derive(Clone)]
pub(crate) struct RemoteConnector {
    tls: Option<TlsConnector>,
}

impl RemoteConnector {
    pub(crate) fn new(client_config: Option<Arc<ClientConfig>>) -> Self {
        RemoteConnector {
            tls: client_config.map(TlsConnector::from),
        }
    }
}

impl Service<Uri> for RemoteConnector {
    type Response = RemoteStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<RemoteStream, io::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "uri has no host"))?
                .to_string();
            let port = uri.port_u16().unwrap_or(constants::APID_PORT);

            let tcp = TcpStream::connect((host.as_str(), port)).await?;

            match tls {
                Some(tls) => {
                    let server_name = ServerName::try_from(host.as_str()).map_err(|err| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("invalid server name {:?}: {}", host, err),
                        )
                    })?;

                    Ok(RemoteStream::Tls(tls.connect(server_name, tcp).await?))
                }
                None => Ok(RemoteStream::Plain(tcp)),
            }
        })
    }
}

pub(crate) enum RemoteStream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl Connection for RemoteStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for RemoteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            RemoteStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RemoteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            RemoteStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            RemoteStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            RemoteStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
