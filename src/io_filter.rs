use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::ConnectionError;

/// A connection's socket behind the configured I/O filter: either the bare TCP stream or
///  the stream wrapped in TLS. The TLS handshake runs once, when the filter is applied;
///  after that, reads and writes see plaintext on this side and records on the wire.
pub enum FilteredStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl FilteredStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            FilteredStream::Plain(s) => s.peer_addr(),
            FilteredStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            FilteredStream::Plain(s) => s.local_addr(),
            FilteredStream::Tls(s) => s.get_ref().0.local_addr(),
        }
    }
}

impl AsyncRead for FilteredStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FilteredStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            FilteredStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FilteredStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FilteredStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            FilteredStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FilteredStream::Plain(s) => Pin::new(s).poll_flush(cx),
            FilteredStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FilteredStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            FilteredStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Applies the configured filter to new sockets, on both the initiating and the accepting
///  side. A TLS handshake failure is an authentication failure: fatal, never retried.
#[derive(Clone)]
pub struct SocketFilterFactory {
    tls: Option<TlsConfig>,
}

impl SocketFilterFactory {
    pub fn new(tls: Option<TlsConfig>) -> SocketFilterFactory {
        SocketFilterFactory { tls }
    }

    pub async fn connect(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<FilteredStream, ConnectionError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)))??;
        stream.set_nodelay(true)?;

        match &self.tls {
            None => Ok(FilteredStream::Plain(stream)),
            Some(tls) => {
                let connector = TlsConnector::from(tls.client.clone());
                // cluster peers are addressed by IP, so that is what the certificate must name
                let server_name = ServerName::IpAddress(addr.ip().into());
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ConnectionError::TlsAuthentication { addr, reason: e.to_string() })?;
                debug!("TLS established to {}", addr);
                Ok(FilteredStream::Tls(Box::new(tls_stream.into())))
            }
        }
    }

    pub async fn accept(&self, stream: TcpStream) -> Result<FilteredStream, ConnectionError> {
        let addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        match &self.tls {
            None => Ok(FilteredStream::Plain(stream)),
            Some(tls) => {
                let acceptor = TlsAcceptor::from(tls.server.clone());
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ConnectionError::TlsAuthentication { addr, reason: e.to_string() })?;
                debug!("TLS established from {}", addr);
                Ok(FilteredStream::Tls(Box::new(tls_stream.into())))
            }
        }
    }
}

/// The I/O errors a closing peer produces in the normal course of events. They are logged
///  at debug and fed into the reconnect loop instead of being reported as failures.
pub fn is_ignorable_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[rstest]
    #[case::reset(io::ErrorKind::ConnectionReset, true)]
    #[case::aborted(io::ErrorKind::ConnectionAborted, true)]
    #[case::broken_pipe(io::ErrorKind::BrokenPipe, true)]
    #[case::eof(io::ErrorKind::UnexpectedEof, true)]
    #[case::refused(io::ErrorKind::ConnectionRefused, false)]
    #[case::timed_out(io::ErrorKind::TimedOut, false)]
    fn test_ignorable_classification(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_ignorable_io_error(&io::Error::from(kind)), expected);
    }

    #[tokio::test]
    async fn test_plain_filter_is_passthrough() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let factory = SocketFilterFactory::new(None);

        let accept_side = tokio::spawn({
            let factory = factory.clone();
            async move {
                let (stream, _) = listener.accept().await.unwrap();
                factory.accept(stream).await.unwrap()
            }
        });

        let mut client = factory.connect(addr, Duration::from_secs(5)).await.unwrap();
        let mut server = accept_side.await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut read_back = [0u8; 4];
        server.read_exact(&mut read_back).await.unwrap();
        assert_eq!(&read_back, b"ping");
    }
}
