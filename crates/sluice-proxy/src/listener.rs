//! Accepting sockets, with optional re-entry of already established
//! connections.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};

use crate::error::{ProxyError, Result};

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed client connection.
pub type BoxedStream = Box<dyn AsyncStream>;

/// TLS state of a connection terminated by the proxy itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// SNI sent by the client, if any.
    pub server_name: Option<String>,
}

/// Per-connection facts attached to every request served on it.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub remote_addr: SocketAddr,
    pub tls: Option<TlsInfo>,
}

/// Client address of a request for log lines, `-` when unknown.
pub(crate) fn remote_addr<B>(req: &http::Request<B>) -> String {
    req.extensions()
        .get::<ConnInfo>()
        .map(|c| c.remote_addr.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// A connection ready to be served.
pub struct Accepted {
    pub stream: BoxedStream,
    pub remote_addr: SocketAddr,
    pub tls: Option<TlsInfo>,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("remote_addr", &self.remote_addr)
            .field("tls", &self.tls)
            .finish()
    }
}

impl Accepted {
    pub fn info(&self) -> ConnInfo {
        ConnInfo {
            remote_addr: self.remote_addr,
            tls: self.tls.clone(),
        }
    }
}

/// Re-entry of an established connection into an accept loop.
pub trait ConnInjector: Send + Sync {
    fn add(&self, conn: Accepted) -> Result<()>;
}

/// The accepting side as seen by filters.
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// The re-entry capability, when this listener has one.
    fn injector(&self) -> Option<&dyn ConnInjector> {
        None
    }
}

/// TCP listener whose accept loop also yields injected connections.
pub struct ProxyListener {
    inner: TcpListener,
    reinject: bool,
    injected_tx: mpsc::UnboundedSender<Accepted>,
    injected_rx: Mutex<mpsc::UnboundedReceiver<Accepted>>,
}

impl fmt::Debug for ProxyListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyListener")
            .field("addr", &self.inner.local_addr().ok())
            .field("reinject", &self.reinject)
            .finish()
    }
}

impl ProxyListener {
    /// Binds to `addr`. With `reinject` off the listener exposes no injector
    /// and intercepted connections come back through a loopback dial.
    pub async fn bind(addr: impl ToSocketAddrs, reinject: bool) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let (injected_tx, injected_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner,
            reinject,
            injected_tx,
            injected_rx: Mutex::new(injected_rx),
        })
    }

    /// Waits for the next TCP connection or injected connection.
    pub async fn accept(&self) -> io::Result<Accepted> {
        let mut injected = self.injected_rx.lock().await;
        tokio::select! {
            Some(conn) = injected.recv() => Ok(conn),
            res = self.inner.accept() => {
                let (stream, remote_addr) = res?;
                stream.set_nodelay(true)?;
                Ok(Accepted {
                    stream: Box::new(stream),
                    remote_addr,
                    tls: None,
                })
            }
        }
    }
}

impl Listener for ProxyListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn injector(&self) -> Option<&dyn ConnInjector> {
        self.reinject.then_some(self as &dyn ConnInjector)
    }
}

impl ConnInjector for ProxyListener {
    fn add(&self, conn: Accepted) -> Result<()> {
        self.injected_tx
            .send(conn)
            .map_err(|_| ProxyError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "listener closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn accepts_tcp_connections() {
        let listener = ProxyListener::bind("127.0.0.1:0", true).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let mut accepted = listener.accept().await.unwrap();
        assert!(accepted.tls.is_none());
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn injected_connections_are_accepted() {
        let listener = ProxyListener::bind("127.0.0.1:0", true).await.unwrap();
        let (ours, _theirs) = tokio::io::duplex(64);
        let injector = listener.injector().expect("reinjection enabled");
        injector
            .add(Accepted {
                stream: Box::new(ours),
                remote_addr: "10.0.0.7:5555".parse().unwrap(),
                tls: Some(TlsInfo {
                    server_name: Some("example.com".into()),
                }),
            })
            .unwrap();

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.remote_addr.port(), 5555);
        assert_eq!(
            accepted.info().tls.and_then(|t| t.server_name).as_deref(),
            Some("example.com")
        );
    }

    #[tokio::test]
    async fn reinjection_can_be_disabled() {
        let listener = ProxyListener::bind("127.0.0.1:0", false).await.unwrap();
        assert!(listener.injector().is_none());
    }
}
