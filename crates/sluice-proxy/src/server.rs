//! Proxy server.
//!
//! Accepts client connections (and connections re-entered by the TLS
//! interceptor), serves each one with hyper's HTTP/1.1 server in its own
//! task, and hands every request to the [`ProxyHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::sync::broadcast;

use crate::body::boxed;
use crate::error::Result;
use crate::handler::ProxyHandler;
use crate::listener::{Accepted, Listener, ProxyListener};
use crate::sink::HyperSink;

/// The proxy server.
#[derive(Debug)]
pub struct ProxyServer {
    listener: Arc<ProxyListener>,
    handler: ProxyHandler,
}

impl ProxyServer {
    pub fn new(listener: ProxyListener, handler: ProxyHandler) -> Self {
        Self {
            listener: Arc::new(listener),
            handler,
        }
    }

    /// Binds a listener on `addr` and wraps it in a server.
    pub async fn bind(addr: SocketAddr, reinject: bool, handler: ProxyHandler) -> Result<Self> {
        let listener = ProxyListener::bind(addr, reinject).await?;
        Ok(Self::new(listener, handler))
    }

    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop.
    ///
    /// This will block until the process exits.
    pub async fn run(self) -> Result<()> {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        tracing::info!("Starting proxy on {}", self.addr()?);
        accept_loop(self.listener, self.handler, shutdown_rx).await;
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let addr = self.addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        tracing::info!("Starting proxy on {}", addr);

        let handle = tokio::spawn(accept_loop(self.listener, self.handler, shutdown_rx));

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

async fn accept_loop(
    listener: Arc<ProxyListener>,
    handler: ProxyHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(serve_connection(listener.clone(), handler.clone(), conn));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::info!("Proxy shutdown signal received");
                break;
            }
        }
    }
    tracing::info!("Proxy server stopped");
}

/// Serves every request on one client connection.
pub async fn serve_connection(listener: Arc<ProxyListener>, handler: ProxyHandler, conn: Accepted) {
    let info = conn.info();
    let remote = conn.remote_addr;
    tracing::debug!("{} connected (tls: {})", remote, info.tls.is_some());

    let service = service_fn(move |mut req: http::Request<Incoming>| {
        let listener = listener.clone() as Arc<dyn Listener>;
        let handler = handler.clone();
        let info = info.clone();
        async move {
            req.extensions_mut().insert(info);
            let mut sink = HyperSink::for_request(&mut req);
            handler.handle(listener, &mut sink, req.map(boxed)).await;
            sink.into_reply()
        }
    });

    if let Err(e) = http1::Builder::new()
        .auto_date_header(false)
        .serve_connection(TokioIo::new(conn.stream), service)
        .with_upgrades()
        .await
    {
        tracing::debug!("{} connection ended: {}", remote, e);
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
