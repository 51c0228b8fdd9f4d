//! Test doubles shared by the unit tests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tokio::io::DuplexStream;

use crate::body::ProxyResponse;
use crate::error::{ProxyError, Result};
use crate::listener::{Accepted, ConnInjector, Listener};
use crate::sink::{Hijacked, ResponseSink};

/// A listener that accepts nothing and cannot re-inject.
#[derive(Debug, Default)]
pub struct NullListener;

impl NullListener {
    pub fn shared() -> Arc<dyn Listener> {
        Arc::new(NullListener)
    }
}

impl Listener for NullListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

/// Sink that records what the handler did with it.
#[derive(Default)]
pub struct RecordingSink {
    pub response: Option<ProxyResponse>,
    /// Client end of a hijacked connection.
    pub client: Option<DuplexStream>,
    pub refuse_hijack: bool,
}

impl ResponseSink for RecordingSink {
    fn write_response(&mut self, resp: ProxyResponse) -> Result<()> {
        if self.response.is_some() || self.client.is_some() {
            return Err(ProxyError::AlreadyAnswered);
        }
        self.response = Some(resp);
        Ok(())
    }

    fn hijack(&mut self) -> Result<Hijacked> {
        if self.refuse_hijack {
            return Err(ProxyError::HijackUnsupported);
        }
        if self.response.is_some() || self.client.is_some() {
            return Err(ProxyError::AlreadyAnswered);
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.client = Some(client);
        Ok(Hijacked::ready(Box::new(server)))
    }
}

/// Listener that captures injected connections.
#[derive(Default)]
pub struct CapturingListener {
    pub injected: parking_lot::Mutex<Vec<Accepted>>,
}

impl Listener for CapturingListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn injector(&self) -> Option<&dyn ConnInjector> {
        Some(self)
    }
}

impl ConnInjector for CapturingListener {
    fn add(&self, conn: Accepted) -> Result<()> {
        self.injected.lock().push(conn);
        Ok(())
    }
}

/// Client TLS config trusting only `root`.
pub fn tls_client_config(root: &CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root.clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    Arc::new(config)
}
