//! TLS interception of selected CONNECT tunnels.
//!
//! For a matching CONNECT the client connection is hijacked, a leaf for the
//! target host is taken from the cache or issued, and the proxy completes the
//! TLS handshake itself. The decrypted connection then re-enters the accept
//! loop, either directly through the listener's injector or through a
//! loopback connection spliced to it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::HOST;
use http::Method;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use sluice_storage::Store;

use crate::body::ProxyRequest;
use crate::ca::CertificateAuthority;
use crate::cert_cache::CertificateCache;
use crate::config::StripSslConfig;
use crate::context::RequestContext;
use crate::error::{ProxyError, Result};
use crate::filter::RequestFilter;
use crate::listener::{Accepted, ConnInfo, Listener, TlsInfo};
use crate::sink::Hijacked;
use crate::sites::{strip_port, SiteMatchList};
use crate::splice::splice;

/// Certificate common name for a CONNECT host.
///
/// The port is dropped and the name lower-cased. With `wildcard` set, a
/// name of three or more labels becomes `*.` plus its parent domain.
pub fn common_name(host: &str, wildcard: bool) -> String {
    let host = strip_port(host).to_ascii_lowercase();
    if !wildcard || host.parse::<IpAddr>().is_ok() {
        return host;
    }
    match host.split_once('.') {
        Some((_, parent)) if parent.contains('.') => format!("*.{parent}"),
        _ => host,
    }
}

/// Serves one already chosen certificate.
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

struct Shared {
    ca: CertificateAuthority,
    cache: CertificateCache,
    validity: Duration,
    key_bits: u32,
    wildcard_names: bool,
    handshake_timeout: Duration,
    provider: Arc<CryptoProvider>,
    client_verifier: Arc<dyn rustls::server::danger::ClientCertVerifier>,
}

impl Shared {
    /// Cached leaf for `name`, issuing and caching a new one on a miss.
    ///
    /// Concurrent misses for one name may each issue; the last one stays
    /// cached.
    fn certificate_for(&self, name: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(cert) = self.cache.get(name) {
            return Ok(cert);
        }
        info!("Generating certificate for {}", name);
        let validity = self.ca.leaf_validity(self.validity)?;
        let cert = self.ca.issue(name, validity, self.key_bits)?;
        let expires_at = Instant::now()
            .checked_add(validity)
            .ok_or_else(|| ProxyError::Config(format!("certificate validity {validity:?} out of range")))?;
        self.cache.set(name, cert.clone(), expires_at);
        Ok(cert)
    }

    fn server_config(&self, cert: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(self.client_verifier.clone())
            .with_cert_resolver(Arc::new(FixedCert(cert)));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    async fn intercept(
        self: Arc<Self>,
        hijacked: Hijacked,
        listener: Arc<dyn Listener>,
        host: String,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let name = common_name(&host, self.wildcard_names);
        let shared = self.clone();
        let cert = tokio::task::spawn_blocking(move || shared.certificate_for(&name))
            .await
            .map_err(|e| ProxyError::Tls(format!("certificate task failed: {e}")))??;
        let config = self.server_config(cert)?;

        let stream = hijacked.into_stream().await?;
        let tls = tokio::time::timeout(self.handshake_timeout, TlsAcceptor::from(config).accept(stream))
            .await
            .map_err(|_| ProxyError::Tls(format!("handshake with {remote_addr} for {host} timed out")))?
            .map_err(|e| ProxyError::Tls(format!("handshake with {remote_addr} for {host}: {e}")))?;

        let server_name = tls.get_ref().1.server_name().map(str::to_string);
        debug!("{} TLS established for {} (sni {:?})", remote_addr, host, server_name);

        if let Some(injector) = listener.injector() {
            return injector.add(Accepted {
                stream: Box::new(tls),
                remote_addr,
                tls: Some(TlsInfo { server_name }),
            });
        }

        let upstream = TcpStream::connect(loopback(listener.local_addr()?)).await?;
        let stats = splice(tls, upstream).await;
        debug!(
            "{} loopback for {} closed ({} up, {} down)",
            remote_addr, host, stats.a_to_b, stats.b_to_a
        );
        Ok(())
    }
}

/// Where to dial the listener from inside the process.
fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

/// Request filter registered as `stripssl`.
#[derive(Clone)]
pub struct TlsInterceptor {
    sites: Arc<SiteMatchList>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TlsInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsInterceptor")
            .field("sites", &self.sites.len())
            .field("ca", &self.shared.ca)
            .field("cache", &self.shared.cache)
            .finish()
    }
}

impl TlsInterceptor {
    /// Builds the interceptor, loading or creating the root in `store`.
    pub fn new(config: &StripSslConfig, store: &dyn Store) -> Result<Self> {
        if config.root_ca.duration_secs == 0 {
            return Err(ProxyError::Config("stripssl: root_ca.duration_secs must be positive".into()));
        }
        let validity = Duration::from_secs(config.root_ca.duration_secs);
        let representable = time::Duration::try_from(validity)
            .ok()
            .and_then(|v| OffsetDateTime::now_utc().checked_add(v))
            .is_some()
            && Instant::now().checked_add(validity).is_some();
        if !representable {
            return Err(ProxyError::Config(format!(
                "stripssl: root_ca.duration_secs {} is out of range",
                config.root_ca.duration_secs
            )));
        }
        let sites = SiteMatchList::new(&config.sites)?;
        let ca = CertificateAuthority::load_or_create(store, &config.root_ca)?;
        ca.leaf_validity(validity)?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(ca.root_der().clone())?;
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|e| ProxyError::Tls(e.to_string()))?;

        Ok(Self {
            sites: Arc::new(sites),
            shared: Arc::new(Shared {
                key_bits: ca.key_bits(),
                ca,
                cache: CertificateCache::new(config.cache_shards, config.cache_capacity),
                validity,
                wildcard_names: config.wildcard_names,
                handshake_timeout: Duration::from_secs(config.handshake_timeout_secs.max(1)),
                provider,
                client_verifier,
            }),
        })
    }

    pub fn sites(&self) -> &SiteMatchList {
        &self.sites
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.shared.ca
    }

    /// Leaf for `host`, from the cache when still valid.
    pub fn certificate_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        self.shared
            .certificate_for(&common_name(host, self.shared.wildcard_names))
    }
}

fn connect_host(req: &ProxyRequest) -> Option<String> {
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
}

#[async_trait]
impl RequestFilter for TlsInterceptor {
    fn name(&self) -> &str {
        "stripssl"
    }

    async fn request(&self, ctx: &mut RequestContext<'_>, req: ProxyRequest) -> Result<ProxyRequest> {
        if req.method() != Method::CONNECT {
            return Ok(req);
        }
        let Some(host) = connect_host(&req) else {
            return Ok(req);
        };
        if !self.sites.matches(&host) {
            return Ok(req);
        }

        let hijacked = ctx.sink().hijack()?;
        ctx.set_hijacked(true);

        let remote_addr = req
            .extensions()
            .get::<ConnInfo>()
            .map(|c| c.remote_addr)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        info!("{} \"STRIP CONNECT {} {:?}\"", remote_addr, host, req.version());

        let listener = ctx.listener().clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.intercept(hijacked, listener, host.clone(), remote_addr).await {
                warn!("{} STRIP {} failed: {}", remote_addr, host, e);
            }
        });
        Ok(req)
    }
}
