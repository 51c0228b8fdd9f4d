//! Round-tripper that tunnels requests through remote fetch endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use http::{Method, Uri};
use tracing::{debug, info};

use crate::body::ProxyRequest;
use crate::client::HttpClient;
use crate::codec::{decode_response, encode_request};
use crate::config::{FetchConfig, FetchServerConfig};
use crate::context::RequestContext;
use crate::listener::remote_addr;
use crate::error::{ProxyError, Result};
use crate::filter::{RoundTrip, RoundTripFilter};

/// One configured fetch endpoint.
#[derive(Debug)]
pub struct FetchServer {
    pub url: Uri,
    password: String,
    client: HttpClient,
}

impl FetchServer {
    pub fn new(config: &FetchServerConfig) -> Result<Self> {
        let url: Uri = config
            .url
            .parse()
            .map_err(|e| ProxyError::Config(format!("fetch server url {:?}: {}", config.url, e)))?;
        if url.scheme().is_none() || url.authority().is_none() {
            return Err(ProxyError::Config(format!(
                "fetch server url {:?} must be absolute",
                config.url
            )));
        }
        Ok(Self {
            url,
            password: config.password.clone(),
            client: HttpClient::new(config.ssl_verify, None)?,
        })
    }

    /// Sends `req` through this endpoint and decodes the answer.
    pub async fn round_trip(&self, req: ProxyRequest) -> Result<crate::body::ProxyResponse> {
        let outer = encode_request(req, &self.url, &self.password).await?;
        let resp = self.client.send(outer).await?;
        decode_response(resp).await
    }
}

/// Round-trip filter registered as `fetch`.
///
/// Servers are used in turn. CONNECT requests are left to later filters.
#[derive(Debug)]
pub struct FetchFilter {
    servers: Vec<FetchServer>,
    next: AtomicUsize,
}

impl FetchFilter {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(ProxyError::Config("fetch: no servers configured".into()));
        }
        let servers = config
            .servers
            .iter()
            .map(FetchServer::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            servers,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> &FetchServer {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        &self.servers[i]
    }
}

#[async_trait]
impl RoundTripFilter for FetchFilter {
    fn name(&self) -> &str {
        "fetch"
    }

    async fn round_trip(
        &self,
        _ctx: &mut RequestContext<'_>,
        req: ProxyRequest,
    ) -> Result<RoundTrip> {
        if req.method() == Method::CONNECT {
            return Ok(RoundTrip::Pass(req));
        }

        let server = self.pick();
        info!(
            "{} \"FETCH {} {}\" via {}",
            remote_addr(&req),
            req.method(),
            req.uri(),
            server.url
        );
        let resp = server.round_trip(req).await?;
        debug!("fetch {} answered {}", server.url, resp.status());
        Ok(RoundTrip::Response(resp))
    }
}
