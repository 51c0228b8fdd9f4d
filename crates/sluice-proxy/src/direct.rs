//! Fallback round-tripper that talks to origins itself.

use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::body::ProxyRequest;
use crate::client::HttpClient;
use crate::config::DirectConfig;
use crate::context::RequestContext;
use crate::error::{ProxyError, Result};
use crate::filter::{RoundTrip, RoundTripFilter};
use crate::hop::strip_hop_headers;
use crate::listener::remote_addr;
use crate::splice::splice;

/// Round-trip filter registered as `direct`.
///
/// Plain requests are forwarded to the origin. CONNECTs that nothing else
/// intercepted are tunnelled: the client connection is hijacked, the
/// authority dialed, and the two spliced together.
#[derive(Debug, Clone)]
pub struct DirectFilter {
    client: HttpClient,
    dial_timeout: Duration,
}

impl DirectFilter {
    pub fn new(config: &DirectConfig) -> Result<Self> {
        let dial_timeout = Duration::from_secs(config.dial_timeout_secs.max(1));
        Ok(Self {
            client: HttpClient::new(true, Some(dial_timeout))?,
            dial_timeout,
        })
    }

    fn tunnel(&self, ctx: &mut RequestContext<'_>, req: &ProxyRequest) -> Result<()> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::Client(format!("CONNECT without authority: {}", req.uri())))?;
        let remote = remote_addr(req);

        let hijacked = ctx.sink().hijack()?;
        ctx.set_hijacked(true);
        info!("{} \"CONNECT {}\"", remote, authority);

        let dial_timeout = self.dial_timeout;
        tokio::spawn(async move {
            let upstream =
                match tokio::time::timeout(dial_timeout, TcpStream::connect(&authority)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!("{} dial {} failed: {}", remote, authority, e);
                        return;
                    }
                    Err(_) => {
                        warn!("{} dial {} timed out", remote, authority);
                        return;
                    }
                };
            let client = match hijacked.into_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{} CONNECT {} upgrade failed: {}", remote, authority, e);
                    return;
                }
            };
            let _ = upstream.set_nodelay(true);
            let stats = splice(client, upstream).await;
            debug!(
                "{} tunnel {} closed ({} up, {} down)",
                remote, authority, stats.a_to_b, stats.b_to_a
            );
        });
        Ok(())
    }
}

#[async_trait]
impl RoundTripFilter for DirectFilter {
    fn name(&self) -> &str {
        "direct"
    }

    async fn round_trip(
        &self,
        ctx: &mut RequestContext<'_>,
        mut req: ProxyRequest,
    ) -> Result<RoundTrip> {
        if req.method() == Method::CONNECT {
            self.tunnel(ctx, &req)?;
            return Ok(RoundTrip::Pass(req));
        }

        strip_hop_headers(req.headers_mut());
        info!(
            "{} \"DIRECT {} {} {:?}\"",
            remote_addr(&req),
            req.method(),
            req.uri(),
            req.version()
        );
        let resp = self.client.send(req).await?;
        Ok(RoundTrip::Response(resp))
    }
}
