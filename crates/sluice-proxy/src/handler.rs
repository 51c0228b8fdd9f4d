//! Request handling through the filter stages.
//!
//! Each request runs the request filters, then the round-trip filters until
//! one answers, then the response filters, and finally the response is
//! written to the client. A hijack or an error at any point ends the request.

use std::sync::Arc;

use http::uri::{PathAndQuery, Scheme};
use http::{Method, Uri};
use http_body_util::BodyExt;

use crate::body::{OriginalRequest, ProxyRequest};
use crate::context::RequestContext;
use crate::error::ProxyError;
use crate::filter::{FilterChain, RoundTrip};
use crate::listener::{remote_addr, ConnInfo, Listener};
use crate::sink::ResponseSink;

/// Drives requests through a [`FilterChain`].
#[derive(Debug, Clone, Default)]
pub struct ProxyHandler {
    chain: Arc<FilterChain>,
}

impl ProxyHandler {
    pub fn new(chain: FilterChain) -> Self {
        Self {
            chain: Arc::new(chain),
        }
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// Handles one request. The only effect is what reaches `sink`: a full
    /// response, a hijack, or nothing at all.
    pub async fn handle(
        &self,
        listener: Arc<dyn Listener>,
        sink: &mut dyn ResponseSink,
        mut req: ProxyRequest,
    ) {
        let remote = remote_addr(&req);
        normalize_url(&mut req);
        let mut ctx = RequestContext::new(listener, sink, &req);

        for f in &self.chain.request {
            let result = f.request(&mut ctx, req).await;
            if ctx.hijacked() {
                return;
            }
            req = match result {
                Ok(req) => req,
                Err(ProxyError::EndOfStream) => return,
                Err(e) => {
                    tracing::error!("{} request filter {} failed: {}", remote, f.name(), e);
                    return;
                }
            };
        }

        let original = OriginalRequest::of(&req);
        let mut resp = None;
        for f in &self.chain.round_trip {
            let result = f.round_trip(&mut ctx, req).await;
            if ctx.hijacked() {
                return;
            }
            match result {
                Ok(RoundTrip::Pass(r)) => req = r,
                Ok(RoundTrip::Response(mut r)) => {
                    r.extensions_mut().insert(original.clone());
                    resp = Some(r);
                    break;
                }
                Err(e) => {
                    tracing::error!("{} round-trip filter {} failed: {}", remote, f.name(), e);
                    return;
                }
            }
        }

        let Some(mut resp) = resp else {
            tracing::debug!("{} no round-trip filter answered {}", remote, original.uri);
            return;
        };

        for f in &self.chain.response {
            resp = match f.response(&mut ctx, resp).await {
                Ok(Some(r)) => r,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("{} response filter {} failed: {}", remote, f.name(), e);
                    return;
                }
            };
        }

        let (parts, body) = resp.into_parts();
        let copy_remote = remote.clone();
        let body = body
            .map_err(move |e| {
                tracing::error!("{} copying response body failed: {}", copy_remote, e);
                e
            })
            .boxed();
        if let Err(e) = ctx.sink().write_response(http::Response::from_parts(parts, body)) {
            tracing::error!("{} writing response failed: {}", remote, e);
        }
    }
}

/// Turns an origin-form target into an absolute URL so transparent and
/// explicit proxying look the same to filters.
///
/// Connections the proxy terminated TLS on get `https` and the `Host`
/// header, or the SNI name when there is none; plaintext gets `http` and
/// the `Host` header.
pub fn normalize_url(req: &mut ProxyRequest) {
    if req.method() == Method::CONNECT || req.uri().scheme().is_some() {
        return;
    }

    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_string);
    let tls = req
        .extensions()
        .get::<ConnInfo>()
        .and_then(|c| c.tls.clone());

    let (scheme, authority) = match tls {
        Some(tls) => (Scheme::HTTPS, host.or(tls.server_name)),
        None => (Scheme::HTTP, host),
    };
    let Some(authority) = authority else {
        return;
    };

    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    match Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path)
        .build()
    {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => tracing::debug!("cannot absolutize {} with host {}: {}", req.uri(), authority, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use http::StatusCode;

    use crate::body::{empty, ProxyResponse};
    use crate::error::Result;
    use crate::filter::{Filter, RequestFilter, ResponseFilter, RoundTripFilter};
    use crate::listener::TlsInfo;
    use crate::testing::{NullListener, RecordingSink};

    #[derive(Default)]
    struct Calls(AtomicUsize);

    impl Calls {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    enum Act {
        Pass,
        Hijack,
        Fail,
        EndOfStream,
        Answer(StatusCode),
        Drop,
    }

    struct Stub {
        act: Act,
        calls: Arc<Calls>,
    }

    fn stub(act: Act) -> (Arc<Stub>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        (
            Arc::new(Stub {
                act,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[async_trait]
    impl RequestFilter for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn request(
            &self,
            ctx: &mut RequestContext<'_>,
            req: ProxyRequest,
        ) -> Result<ProxyRequest> {
            self.calls.hit();
            match self.act {
                Act::Hijack => {
                    ctx.sink().hijack()?;
                    ctx.set_hijacked(true);
                    Ok(req)
                }
                Act::Fail => Err(ProxyError::Client("boom".into())),
                Act::EndOfStream => Err(ProxyError::EndOfStream),
                _ => Ok(req),
            }
        }
    }

    #[async_trait]
    impl RoundTripFilter for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn round_trip(
            &self,
            _ctx: &mut RequestContext<'_>,
            req: ProxyRequest,
        ) -> Result<RoundTrip> {
            self.calls.hit();
            match self.act {
                Act::Answer(status) => Ok(RoundTrip::Response(
                    http::Response::builder().status(status).body(empty())?,
                )),
                Act::Fail => Err(ProxyError::Client("upstream down".into())),
                _ => Ok(RoundTrip::Pass(req)),
            }
        }
    }

    #[async_trait]
    impl ResponseFilter for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn response(
            &self,
            _ctx: &mut RequestContext<'_>,
            mut resp: ProxyResponse,
        ) -> Result<Option<ProxyResponse>> {
            self.calls.hit();
            match self.act {
                Act::Drop => Ok(None),
                Act::Fail => Err(ProxyError::Client("bad response".into())),
                _ => {
                    resp.headers_mut()
                        .insert("x-seen", http::HeaderValue::from_static("1"));
                    Ok(Some(resp))
                }
            }
        }
    }

    fn get(uri: &str) -> ProxyRequest {
        http::Request::builder().uri(uri).body(empty()).unwrap()
    }

    async fn run(chain: FilterChain, req: ProxyRequest) -> RecordingSink {
        let handler = ProxyHandler::new(chain);
        let mut sink = RecordingSink::default();
        handler.handle(NullListener::shared(), &mut sink, req).await;
        sink
    }

    #[test]
    fn handler_exposes_its_chain() {
        assert!(ProxyHandler::default().chain().is_empty());

        let (f, _) = stub(Act::Pass);
        let handler = ProxyHandler::new(
            FilterChain::new()
                .with(Filter::Request(f.clone()))
                .with(Filter::Response(f)),
        );
        assert!(!handler.chain().is_empty());
        assert_eq!(handler.chain().request.len(), 1);
        assert!(handler.chain().round_trip.is_empty());
        assert_eq!(handler.chain().response.len(), 1);
    }

    #[tokio::test]
    async fn hijack_stops_every_later_stage() {
        let (hijacker, _) = stub(Act::Hijack);
        let (later_req, later_req_calls) = stub(Act::Pass);
        let (rt, rt_calls) = stub(Act::Answer(StatusCode::OK));
        let (resp_f, resp_calls) = stub(Act::Pass);
        let chain = FilterChain::new()
            .with(Filter::Request(hijacker))
            .with(Filter::Request(later_req))
            .with(Filter::RoundTrip(rt))
            .with(Filter::Response(resp_f));

        let sink = run(chain, get("http://example.com/")).await;
        assert!(sink.response.is_none());
        assert!(sink.client.is_some());
        assert_eq!(later_req_calls.count(), 0);
        assert_eq!(rt_calls.count(), 0);
        assert_eq!(resp_calls.count(), 0);
    }

    #[tokio::test]
    async fn request_error_aborts() {
        for act in [Act::Fail, Act::EndOfStream] {
            let (failing, _) = stub(act);
            let (rt, rt_calls) = stub(Act::Answer(StatusCode::OK));
            let chain = FilterChain::new()
                .with(Filter::Request(failing))
                .with(Filter::RoundTrip(rt));

            let sink = run(chain, get("http://example.com/")).await;
            assert!(sink.response.is_none());
            assert_eq!(rt_calls.count(), 0);
        }
    }

    #[tokio::test]
    async fn round_trip_error_skips_response_filters() {
        let (rt, _) = stub(Act::Fail);
        let (resp_f, resp_calls) = stub(Act::Pass);
        let chain = FilterChain::new()
            .with(Filter::RoundTrip(rt))
            .with(Filter::Response(resp_f));

        let sink = run(chain, get("http://example.com/")).await;
        assert!(sink.response.is_none());
        assert_eq!(resp_calls.count(), 0);
    }

    #[tokio::test]
    async fn first_answer_wins() {
        let (pass, pass_calls) = stub(Act::Pass);
        let (answer, _) = stub(Act::Answer(StatusCode::CREATED));
        let (never, never_calls) = stub(Act::Answer(StatusCode::IM_A_TEAPOT));
        let (resp_f, resp_calls) = stub(Act::Pass);
        let chain = FilterChain::new()
            .with(Filter::RoundTrip(pass))
            .with(Filter::RoundTrip(answer))
            .with(Filter::RoundTrip(never))
            .with(Filter::Response(resp_f));

        let sink = run(chain, get("http://example.com/page")).await;
        let resp = sink.response.expect("a response was written");
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-seen"], "1");
        let original = resp.extensions().get::<OriginalRequest>().unwrap();
        assert_eq!(original.uri, "http://example.com/page");
        assert_eq!(pass_calls.count(), 1);
        assert_eq!(never_calls.count(), 0);
        assert_eq!(resp_calls.count(), 1);
    }

    #[tokio::test]
    async fn dropped_response_writes_nothing() {
        let (answer, _) = stub(Act::Answer(StatusCode::OK));
        let (dropper, _) = stub(Act::Drop);
        let (after, after_calls) = stub(Act::Pass);
        let chain = FilterChain::new()
            .with(Filter::RoundTrip(answer))
            .with(Filter::Response(dropper))
            .with(Filter::Response(after));

        let sink = run(chain, get("http://example.com/")).await;
        assert!(sink.response.is_none());
        assert_eq!(after_calls.count(), 0);
    }

    #[tokio::test]
    async fn no_answer_writes_nothing() {
        let (pass, _) = stub(Act::Pass);
        let chain = FilterChain::new().with(Filter::RoundTrip(pass));
        let sink = run(chain, get("http://example.com/")).await;
        assert!(sink.response.is_none());
        assert!(sink.client.is_none());
    }

    #[test]
    fn plaintext_relative_url_uses_host_header() {
        let mut req = http::Request::builder()
            .uri("/a?b=1")
            .header("host", "example.com:8080")
            .body(empty())
            .unwrap();
        normalize_url(&mut req);
        assert_eq!(req.uri(), "http://example.com:8080/a?b=1");
    }

    #[test]
    fn tls_relative_url_falls_back_to_sni() {
        let mut req = http::Request::builder().uri("/x").body(empty()).unwrap();
        req.extensions_mut().insert(ConnInfo {
            remote_addr: "127.0.0.1:5000".parse().unwrap(),
            tls: Some(TlsInfo {
                server_name: Some("secure.example.com".into()),
            }),
        });
        normalize_url(&mut req);
        assert_eq!(req.uri(), "https://secure.example.com/x");
    }

    #[test]
    fn absolute_and_connect_targets_are_left_alone() {
        let mut req = get("http://other.example/");
        req.headers_mut()
            .insert("host", http::HeaderValue::from_static("example.com"));
        normalize_url(&mut req);
        assert_eq!(req.uri(), "http://other.example/");

        let mut req = http::Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(empty())
            .unwrap();
        normalize_url(&mut req);
        assert_eq!(req.uri(), "example.com:443");
    }
}
