//! Hop-by-hop header removal.

use async_trait::async_trait;
use http::header::{HeaderName, CONNECTION};
use http::HeaderMap;

use crate::body::ProxyResponse;
use crate::context::RequestContext;
use crate::error::Result;
use crate::filter::ResponseFilter;

/// Headers that only concern a single connection.
pub const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Response filter registered as `hopheaders`.
#[derive(Debug, Default)]
pub struct HopHeadersFilter;

#[async_trait]
impl ResponseFilter for HopHeadersFilter {
    fn name(&self) -> &str {
        "hopheaders"
    }

    async fn response(
        &self,
        _ctx: &mut RequestContext<'_>,
        mut resp: ProxyResponse,
    ) -> Result<Option<ProxyResponse>> {
        strip_hop_headers(resp.headers_mut());
        Ok(Some(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::empty;
    use crate::testing::{NullListener, RecordingSink};
    use http::HeaderValue;

    #[test]
    fn strips_fixed_and_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        strip_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["content-type"], "text/html");
    }

    #[tokio::test]
    async fn filter_keeps_the_response() {
        let mut sink = RecordingSink::default();
        let req = http::Request::new(empty());
        let mut ctx = RequestContext::new(NullListener::shared(), &mut sink, &req);

        let resp = http::Response::builder()
            .header("upgrade", "h2c")
            .header("etag", "\"1\"")
            .body(empty())
            .unwrap();
        let out = HopHeadersFilter
            .response(&mut ctx, resp)
            .await
            .unwrap()
            .unwrap();
        assert!(out.headers().get("upgrade").is_none());
        assert_eq!(out.headers()["etag"], "\"1\"");
    }
}
