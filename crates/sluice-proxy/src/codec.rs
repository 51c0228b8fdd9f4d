//! Wire format of the remote fetch tunnel.
//!
//! A tunnelled request is a POST whose body is a 16-bit big-endian length,
//! a raw-deflate compressed request head of that length, and then the
//! original request body. A successful answer has the same framing around a
//! response head; anything other than `200` is the endpoint speaking for
//! itself and is passed through.

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use futures::{stream, StreamExt, TryStreamExt};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, USER_AGENT};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use http_body::{Body as _, Frame};
use http_body_util::{BodyExt, StreamBody};

use crate::body::{full, BoxError, ProxyRequest, ProxyResponse};
use crate::error::{ProxyError, Result};

/// Headers never copied into a tunnelled request head.
pub const EXCLUDED_HEADERS: &[&str] = &[
    "Vary",
    "Via",
    "X-Forwarded-For",
    "Proxy-Authorization",
    "Proxy-Connection",
    "Upgrade",
    "X-Chrome-Variations",
    "Connection",
    "Cache-Control",
];

/// Header carrying the shared secret inside the compressed head.
pub const PASSWORD_HEADER: &str = "X-Urlfetch-Password";

/// User agent of the outer POST.
const TUNNEL_USER_AGENT: &str = "B";

const MAX_HEADERS: usize = 256;

/// `content-type` becomes `Content-Type`.
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

fn is_excluded(name: &HeaderName) -> bool {
    EXCLUDED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name.as_str()))
}

/// Writes `name: value\r\n` lines with canonical names, sorted by name.
fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, skip: impl Fn(&HeaderName) -> bool) {
    let mut names: Vec<&HeaderName> = headers.keys().filter(|n| !skip(n)).collect();
    names.sort_by_key(|n| canonical_header_key(n.as_str()));
    for name in names {
        let key = canonical_header_key(name.as_str());
        for value in headers.get_all(name) {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    DeflateDecoder::new(compressed)
        .read_to_end(&mut raw)
        .map_err(|e| ProxyError::MalformedFrame(format!("inflate: {e}")))?;
    Ok(raw)
}

/// Builds the compressed request head: request line, every non-excluded
/// header, and the password line.
pub fn encode_request_head(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    secret: &str,
) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(512);
    raw.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, uri).as_bytes());
    write_headers(&mut raw, headers, is_excluded);
    raw.extend_from_slice(format!("{PASSWORD_HEADER}: {secret}\r\n").as_bytes());

    let compressed = deflate(&raw)?;
    if compressed.len() > u16::MAX as usize {
        return Err(ProxyError::HeaderBlockTooLarge(compressed.len()));
    }
    Ok(compressed)
}

/// Prefixes `block` with its 16-bit big-endian length.
fn frame(block: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + block.len());
    out.extend_from_slice(&(block.len() as u16).to_be_bytes());
    out.extend_from_slice(block);
    out.freeze()
}

/// Re-encodes `req` as a POST to `endpoint`.
///
/// The original body is streamed after the frame when its length is known
/// and collected first otherwise, so the outer `Content-Length` is always
/// exact.
pub async fn encode_request(req: ProxyRequest, endpoint: &Uri, secret: &str) -> Result<ProxyRequest> {
    let (parts, body) = req.into_parts();
    let block = encode_request_head(&parts.method, &parts.uri, &parts.headers, secret)?;
    let prefix = frame(&block);

    let (body, body_len) = match body.size_hint().exact() {
        Some(len) => (body, len),
        None => {
            let collected = body
                .collect()
                .await
                .map_err(|e| ProxyError::Client(format!("reading request body: {e}")))?
                .to_bytes();
            let len = collected.len() as u64;
            (full(collected), len)
        }
    };
    let content_length = prefix.len() as u64 + body_len;

    let frames = stream::iter(std::iter::once(Ok::<_, BoxError>(Frame::data(prefix))))
        .chain(body.into_data_stream().map_ok(Frame::data));

    let authority = endpoint
        .authority()
        .ok_or_else(|| ProxyError::Config(format!("fetch endpoint {endpoint} has no host")))?;

    let outer = http::Request::builder()
        .method(Method::POST)
        .uri(endpoint.clone())
        .header(HOST, authority.as_str())
        .header(USER_AGENT, TUNNEL_USER_AGENT)
        .header(CONTENT_LENGTH, content_length)
        .body(BodyExt::boxed(StreamBody::new(frames)))?;
    Ok(outer)
}

/// Decodes a tunnel answer.
///
/// Non-200 answers come back untouched. Otherwise the framed head becomes
/// the status and headers and the rest of the body is the response body.
pub async fn decode_response(resp: ProxyResponse) -> Result<ProxyResponse> {
    if resp.status() != StatusCode::OK {
        return Ok(resp);
    }

    let payload = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProxyError::Client(format!("reading tunnel response: {e}")))?
        .to_bytes();

    let (head, rest) = split_frame(&payload)?;
    let raw = terminated(inflate(head)?);

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedFrame("truncated response head".into()))
        }
        Err(e) => return Err(ProxyError::MalformedFrame(e.to_string())),
    }

    let code = parsed
        .code
        .ok_or_else(|| ProxyError::MalformedFrame("missing status".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| ProxyError::MalformedFrame(format!("bad status {code}")))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = http::Response::builder().status(status).version(version);
    if let Some(map) = builder.headers_mut() {
        for h in parsed.headers.iter() {
            map.append(header_name(h.name)?, header_value(h.value)?);
        }
    }

    let body = payload.slice(payload.len() - rest.len()..);
    Ok(builder.body(full(body))?)
}

/// Decodes a compressed request head back into method, target and headers.
///
/// This is what a fetch endpoint does with [`encode_request_head`] output;
/// the password line is returned like any other header.
pub fn decode_request_head(block: &[u8]) -> Result<(Method, String, HeaderMap)> {
    let raw = terminated(inflate(block)?);
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => request_parts(&parsed),
        Ok(httparse::Status::Partial) => {
            Err(ProxyError::MalformedFrame("truncated request head".into()))
        }
        Err(e) => Err(ProxyError::MalformedFrame(e.to_string())),
    }
}

/// Heads are written without the blank line that ends an HTTP head.
fn terminated(mut raw: Vec<u8>) -> Vec<u8> {
    if !raw.ends_with(b"\r\n\r\n") {
        raw.extend_from_slice(b"\r\n");
    }
    raw
}

fn request_parts(parsed: &httparse::Request<'_, '_>) -> Result<(Method, String, HeaderMap)> {
    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| ProxyError::MalformedFrame("bad method".into()))?;
    let target = parsed
        .path
        .ok_or_else(|| ProxyError::MalformedFrame("missing target".into()))?
        .to_string();
    let mut map = HeaderMap::new();
    for h in parsed.headers.iter() {
        map.append(header_name(h.name)?, header_value(h.value)?);
    }
    Ok((method, target, map))
}

fn split_frame(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.len() < 2 {
        return Err(ProxyError::MalformedFrame("missing length prefix".into()));
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let rest = &payload[2..];
    if rest.len() < len {
        return Err(ProxyError::MalformedFrame(format!(
            "head needs {len} bytes, {} available",
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ProxyError::MalformedFrame(format!("bad header name {name:?}")))
}

fn header_value(value: &[u8]) -> Result<HeaderValue> {
    HeaderValue::from_bytes(value)
        .map_err(|_| ProxyError::MalformedFrame("bad header value".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::empty;

    fn endpoint() -> Uri {
        "https://fetch.example.com/_gh/".parse().unwrap()
    }

    fn framed_response(head: &str, body: &[u8]) -> ProxyResponse {
        let block = deflate(head.as_bytes()).unwrap();
        let mut payload = frame(&block).to_vec();
        payload.extend_from_slice(body);
        http::Response::builder()
            .status(StatusCode::OK)
            .body(full(payload))
            .unwrap()
    }

    #[test]
    fn canonical_keys() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("x-urlfetch-password"), "X-Urlfetch-Password");
        assert_eq!(canonical_header_key("ETAG"), "Etag");
    }

    #[test]
    fn request_head_decodes_to_the_same_request() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.append("cookie", HeaderValue::from_static("a=1"));
        headers.append("cookie", HeaderValue::from_static("b=2"));
        headers.insert("x-custom", HeaderValue::from_static("v"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9v"));
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));

        let uri: Uri = "http://www.example.com/a/b?q=1".parse().unwrap();
        let block = encode_request_head(&Method::PUT, &uri, &headers, "s3cret").unwrap();
        let (method, target, decoded) = decode_request_head(&block).unwrap();

        assert_eq!(method, Method::PUT);
        assert_eq!(target, uri.to_string());
        assert_eq!(decoded.get("accept").unwrap(), "text/html");
        assert_eq!(decoded.get("x-custom").unwrap(), "v");
        let cookies: Vec<_> = decoded.get_all("cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(decoded.get(PASSWORD_HEADER).unwrap(), "s3cret");
        for excluded in EXCLUDED_HEADERS {
            assert!(decoded.get(*excluded).is_none(), "{excluded} leaked");
        }
    }

    #[tokio::test]
    async fn encoded_request_is_framed_post() {
        let req = http::Request::builder()
            .method(Method::POST)
            .uri("http://www.example.com/upload")
            .header("content-type", "text/plain")
            .body(full("hello body"))
            .unwrap();

        let outer = encode_request(req, &endpoint(), "pw").await.unwrap();
        assert_eq!(outer.method(), Method::POST);
        assert_eq!(outer.uri(), &endpoint());
        assert_eq!(outer.headers()[USER_AGENT], "B");
        assert_eq!(outer.headers()[HOST], "fetch.example.com");

        let declared: usize = outer.headers()[CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let payload = outer.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(declared, payload.len());

        let (head, rest) = split_frame(&payload).unwrap();
        assert_eq!(declared, 2 + head.len() + "hello body".len());
        assert_eq!(rest, b"hello body");

        let (method, target, headers) = decode_request_head(head).unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(target, "http://www.example.com/upload");
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[tokio::test]
    async fn bodiless_request_has_frame_only_length() {
        let req = http::Request::builder()
            .uri("http://www.example.com/")
            .body(empty())
            .unwrap();
        let outer = encode_request(req, &endpoint(), "pw").await.unwrap();
        let declared: usize = outer.headers()[CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let payload = outer.into_body().collect().await.unwrap().to_bytes();
        let (head, rest) = split_frame(&payload).unwrap();
        assert!(rest.is_empty());
        assert_eq!(declared, 2 + head.len());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut headers = HeaderMap::new();
        // incompressible enough to blow the 16-bit limit
        let mut seed: u64 = 0x2545F4914F6CDD1D;
        for i in 0..60 {
            let value: String = (0..2000)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    (b'!' + (seed % 90) as u8) as char
                })
                .collect();
            headers.insert(
                HeaderName::from_bytes(format!("x-noise-{i}").as_bytes()).unwrap(),
                HeaderValue::from_str(&value).unwrap(),
            );
        }
        let err = encode_request_head(&Method::GET, &endpoint(), &headers, "pw").unwrap_err();
        assert!(matches!(err, ProxyError::HeaderBlockTooLarge(n) if n > 65535));
    }

    #[tokio::test]
    async fn decodes_framed_response() {
        let resp = framed_response(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nX-Origin: yes\r\n\r\n",
            b"no such page",
        );
        let decoded = decode_response(resp).await.unwrap();
        assert_eq!(decoded.status(), StatusCode::NOT_FOUND);
        assert_eq!(decoded.headers()["content-type"], "text/plain");
        assert_eq!(decoded.headers()["x-origin"], "yes");
        let body = decoded.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"no such page");
    }

    #[tokio::test]
    async fn non_200_passes_through_unchanged() {
        let resp = http::Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header("x-endpoint", "overloaded")
            .body(full("not a frame"))
            .unwrap();
        let decoded = decode_response(resp).await.unwrap();
        assert_eq!(decoded.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(decoded.headers()["x-endpoint"], "overloaded");
        let body = decoded.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"not a frame");
    }

    #[tokio::test]
    async fn truncated_frame_is_malformed() {
        let resp = http::Response::builder()
            .status(StatusCode::OK)
            .body(full(vec![0x00, 0x40, 0x01]))
            .unwrap();
        assert!(matches!(
            decode_response(resp).await,
            Err(ProxyError::MalformedFrame(_))
        ));

        let resp = http::Response::builder()
            .status(StatusCode::OK)
            .body(full(vec![0x01]))
            .unwrap();
        assert!(matches!(
            decode_response(resp).await,
            Err(ProxyError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn garbage_head_is_malformed() {
        let resp = framed_response("this is not http\r\n\r\n", b"");
        assert!(matches!(
            decode_response(resp).await,
            Err(ProxyError::MalformedFrame(_))
        ));
    }
}
