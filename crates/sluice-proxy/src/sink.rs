//! Client response sinks and connection hijacking.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use http::{Method, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use crate::body::{empty, ProxyResponse};
use crate::error::{ProxyError, Result};
use crate::listener::BoxedStream;

type PendingStream = Pin<Box<dyn Future<Output = Result<BoxedStream>> + Send>>;

/// A client connection taken over by a filter.
///
/// The raw stream becomes available once the sink has acknowledged the
/// tunnel to the client.
pub struct Hijacked {
    pending: PendingStream,
}

impl fmt::Debug for Hijacked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hijacked").finish_non_exhaustive()
    }
}

impl Hijacked {
    pub fn new<F>(pending: F) -> Self
    where
        F: Future<Output = Result<BoxedStream>> + Send + 'static,
    {
        Self {
            pending: Box::pin(pending),
        }
    }

    /// Wraps an already available stream.
    pub fn ready(stream: BoxedStream) -> Self {
        Self::new(async move { Ok(stream) })
    }

    /// Waits for the raw connection.
    pub async fn into_stream(self) -> Result<BoxedStream> {
        self.pending.await
    }
}

/// Where the handler sends its single outcome for a request.
pub trait ResponseSink: Send {
    /// Sends status, headers and body to the client.
    fn write_response(&mut self, resp: ProxyResponse) -> Result<()>;

    /// Takes over the client connection, acknowledging the tunnel with a bare
    /// `200 OK`.
    fn hijack(&mut self) -> Result<Hijacked>;
}

#[derive(Default)]
enum Reply {
    #[default]
    Nothing,
    Response(ProxyResponse),
    Hijacked,
}

/// Response sink backed by a hyper HTTP/1 connection.
///
/// Only CONNECT requests can be hijacked; hyper hands the raw connection over
/// after the `200 OK` returned by [`HyperSink::into_reply`] has been written.
#[derive(Default)]
pub struct HyperSink {
    on_upgrade: Option<OnUpgrade>,
    reply: Reply,
}

impl HyperSink {
    /// Prepares a sink for `req`, claiming its upgrade handle when it is a
    /// CONNECT.
    pub fn for_request<B>(req: &mut http::Request<B>) -> Self {
        let on_upgrade = (req.method() == Method::CONNECT).then(|| hyper::upgrade::on(req));
        Self {
            on_upgrade,
            reply: Reply::Nothing,
        }
    }

    /// Converts the recorded outcome into what hyper writes back.
    ///
    /// An aborted request becomes an error so hyper closes the connection
    /// without writing anything.
    pub fn into_reply(self) -> Result<ProxyResponse> {
        match self.reply {
            Reply::Response(resp) => Ok(resp),
            Reply::Hijacked => Ok(http::Response::builder()
                .status(StatusCode::OK)
                .body(empty())?),
            Reply::Nothing => Err(ProxyError::Aborted),
        }
    }

    fn ensure_unanswered(&self) -> Result<()> {
        match self.reply {
            Reply::Nothing => Ok(()),
            _ => Err(ProxyError::AlreadyAnswered),
        }
    }
}

impl ResponseSink for HyperSink {
    fn write_response(&mut self, resp: ProxyResponse) -> Result<()> {
        self.ensure_unanswered()?;
        let mut out = http::Response::builder().status(resp.status());
        let (parts, body) = resp.into_parts();
        if let Some(headers) = out.headers_mut() {
            for (name, value) in parts.headers.iter() {
                headers.append(name.clone(), value.clone());
            }
        }
        self.reply = Reply::Response(out.body(body)?);
        Ok(())
    }

    fn hijack(&mut self) -> Result<Hijacked> {
        self.ensure_unanswered()?;
        let on_upgrade = self.on_upgrade.take().ok_or(ProxyError::HijackUnsupported)?;
        self.reply = Reply::Hijacked;
        Ok(Hijacked::new(async move {
            let upgraded = on_upgrade.await?;
            Ok(Box::new(TokioIo::new(upgraded)) as BoxedStream)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full;

    #[test]
    fn hyper_sink_without_outcome_aborts() {
        let sink = HyperSink::default();
        assert!(matches!(sink.into_reply(), Err(ProxyError::Aborted)));
    }

    #[test]
    fn hyper_sink_copies_every_header_value() {
        let mut sink = HyperSink::default();
        let resp = http::Response::builder()
            .status(StatusCode::CREATED)
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .body(full("ok"))
            .unwrap();
        sink.write_response(resp).unwrap();

        let reply = sink.into_reply().unwrap();
        assert_eq!(reply.status(), StatusCode::CREATED);
        assert_eq!(reply.headers().get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn hyper_sink_cannot_hijack_plain_request() {
        let mut req = http::Request::builder()
            .method(Method::GET)
            .uri("http://example.com/")
            .body(empty())
            .unwrap();
        let mut sink = HyperSink::for_request(&mut req);
        assert!(matches!(sink.hijack(), Err(ProxyError::HijackUnsupported)));
    }

    #[test]
    fn hyper_sink_hijack_answers_200() {
        let mut req = http::Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(empty())
            .unwrap();
        let mut sink = HyperSink::for_request(&mut req);
        let _hijacked = sink.hijack().unwrap();
        assert!(sink.write_response(http::Response::new(empty())).is_err());
        assert_eq!(sink.into_reply().unwrap().status(), StatusCode::OK);
    }
}
