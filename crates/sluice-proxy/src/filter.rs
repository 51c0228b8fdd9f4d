//! The three filter stages and the ordered chain the handler runs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::body::{ProxyRequest, ProxyResponse};
use crate::context::RequestContext;
use crate::error::Result;

/// Outcome of a round-trip filter.
#[derive(Debug)]
pub enum RoundTrip {
    /// The filter produced the response; later round-trippers are skipped.
    Response(ProxyResponse),
    /// The filter declined; the request moves on to the next round-tripper.
    Pass(ProxyRequest),
}

/// Inspects or rewrites a request before it is sent anywhere.
///
/// A filter that takes over the client connection marks the context hijacked
/// and the handler stops right after it returns.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn request(&self, ctx: &mut RequestContext<'_>, req: ProxyRequest)
        -> Result<ProxyRequest>;
}

/// Turns a request into a response.
#[async_trait]
pub trait RoundTripFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn round_trip(&self, ctx: &mut RequestContext<'_>, req: ProxyRequest)
        -> Result<RoundTrip>;
}

/// Inspects or replaces a response before it is written to the client.
///
/// Returning `None` drops the response and the client gets nothing.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn response(
        &self,
        ctx: &mut RequestContext<'_>,
        resp: ProxyResponse,
    ) -> Result<Option<ProxyResponse>>;
}

/// A filter together with the one stage it can run in.
#[derive(Clone)]
pub enum Filter {
    Request(Arc<dyn RequestFilter>),
    RoundTrip(Arc<dyn RoundTripFilter>),
    Response(Arc<dyn ResponseFilter>),
}

impl Filter {
    pub fn name(&self) -> &str {
        match self {
            Filter::Request(f) => f.name(),
            Filter::RoundTrip(f) => f.name(),
            Filter::Response(f) => f.name(),
        }
    }

    /// Stage name as used in configuration.
    pub fn stage(&self) -> Stage {
        match self {
            Filter::Request(_) => Stage::Request,
            Filter::RoundTrip(_) => Stage::RoundTrip,
            Filter::Response(_) => Stage::Response,
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.stage(), self.name())
    }
}

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Request,
    RoundTrip,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Request => write!(f, "request"),
            Stage::RoundTrip => write!(f, "round_trip"),
            Stage::Response => write!(f, "response"),
        }
    }
}

/// Ordered filters for each stage.
#[derive(Clone, Default)]
pub struct FilterChain {
    pub request: Vec<Arc<dyn RequestFilter>>,
    pub round_trip: Vec<Arc<dyn RoundTripFilter>>,
    pub response: Vec<Arc<dyn ResponseFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `filter` to the end of its stage.
    pub fn push(&mut self, filter: Filter) {
        match filter {
            Filter::Request(f) => self.request.push(f),
            Filter::RoundTrip(f) => self.round_trip.push(f),
            Filter::Response(f) => self.response.push(f),
        }
    }

    pub fn with(mut self, filter: Filter) -> Self {
        self.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.round_trip.is_empty() && self.response.is_empty()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("request", &self.request.iter().map(|x| x.name()).collect::<Vec<_>>())
            .field(
                "round_trip",
                &self.round_trip.iter().map(|x| x.name()).collect::<Vec<_>>(),
            )
            .field(
                "response",
                &self.response.iter().map(|x| x.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
