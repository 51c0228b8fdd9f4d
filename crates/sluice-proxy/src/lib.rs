//! Sluice Proxy - filtering forward proxy.
//!
//! Every client request runs through three ordered stages of named filters:
//! request filters inspect or rewrite it (or take over the connection),
//! round-trip filters turn it into a response, and response filters inspect
//! or replace that response before it is written back.
//!
//! ## Filters
//!
//! - `stripssl` - terminates TLS for configured sites with leaf certificates
//!   minted by a local root CA and re-enters the decrypted connection
//! - `fetch` - tunnels requests through remote fetch endpoints using a
//!   compressed, length-prefixed header block
//! - `direct` - talks to origins itself and tunnels other CONNECTs
//! - `hopheaders` - removes hop-by-hop headers from responses
//!
//! ## Architecture
//!
//! ```text
//! Client → Listener ─┬─ Request filters ── hijack? ──► TLS handshake ──┐
//!            ▲       │                                                  │
//!            │       ├─ Round-trip filters (first answer wins)          │
//!            │       │                                                  │
//!            │       └─ Response filters ──► Client                     │
//!            └──────────────────── re-injected connection ◄────────────┘
//! ```

mod body;
mod ca;
mod cert_cache;
mod client;
pub mod codec;
pub mod config;
mod context;
mod direct;
mod error;
mod fetch;
mod filter;
mod handler;
mod hop;
mod listener;
mod registry;
mod server;
mod sink;
mod sites;
mod splice;
mod stripssl;

#[cfg(test)]
mod testing;

pub use body::{boxed, empty, full, Body, BoxError, OriginalRequest, ProxyRequest, ProxyResponse};
pub use ca::CertificateAuthority;
pub use cert_cache::CertificateCache;
pub use client::HttpClient;
pub use config::{
    DirectConfig, FetchConfig, FetchServerConfig, FiltersConfig, ProxyConfig, RootCaConfig,
    StripSslConfig,
};
pub use context::{parse_vendor_tags, ContextError, RequestContext, ScratchValue, VENDOR_HEADER};
pub use direct::DirectFilter;
pub use error::{CaError, ProxyError, Result};
pub use fetch::{FetchFilter, FetchServer};
pub use filter::{
    Filter, FilterChain, RequestFilter, ResponseFilter, RoundTrip, RoundTripFilter, Stage,
};
pub use handler::{normalize_url, ProxyHandler};
pub use hop::{strip_hop_headers, HopHeadersFilter, HOP_HEADERS};
pub use listener::{
    Accepted, AsyncStream, BoxedStream, ConnInfo, ConnInjector, Listener, ProxyListener, TlsInfo,
};
pub use registry::{builtin_registry, FilterFactory, FilterRegistry};
pub use server::{serve_connection, ProxyHandle, ProxyServer};
pub use sink::{Hijacked, HyperSink, ResponseSink};
pub use sites::{strip_port, SiteMatchList};
pub use splice::{splice, Spliced};
pub use stripssl::{common_name, TlsInterceptor};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8087;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 8087);
    }

    #[test]
    fn default_config_listens_on_loopback() {
        let config = ProxyConfig::default();
        assert!(config.listen.ip().is_loopback());
        assert_eq!(config.listen.port(), DEFAULT_PROXY_PORT);
    }
}
