//! Named filter factories and chain construction from configuration.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use sluice_storage::Store;

use crate::config::{load_json_or_default, FiltersConfig};
use crate::direct::DirectFilter;
use crate::error::{ProxyError, Result};
use crate::fetch::FetchFilter;
use crate::filter::{Filter, FilterChain, Stage};
use crate::hop::HopHeadersFilter;
use crate::stripssl::TlsInterceptor;

/// Builds one filter instance, reading its settings from the store.
pub type FilterFactory = Box<dyn Fn(&dyn Store) -> Result<Filter> + Send + Sync>;

/// Filter factories by name, kept in registration order.
#[derive(Default)]
pub struct FilterRegistry {
    factories: Vec<(String, FilterFactory)>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a factory. Names are unique.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&dyn Store) -> Result<Filter> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.iter().any(|(n, _)| *n == name) {
            return Err(ProxyError::Config(format!(
                "filter {:?} registered twice",
                name
            )));
        }
        self.factories.push((name, Box::new(factory)));
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(n, _)| n.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factory(name).is_some()
    }

    fn factory(&self, name: &str) -> Option<&FilterFactory> {
        self.factories
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    /// Instantiates the configured filters, in configured order, into a chain.
    ///
    /// Every name is instantiated once. Unknown names and filters listed under
    /// a stage they cannot run in are errors.
    pub fn build(&self, config: &FiltersConfig, store: &dyn Store) -> Result<FilterChain> {
        let mut chain = FilterChain::new();
        let mut seen = HashSet::new();

        let stages = [
            (Stage::Request, &config.request),
            (Stage::RoundTrip, &config.round_trip),
            (Stage::Response, &config.response),
        ];
        for (stage, names) in stages {
            for name in names {
                if !seen.insert(name.as_str()) {
                    return Err(ProxyError::Config(format!(
                        "filter {:?} configured more than once",
                        name
                    )));
                }
                let factory = self
                    .factory(name)
                    .ok_or_else(|| ProxyError::Config(format!("unknown filter {:?}", name)))?;
                let filter = factory(store)?;
                if filter.stage() != stage {
                    return Err(ProxyError::Config(format!(
                        "filter {:?} is a {} filter, configured as {}",
                        name,
                        filter.stage(),
                        stage
                    )));
                }
                info!("Filter {} enabled ({})", name, stage);
                chain.push(filter);
            }
        }
        Ok(chain)
    }
}

/// Registry holding every filter shipped with the proxy.
pub fn builtin_registry() -> FilterRegistry {
    let builtins: [(&str, FilterFactory); 4] = [
        (
            "stripssl",
            Box::new(|store: &dyn Store| {
                let config = load_json_or_default(store, "stripssl.json")?;
                Ok(Filter::Request(Arc::new(TlsInterceptor::new(&config, store)?)))
            }),
        ),
        (
            "fetch",
            Box::new(|store: &dyn Store| {
                let config = load_json_or_default(store, "fetch.json")?;
                Ok(Filter::RoundTrip(Arc::new(FetchFilter::new(&config)?)))
            }),
        ),
        (
            "direct",
            Box::new(|store: &dyn Store| {
                let config = load_json_or_default(store, "direct.json")?;
                Ok(Filter::RoundTrip(Arc::new(DirectFilter::new(&config)?)))
            }),
        ),
        (
            "hopheaders",
            Box::new(|_: &dyn Store| Ok(Filter::Response(Arc::new(HopHeadersFilter)))),
        ),
    ];

    let mut registry = FilterRegistry::new();
    for (name, factory) in builtins {
        registry.factories.push((name.to_string(), factory));
    }
    registry
}
