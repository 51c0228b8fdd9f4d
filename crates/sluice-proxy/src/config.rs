//! Configuration documents loaded from the object store.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sluice_storage::{read_json, Store, StoreError};

use crate::error::{ProxyError, Result};
use crate::DEFAULT_PROXY_PORT;

/// Reads `name` from `store` and parses it as JSON with `//` comments.
pub fn load_json<T: DeserializeOwned>(store: &dyn Store, name: &str) -> Result<T> {
    let raw = store.get(name)?;
    let value = serde_json::from_slice(&read_json(&raw))?;
    debug!("Loaded {} from {}", name, store.url());
    Ok(value)
}

/// Like [`load_json`], but a missing document yields the defaults.
pub fn load_json_or_default<T: DeserializeOwned + Default>(store: &dyn Store, name: &str) -> Result<T> {
    match load_json(store, name) {
        Err(ProxyError::Storage(StoreError::NotFound(_))) => {
            debug!("{} not found in {}, using defaults", name, store.url());
            Ok(T::default())
        }
        other => other,
    }
}

/// `main.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Re-enter intercepted connections into the accept loop instead of
    /// dialing back through loopback.
    pub reinject: bool,
    pub filters: FiltersConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            reinject: true,
            filters: FiltersConfig::default(),
        }
    }
}

/// Filter names per stage, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    pub request: Vec<String>,
    pub round_trip: Vec<String>,
    pub response: Vec<String>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            request: vec!["stripssl".to_string()],
            round_trip: vec!["direct".to_string()],
            response: vec!["hopheaders".to_string()],
        }
    }
}

/// Root authority parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootCaConfig {
    /// Common name and organisation of the root.
    pub name: String,
    /// Validity of issued leaves, in seconds.
    pub duration_secs: u64,
    /// 256/384 for ECDSA, 2048/3072/4096 for RSA.
    pub key_bits: u32,
    /// Store name prefix of `<prefix>.crt` and `<prefix>.key`.
    pub file_prefix: String,
}

impl Default for RootCaConfig {
    fn default() -> Self {
        Self {
            name: "Sluice Root CA".to_string(),
            duration_secs: 3 * 30 * 24 * 3600,
            key_bits: 2048,
            file_prefix: "certs/root".to_string(),
        }
    }
}

/// `stripssl.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StripSslConfig {
    pub root_ca: RootCaConfig,
    /// Hosts to intercept; entries with `*` are globs.
    pub sites: Vec<String>,
    /// Issue `*.parent` leaves for hosts with three or more labels.
    pub wildcard_names: bool,
    pub handshake_timeout_secs: u64,
    pub cache_shards: usize,
    pub cache_capacity: usize,
}

impl Default for StripSslConfig {
    fn default() -> Self {
        Self {
            root_ca: RootCaConfig::default(),
            sites: Vec::new(),
            wildcard_names: false,
            handshake_timeout_secs: 10,
            cache_shards: 4,
            cache_capacity: 4096,
        }
    }
}

/// One remote fetch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchServerConfig {
    pub url: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
}

fn default_true() -> bool {
    true
}

/// `fetch.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub servers: Vec<FetchServerConfig>,
}

/// `direct.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    pub dial_timeout_secs: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_storage::FileStore;
    use tempfile::TempDir;

    #[test]
    fn empty_documents_use_defaults() {
        let main: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(main.listen.port(), DEFAULT_PROXY_PORT);
        assert!(main.reinject);
        assert_eq!(main.filters.request, vec!["stripssl"]);

        let strip: StripSslConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(strip.cache_shards, 4);
        assert_eq!(strip.cache_capacity, 4096);
        assert_eq!(strip.root_ca.key_bits, 2048);
    }

    #[test]
    fn load_json_strips_comments() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store
            .put(
                "fetch.json",
                br#"{
                    // primary endpoint
                    "servers": [
                        { "url": "https://fetch.example.com/_gh/", "password": "s3cret" }
                    ]
                }"#,
            )
            .unwrap();

        let cfg: FetchConfig = load_json(&store, "fetch.json").unwrap();
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].password, "s3cret");
        assert!(cfg.servers[0].ssl_verify);
    }

    #[test]
    fn missing_document_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let cfg: DirectConfig = load_json_or_default(&store, "direct.json").unwrap();
        assert_eq!(cfg.dial_timeout_secs, 30);

        store.put("direct.json", b"{ not json").unwrap();
        assert!(matches!(
            load_json_or_default::<DirectConfig>(&store, "direct.json"),
            Err(ProxyError::Json(_))
        ));
    }

    #[test]
    fn load_json_missing_document() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let err = load_json::<DirectConfig>(&store, "direct.json").unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Storage(StoreError::NotFound(_))
        ));
    }
}
