//! Per-request state carried through the filter stages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::listener::Listener;
use crate::sink::ResponseSink;

/// Inbound header carrying `key=value; key=value` vendor tags.
pub const VENDOR_HEADER: &str = "X-Vender-Info";

/// Typed scratch lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("no context value named {key:?}")]
    Missing { key: String },

    #[error("context value {key:?} is a {found}, not a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// A value stored in the per-request scratch map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScratchValue {
    String(String),
    Bool(bool),
    Int(i64),
    StringMap(HashMap<String, String>),
}

impl ScratchValue {
    fn kind(&self) -> &'static str {
        match self {
            ScratchValue::String(_) => "string",
            ScratchValue::Bool(_) => "bool",
            ScratchValue::Int(_) => "int",
            ScratchValue::StringMap(_) => "string map",
        }
    }
}

/// Parses a vendor tag header value.
///
/// Pairs are split on `;`, trimmed, and split on the first `=`; name and value
/// are trimmed as well. Pairs without a `=`, or starting with `=`, are skipped.
pub fn parse_vendor_tags(value: &str) -> HashMap<String, String> {
    value
        .trim()
        .split(';')
        .map(str::trim)
        .filter_map(|part| match part.find('=') {
            Some(i) if i > 0 => Some((
                part[..i].trim_end().to_string(),
                part[i + 1..].trim_start().to_string(),
            )),
            _ => None,
        })
        .collect()
}

/// Mutable state for one request.
///
/// Created by the handler, threaded through every filter, and dropped when
/// the handler returns.
pub struct RequestContext<'a> {
    listener: Arc<dyn Listener>,
    sink: &'a mut dyn ResponseSink,
    vendor_string: String,
    vendor_tags: HashMap<String, String>,
    values: HashMap<String, ScratchValue>,
    hijacked: bool,
}

impl fmt::Debug for RequestContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("vendor_tags", &self.vendor_tags)
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .field("hijacked", &self.hijacked)
            .finish()
    }
}

impl<'a> RequestContext<'a> {
    /// Builds a context for `req`, parsing its vendor tag header once.
    pub fn new<B>(
        listener: Arc<dyn Listener>,
        sink: &'a mut dyn ResponseSink,
        req: &http::Request<B>,
    ) -> Self {
        let vendor_string = req
            .headers()
            .get(VENDOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let vendor_tags = if vendor_string.is_empty() {
            HashMap::new()
        } else {
            parse_vendor_tags(&vendor_string)
        };

        Self {
            listener,
            sink,
            vendor_string,
            vendor_tags,
            values: HashMap::new(),
            hijacked: false,
        }
    }

    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    pub fn sink(&mut self) -> &mut dyn ResponseSink {
        &mut *self.sink
    }

    /// Raw vendor header value, empty when absent.
    pub fn vendor_string(&self) -> &str {
        &self.vendor_string
    }

    pub fn vendor_tag(&self, key: &str) -> Option<&str> {
        self.vendor_tags.get(key).map(String::as_str)
    }

    pub fn vendor_tags(&self) -> &HashMap<String, String> {
        &self.vendor_tags
    }

    pub fn set_hijacked(&mut self, hijacked: bool) {
        self.hijacked = hijacked;
    }

    /// Whether a filter took over the client connection.
    pub fn hijacked(&self) -> bool {
        self.hijacked
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(key.into(), ScratchValue::String(value.into()));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.values.insert(key.into(), ScratchValue::Bool(value));
    }

    pub fn set_int(&mut self, key: impl Into<String>, value: i64) {
        self.values.insert(key.into(), ScratchValue::Int(value));
    }

    pub fn set_string_map(&mut self, key: impl Into<String>, value: HashMap<String, String>) {
        self.values
            .insert(key.into(), ScratchValue::StringMap(value));
    }

    pub fn get_string(&self, key: &str) -> Result<&str, ContextError> {
        match self.lookup(key)? {
            ScratchValue::String(s) => Ok(s),
            other => Err(wrong_type(key, "string", other)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ContextError> {
        match self.lookup(key)? {
            ScratchValue::Bool(b) => Ok(*b),
            other => Err(wrong_type(key, "bool", other)),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ContextError> {
        match self.lookup(key)? {
            ScratchValue::Int(i) => Ok(*i),
            other => Err(wrong_type(key, "int", other)),
        }
    }

    pub fn get_string_map(&self, key: &str) -> Result<&HashMap<String, String>, ContextError> {
        match self.lookup(key)? {
            ScratchValue::StringMap(m) => Ok(m),
            other => Err(wrong_type(key, "string map", other)),
        }
    }

    fn lookup(&self, key: &str) -> Result<&ScratchValue, ContextError> {
        self.values.get(key).ok_or_else(|| ContextError::Missing {
            key: key.to_string(),
        })
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &ScratchValue) -> ContextError {
    ContextError::WrongType {
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}
