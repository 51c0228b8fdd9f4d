//! Host allow-list for TLS interception.
//!
//! Entries without `*` are exact host names; entries with `*` are shell-style
//! globs tried in configuration order after the exact set.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use crate::error::{ProxyError, Result};

/// Strips an optional `:port` suffix, keeping bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        // a bare IPv6 literal has several colons and no port
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Exact host set plus ordered glob patterns.
#[derive(Debug, Clone, Default)]
pub struct SiteMatchList {
    exact: HashSet<String>,
    globs: Vec<(String, Regex)>,
}

impl SiteMatchList {
    /// Builds the list, failing on the first malformed glob.
    pub fn new<I, S>(sites: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for site in sites {
            let site = site.as_ref().trim();
            if site.is_empty() {
                continue;
            }
            if site.contains('*') {
                list.globs.push((site.to_string(), glob_to_regex(site)?));
            } else {
                list.exact.insert(site.to_ascii_lowercase());
            }
        }
        Ok(list)
    }

    /// Whether `host` (optionally with a port) is selected for interception.
    pub fn matches(&self, host: &str) -> bool {
        let host = strip_port(host).to_ascii_lowercase();
        if self.exact.contains(&host) {
            return true;
        }
        self.globs.iter().any(|(_, re)| re.is_match(&host))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.globs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.globs.len()
    }
}

/// Compiles a shell glob into an anchored, case-insensitive regex.
///
/// `*` matches any run of characters except `/`, `?` matches one, and
/// `[...]` classes (with `^` or `!` negation and ranges) are kept. `\` escapes
/// the next character. There is no `**`.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let invalid = |why: &str| ProxyError::Config(format!("bad site pattern {pattern:?}: {why}"));

    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '\\' => {
                let escaped = chars.next().ok_or_else(|| invalid("trailing escape"))?;
                re.push_str(&regex::escape(&escaped.to_string()));
            }
            '[' => {
                re.push('[');
                if matches!(chars.peek(), Some('^') | Some('!')) {
                    chars.next();
                    re.push('^');
                }
                let mut closed = false;
                let mut empty = true;
                while let Some(c) = chars.next() {
                    match c {
                        ']' if !empty => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let escaped = chars.next().ok_or_else(|| invalid("trailing escape"))?;
                            re.push_str(&regex::escape(&escaped.to_string()));
                        }
                        '-' if !empty && chars.peek().is_some_and(|&n| n != ']') => re.push('-'),
                        other => re.push_str(&regex::escape(&other.to_string())),
                    }
                    empty = false;
                }
                if !closed {
                    return Err(invalid("unterminated character class"));
                }
                re.push(']');
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');

    RegexBuilder::new(&re)
        .case_insensitive(true)
        .build()
        .map_err(|e| invalid(&e.to_string()))
}
