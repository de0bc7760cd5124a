//! Route registration and lookup.
//!
//! Literal paths live in a fixed hash-bucket table; patterns with `:name`
//! segments live in a separate list scanned in registration order. Literal
//! matches always win over parameterized ones.

use crate::http::{request::Request, response::Response, types::Method};
use std::sync::Arc;

/// A request handler. Handlers run synchronously on the worker serving the
/// connection and fill in the response; slow deterministic GET handlers are
/// what the reply cache exists to learn.
pub type Handler = Arc<dyn Fn(&mut Request, &mut Response) + Send + Sync>;

const ROUTE_BUCKETS: usize = 127;

const FNV_OFFSET: u64 = 1469598103934665603;
const FNV_PRIME: u64 = 1099511628211;

#[inline]
fn route_hash(method: Method, path: &str) -> u64 {
    let mut hash = FNV_OFFSET ^ (method as u64);
    for &byte in path.as_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// Short paths compare as a single machine word.
#[inline(always)]
fn word_key(path: &str) -> Option<u64> {
    let bytes = path.as_bytes();
    if bytes.len() > 8 {
        return None;
    }
    let mut word = [0u8; 8];
    word[..bytes.len()].copy_from_slice(bytes);
    Some(u64::from_le_bytes(word))
}

struct LiteralRoute {
    method: Method,
    path: String,
    word: Option<u64>,
    handler: Handler,
}

struct ParamRoute {
    method: Method,
    pattern: String,
    handler: Handler,
}

pub(crate) struct Router {
    buckets: Vec<Vec<LiteralRoute>>,
    params: Vec<ParamRoute>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self {
            buckets: (0..ROUTE_BUCKETS).map(|_| Vec::new()).collect(),
            params: Vec::new(),
        }
    }

    /// Registers a route. Patterns containing a `:` segment go to the
    /// parameterized list; identical literal (method, path) pairs replace
    /// the previous handler.
    pub(crate) fn insert(&mut self, method: Method, pattern: &str, handler: Handler) {
        if pattern.contains(':') {
            self.params.push(ParamRoute {
                method,
                pattern: pattern.to_string(),
                handler,
            });
            return;
        }

        let idx = (route_hash(method, pattern) % ROUTE_BUCKETS as u64) as usize;
        let bucket = &mut self.buckets[idx];

        if let Some(existing) = bucket
            .iter_mut()
            .find(|r| r.method == method && r.path == pattern)
        {
            existing.handler = handler;
            return;
        }

        bucket.push(LiteralRoute {
            method,
            path: pattern.to_string(),
            word: word_key(pattern),
            handler,
        });
    }

    /// Exact-path lookup through the bucket table.
    pub(crate) fn lookup_literal(&self, method: Method, path: &str) -> Option<&Handler> {
        let idx = (route_hash(method, path) % ROUTE_BUCKETS as u64) as usize;
        let key = word_key(path);

        for route in &self.buckets[idx] {
            if route.method != method {
                continue;
            }
            let matched = match (key, route.word) {
                (Some(a), Some(b)) => route.path.len() == path.len() && a == b,
                _ => route.path == path,
            };
            if matched {
                return Some(&route.handler);
            }
        }
        None
    }

    /// Scans parameterized routes in registration order. On a match the
    /// captured `:name` segments are left in `params`.
    pub(crate) fn match_params(
        &self,
        method: Method,
        path: &str,
        params: &mut Vec<(String, String)>,
    ) -> Option<&Handler> {
        for route in &self.params {
            if route.method == method && match_pattern(&route.pattern, path, params) {
                return Some(&route.handler);
            }
        }
        None
    }
}

/// Segment-wise pattern match. Both sides split on `/` with empty segments
/// skipped; a `:name` pattern segment captures the concrete segment, every
/// other segment must match byte for byte, and segment counts must agree.
///
/// `params` is cleared on entry, so a failed attempt never leaks partial
/// captures into the next one.
pub(crate) fn match_pattern(
    pattern: &str,
    path: &str,
    params: &mut Vec<(String, String)>,
) -> bool {
    params.clear();

    let mut pattern_segments = pattern.split('/').filter(|s| !s.is_empty());
    let mut path_segments = path.split('/').filter(|s| !s.is_empty());

    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (Some(expected), Some(actual)) => {
                if let Some(name) = expected.strip_prefix(':') {
                    params.push((name.to_string(), actual.to_string()));
                } else if expected != actual {
                    params.clear();
                    return false;
                }
            }
            (None, None) => return true,
            _ => {
                params.clear();
                return false;
            }
        }
    }
}
