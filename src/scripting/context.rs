//! Per-request state handed to the scripting runtime (§3 Request Context /
//! Response Accumulator) and the small value type used to move data between
//! Rust and Lua for `context_set`/`context_get`.
use std::collections::HashMap;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ScriptError {
    #[error("request body of {actual} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { actual: usize, limit: usize },
    #[error("script runtime error: {0}")]
    Runtime(String),
    #[error("script compile error: {0}")]
    Compile(String),
    #[error("registration primitive invoked outside load phase: {0}")]
    Configuration(String),
    #[error("request cancelled")]
    Cancelled,
}

/// A value round-tripped between Lua and the per-request scratch map.
/// Kept deliberately small (no tables/functions) so stored context never
/// outlives the interpreter instance it was created in.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl ScriptValue {
    pub fn from_lua_value(value: &mlua::Value) -> Self {
        match value {
            mlua::Value::Nil => ScriptValue::Nil,
            mlua::Value::Boolean(b) => ScriptValue::Boolean(*b),
            mlua::Value::Integer(i) => ScriptValue::Integer(*i),
            mlua::Value::Number(n) => ScriptValue::Number(*n),
            mlua::Value::String(s) => {
                ScriptValue::String(s.to_str().map(|c| c.to_string()).unwrap_or_default())
            }
            _ => ScriptValue::Nil,
        }
    }

    pub fn to_lua_value(&self, lua: &mlua::Lua) -> mlua::Result<mlua::Value> {
        Ok(match self {
            ScriptValue::Nil => mlua::Value::Nil,
            ScriptValue::Boolean(b) => mlua::Value::Boolean(*b),
            ScriptValue::Integer(i) => mlua::Value::Integer(*i),
            ScriptValue::Number(n) => mlua::Value::Number(*n),
            ScriptValue::String(s) => mlua::Value::String(lua.create_string(s)?),
        })
    }
}

/// Frozen request metadata plus the lazily-materialized body and per-request
/// scratch map (§3 Request Context).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub host: String,
    pub remote_addr: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub params: HashMap<String, String>,
    pub scratch: HashMap<String, ScriptValue>,
    pub cancellation: CancellationToken,
    body_raw: Option<Vec<u8>>,
    body_cached: Option<String>,
    max_body_bytes: usize,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: String,
        path: String,
        host: String,
        remote_addr: String,
        headers: Vec<(String, String)>,
        query: Vec<(String, String)>,
        params: HashMap<String, String>,
        body_raw: Option<Vec<u8>>,
        max_body_bytes: usize,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            method,
            path,
            host,
            remote_addr,
            headers,
            query,
            params,
            scratch: HashMap::new(),
            cancellation,
            body_raw,
            body_cached: None,
            max_body_bytes,
        }
    }

    /// Inert placeholder installed between requests (§4.6 instance hygiene).
    pub fn inert() -> Self {
        Self::new(
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            Vec::new(),
            Vec::new(),
            HashMap::new(),
            None,
            0,
            CancellationToken::new(),
        )
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn query_get(&self, name: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    /// Returns the request body as a string, cached on first call so every
    /// subsequent call within the request returns the identical bytes (§8).
    pub fn body(&mut self) -> Result<String, ScriptError> {
        if let Some(cached) = &self.body_cached {
            return Ok(cached.clone());
        }
        let raw = self.body_raw.as_deref().unwrap_or(&[]);
        if raw.len() > self.max_body_bytes {
            return Err(ScriptError::PayloadTooLarge {
                actual: raw.len(),
                limit: self.max_body_bytes,
            });
        }
        let text = String::from_utf8_lossy(raw).into_owned();
        self.body_cached = Some(text.clone());
        Ok(text)
    }
}

/// Status/headers/body under construction for the current request (§3
/// Response Accumulator). Headers freeze on the first `write`.
#[derive(Debug, Clone, Default)]
pub struct ResponseAccumulator {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    headers_frozen: bool,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            headers_frozen: false,
        }
    }

    pub fn set_status(&mut self, code: u16) {
        self.status = code;
    }

    pub fn set_header(&mut self, name: String, value: String) {
        if self.headers_frozen {
            tracing::warn!(header = %name, "ignoring header set after first write");
            return;
        }
        self.headers.push((name, value));
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.headers_frozen = true;
        self.body.extend_from_slice(bytes);
    }
}

/// The mutable pair rebound into a pooled interpreter instance on each
/// `Acquire`, shared with the Lua-side `req`/`res` userdata handles.
#[derive(Debug)]
pub struct RequestState {
    pub ctx: RequestContext,
    pub resp: ResponseAccumulator,
}

impl RequestState {
    pub fn inert() -> Self {
        Self {
            ctx: RequestContext::inert(),
            resp: ResponseAccumulator::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_body(body: &[u8], max: usize) -> RequestContext {
        RequestContext::new(
            "POST".into(),
            "/echo".into(),
            "host".into(),
            "127.0.0.1".into(),
            vec![],
            vec![],
            HashMap::new(),
            Some(body.to_vec()),
            max,
            CancellationToken::new(),
        )
    }

    #[test]
    fn body_is_idempotent() {
        let mut ctx = ctx_with_body(b"hello", 1024);
        let first = ctx.body().unwrap();
        let second = ctx.body().unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "hello");
    }

    #[test]
    fn body_within_limit_accepted() {
        let mut ctx = ctx_with_body(&[0u8; 1024], 1024);
        assert!(ctx.body().is_ok());
    }

    #[test]
    fn body_over_limit_rejected() {
        let mut ctx = ctx_with_body(&[0u8; 1025], 1024);
        assert!(matches!(
            ctx.body(),
            Err(ScriptError::PayloadTooLarge {
                actual: 1025,
                limit: 1024
            })
        ));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut ctx = ctx_with_body(b"", 1024);
        ctx.headers.push(("Authorization".into(), "Bearer x".into()));
        assert_eq!(ctx.header("authorization"), Some("Bearer x".to_string()));
    }

    #[test]
    fn response_freezes_headers_after_write() {
        let mut resp = ResponseAccumulator::new();
        resp.set_header("Content-Type".into(), "text/plain".into());
        resp.write(b"hi");
        resp.set_header("X-Late".into(), "ignored".into());
        assert_eq!(resp.headers.len(), 1);
        assert_eq!(resp.body, b"hi");
    }

    #[test]
    fn response_defaults_to_200_empty_body() {
        let resp = ResponseAccumulator::new();
        assert_eq!(resp.status, 200);
        assert!(resp.body.is_empty());
    }
}
