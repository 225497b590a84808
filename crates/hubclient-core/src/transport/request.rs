use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum Body {
    Form(Vec<(String, String)>),
    Raw(String),
}

/// One logical call against the remote service.
///
/// Calls are strict by default: a non-2xx status raises. `tolerant()` hands
/// the raw response back for the caller to interpret.
#[derive(Debug, Clone)]
pub struct Call {
    pub(crate) endpoint: String,
    pub(crate) method: Method,
    pub(crate) body: Option<Body>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) strict: bool,
    pub(crate) quiet: bool,
}

impl Call {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body: None,
            headers: Vec::new(),
            timeout: None,
            strict: true,
            quiet: false,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Some(Body::Form(
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ));
        self
    }

    pub fn raw(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Raw(body.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.strict = false;
        self
    }

    /// Log this call at debug level instead of info.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: String,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn into_text(self) -> String {
        self.body
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            Error::InvalidResponse(format!("Failed to parse JSON from {}: {}", self.url, e))
        })
    }

    /// The structured success flag carried by JSON responses. Accepts `1`,
    /// `"1"` and `true`.
    pub fn success_flag(&self) -> Result<bool> {
        let value: Value = self.json()?;
        Ok(success_flag(&value))
    }
}

pub(crate) fn success_flag(value: &Value) -> bool {
    match value.get("success") {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s.trim() == "1" || s.eq_ignore_ascii_case("true"),
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_flag_variants() {
        assert!(success_flag(&json!({"success": 1})));
        assert!(success_flag(&json!({"success": "1"})));
        assert!(success_flag(&json!({"success": true})));
        assert!(!success_flag(&json!({"success": "0"})));
        assert!(!success_flag(&json!({"success": 0})));
        assert!(!success_flag(&json!({"message": "nope"})));
    }

    #[test]
    fn test_call_builder_defaults() {
        let call = Call::post("front/authenticate")
            .form([("username", "alice")])
            .quiet();
        assert!(call.strict);
        assert!(call.quiet);
        assert_eq!(call.method, Method::POST);
        assert!(matches!(call.body, Some(Body::Form(ref f)) if f.len() == 1));
        assert!(!call.tolerant().strict);
    }
}
