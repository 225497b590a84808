use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cookie::Cookie;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

/// Cookies held by a session, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieJar(BTreeMap<String, String>);

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Overlay every cookie of `other` onto this jar.
    pub fn merge(&mut self, other: &CookieJar) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render the jar as a `Cookie` request header value.
    pub fn header_value(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Absorb one `Set-Cookie` response header. Empty values and
    /// `Max-Age=0` remove the cookie.
    pub fn apply_set_cookie(&mut self, header: &str) {
        let parsed = match Cookie::parse(header) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed Set-Cookie header");
                return;
            }
        };

        let expired = parsed
            .max_age()
            .map(|age| age.is_zero() || age.is_negative())
            .unwrap_or(false);

        if parsed.value().is_empty() || expired {
            self.0.remove(parsed.name());
        } else {
            self.0
                .insert(parsed.name().to_string(), parsed.value().to_string());
        }
    }
}

impl FromIterator<(String, String)> for CookieJar {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Short-lived credential for privileged, account-scoped calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Slot holding the lazily derived session token. Replaced wholesale on
/// invalidation so readers holding the old slot never observe a torn value.
pub type TokenSlot = Arc<OnceCell<SessionToken>>;

/// Mutable transport state owned by one client.
#[derive(Debug)]
pub struct Session {
    pub cookies: CookieJar,
    /// Headers sent with every call, overriding the defaults.
    pub headers: BTreeMap<String, String>,
    pub proxies: BTreeMap<String, String>,
    pub last_call: Option<DateTime<Utc>>,
    bootstrap: CookieJar,
    token: TokenSlot,
}

impl Session {
    pub fn new(bootstrap: CookieJar, proxies: BTreeMap<String, String>) -> Self {
        let mut session = Self {
            cookies: CookieJar::new(),
            headers: BTreeMap::new(),
            proxies,
            last_call: None,
            bootstrap,
            token: Arc::new(OnceCell::new()),
        };
        session.reset();
        session
    }

    /// Clear cookies and header overrides, re-seed the bootstrap cookies
    /// and drop the session token. Proxies survive a reset.
    pub fn reset(&mut self) {
        self.cookies.clear();
        self.cookies.merge(&self.bootstrap);
        self.headers.clear();
        self.invalidate_token();
    }

    pub fn invalidate_token(&mut self) {
        self.token = Arc::new(OnceCell::new());
    }

    /// Current token slot. Callers derive into it outside the session lock.
    pub fn token_slot(&self) -> TokenSlot {
        Arc::clone(&self.token)
    }

    /// The token if it has already been derived.
    pub fn token(&self) -> Option<SessionToken> {
        self.token.get().cloned()
    }
}
