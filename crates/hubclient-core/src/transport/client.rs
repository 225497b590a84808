//! HTTP transport for the remote service.
//!
//! This module provides the `Transport` struct: it resolves endpoints
//! against the configured host, merges headers, throttles calls, keeps the
//! session cookie jar in sync, and retries transient failures, rate limits
//! and anti-automation challenges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy, Url};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

use super::challenge::{ChallengeDetector, ChallengeParams, ChallengeSolver};
use super::request::{Body, Call, Response};
use super::session::{CookieJar, Session};

// ============================================================================
// Constants
// ============================================================================

/// Body marker the service uses for "too many requests". It answers with a
/// 200 page titled 429 rather than the status code itself.
const RATE_LIMIT_MARKER: &str = "429</title>";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8";

/// Immutable call policy shared by every clone of a transport.
#[derive(Debug)]
struct Policy {
    host: Url,
    locale: String,
    timeout: Duration,
    delay: Duration,
    max_attempts: u32,
    backoff: Duration,
}

/// Outcome of one network round trip, before retry policy is applied.
enum Attempt {
    Complete(Response),
    RateLimited,
    Challenge(ChallengeParams),
}

/// Transport for the remote service.
/// Clone is cheap - every clone shares the connection pool and the session.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    policy: Arc<Policy>,
    session: Arc<Mutex<Session>>,
    started: Arc<AtomicBool>,
    detector: Arc<ChallengeDetector>,
    solver: Option<Arc<dyn ChallengeSolver>>,
}

impl Transport {
    /// Create a new transport from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.timeout());
        for (scheme, url) in &config.proxies {
            let proxy = match scheme.as_str() {
                "http" => Proxy::http(url),
                "https" => Proxy::https(url),
                "all" => Proxy::all(url),
                other => {
                    return Err(Error::Config(format!("Unknown proxy scheme: {}", other)));
                }
            }
            .map_err(|e| Error::Config(format!("Invalid proxy {}: {}", url, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;

        let mut host = config.host.clone();
        if !host.ends_with('/') {
            host.push('/');
        }
        let host = Url::parse(&host)
            .map_err(|e| Error::Config(format!("Invalid host {}: {}", config.host, e)))?;

        let bootstrap: CookieJar = config
            .bootstrap_cookies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            client,
            policy: Arc::new(Policy {
                host,
                locale: config.locale.clone(),
                timeout: config.timeout(),
                delay: config.delay(),
                max_attempts: config.max_attempts.max(1),
                backoff: config.backoff(),
            }),
            session: Arc::new(Mutex::new(Session::new(bootstrap, config.proxies.clone()))),
            started: Arc::new(AtomicBool::new(false)),
            detector: Arc::new(ChallengeDetector::default()),
            solver: None,
        })
    }

    /// Install the solver invoked when a challenge is detected
    pub fn with_challenge_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn with_challenge_detector(mut self, detector: ChallengeDetector) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    pub fn host(&self) -> &Url {
        &self.policy.host
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the session. The lock is never
    /// held across a network round trip.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.session();
        f(&mut session)
    }

    pub fn cookies(&self) -> CookieJar {
        self.session().cookies.clone()
    }

    /// Reset the session: cookies cleared, token invalidated
    pub fn reset(&self) {
        debug!("Resetting transport session");
        self.session().reset();
    }

    /// Resolve an endpoint against the host. Absolute URLs pass through.
    pub fn resolve_url(&self, endpoint: &str) -> Result<Url> {
        let resolved = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            Url::parse(endpoint)
        } else {
            self.policy.host.join(endpoint.trim_start_matches('/'))
        };
        resolved.map_err(|e| Error::Config(format!("Invalid endpoint {}: {}", endpoint, e)))
    }

    /// Send a call, absorbing transient failures, rate limits and at most
    /// one challenge resolution. Fails with `ConnectionFailure` once the
    /// attempt bound is exhausted.
    pub async fn call(&self, call: Call) -> Result<Response> {
        if call.quiet {
            debug!(method = %call.method, endpoint = %call.endpoint, "Making call");
        } else {
            info!(method = %call.method, endpoint = %call.endpoint, "Making call");
        }

        self.throttle().await;

        let url = self.resolve_url(&call.endpoint)?;
        let max_attempts = self.policy.max_attempts;
        let mut attempts: u32 = 0;
        let mut challenge_resolved = false;

        while attempts < max_attempts {
            match self.attempt(&call, &url).await {
                Ok(Attempt::Complete(response)) => {
                    if attempts > 0 {
                        debug!(url = %url, attempts = attempts + 1, "Call succeeded after retry");
                    }
                    return Self::finish(response, call.strict);
                }
                Ok(Attempt::Challenge(params)) => {
                    if challenge_resolved {
                        error!(url = %url, "Challenge persisted after resolution");
                        return Err(Error::ChallengeUnresolved(format!(
                            "challenge persisted after resolution on {}",
                            url
                        )));
                    }
                    info!(url = %url, cookie = %params.cookie_name, "Challenge found, attempting to resolve");
                    self.resolve_challenge(&params)?;
                    challenge_resolved = true;
                }
                Ok(Attempt::RateLimited) => {
                    attempts += 1;
                    self.back_off(&call, &url, attempts, &Error::RateLimited).await;
                }
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    self.back_off(&call, &url, attempts, &e).await;
                }
                Err(e) => return Err(e),
            }
        }

        error!(url = %url, attempts = attempts, "Call failed, attempts exhausted");
        Err(Error::ConnectionFailure { attempts })
    }

    /// The first call after creation is immediate; every later call waits
    /// the configured minimum delay first.
    async fn throttle(&self) {
        let already_started = self.started.swap(true, Ordering::SeqCst);
        if already_started && !self.policy.delay.is_zero() {
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    async fn back_off(&self, call: &Call, url: &Url, attempt: u32, cause: &Error) {
        let max = self.policy.max_attempts;
        if call.quiet {
            debug!(url = %url, attempt = attempt, max_attempts = max, error = %cause, "Call failed, retrying");
        } else {
            warn!(url = %url, attempt = attempt, max_attempts = max, error = %cause, "Call failed, retrying");
        }
        if attempt < max && !self.policy.backoff.is_zero() {
            tokio::time::sleep(self.policy.backoff).await;
        }
    }

    fn resolve_challenge(&self, params: &ChallengeParams) -> Result<()> {
        let solver = self
            .solver
            .as_ref()
            .ok_or_else(|| Error::ChallengeUnresolved("no challenge solver configured".to_string()))?;

        let mut session = self.session();
        solver
            .solve(&mut session, params)
            .map_err(|e| Error::ChallengeUnresolved(e.to_string()))
    }

    async fn attempt(&self, call: &Call, url: &Url) -> Result<Attempt> {
        let headers = self.build_headers(call)?;

        let mut request = self
            .client
            .request(call.method.clone(), url.clone())
            .headers(headers)
            .timeout(call.timeout.unwrap_or(self.policy.timeout));

        request = match &call.body {
            Some(Body::Form(fields)) => request.form(fields),
            Some(Body::Raw(raw)) => request.body(raw.clone()),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().clone();
        let headers = response.headers().clone();

        {
            let mut session = self.session();
            for value in headers.get_all(header::SET_COOKIE) {
                if let Ok(raw) = value.to_str() {
                    session.cookies.apply_set_cookie(raw);
                }
            }
            session.last_call = Some(Utc::now());
        }

        let body = response.text().await?;

        if body.contains(RATE_LIMIT_MARKER) {
            return Ok(Attempt::RateLimited);
        }
        if let Some(params) = self.detector.detect(&body) {
            return Ok(Attempt::Challenge(params));
        }

        Ok(Attempt::Complete(Response {
            status,
            url: final_url,
            headers,
            body,
        }))
    }

    /// Defaults, then session overrides, then caller headers, then locale.
    fn build_headers(&self, call: &Call) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(header::ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));

        let (overrides, cookie) = {
            let session = self.session();
            (session.headers.clone(), session.cookies.header_value())
        };

        for (name, value) in overrides.iter().chain(
            call.headers.iter().map(|(k, v)| (k, v)),
        ) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("Invalid header value for {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_str(&self.policy.locale)
                .map_err(|e| Error::Config(format!("Invalid locale: {}", e)))?,
        );

        if let Some(cookie) = cookie {
            headers.insert(
                header::COOKIE,
                HeaderValue::from_str(&cookie)
                    .map_err(|e| Error::InvalidResponse(format!("Unencodable cookie jar: {}", e)))?,
            );
        }

        Ok(headers)
    }

    fn finish(response: Response, strict: bool) -> Result<Response> {
        if strict && !response.is_success() {
            return Err(Error::from_status(response.status, &response.body));
        }
        Ok(response)
    }
}

// ============================================================================
// Tests
// ============================================================================
