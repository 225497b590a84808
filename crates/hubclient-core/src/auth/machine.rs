//! Login state machine.
//!
//! Authentication always falls back in the same order: cached cookies,
//! then password, then a time-based second factor when the service asks
//! for one. Each stage produces an explicit [`AuthResult`] rather than
//! unwinding through errors.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::extract::PageExtractor;
use crate::transport::request::success_flag;
use crate::transport::{Call, Transport};

use super::credentials::{CredentialStore, Credentials};
use super::otp::OtpGenerator;

/// Endpoint probed for cookie auth and posted to for password and OTP auth
pub(crate) const AUTH_ENDPOINT: &str = "front/authenticate";

/// Landing page carrying the anti-forgery token
pub(crate) const LANDING_ENDPOINT: &str = "";

/// Fixed fields sent with every password login
const LOGIN_PAYLOAD: [(&str, &str); 3] = [
    ("from", "pc_login_modal_:homepage"),
    ("remember_me", "on"),
    ("taste_profile", ""),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    AttemptingCookieAuth,
    AttemptingPasswordAuth,
    AwaitingOtp,
    LoggedIn,
    Failed,
}

/// What the service asked for after a password login that needs a second factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpContinuation {
    pub continuation_token: String,
    pub authy_id: Option<String>,
    pub anti_forgery_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    Success(Value),
    NeedsOtp(OtpContinuation),
    Failed(String),
}

impl AuthResult {
    /// Interpret a password-login response.
    pub fn from_response(data: Value, anti_forgery_token: &str) -> Self {
        if success_flag(&data) {
            return AuthResult::Success(data);
        }

        if let Some(continuation) = data
            .get("autoLoginParameter")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            return AuthResult::NeedsOtp(OtpContinuation {
                continuation_token: continuation.to_string(),
                authy_id: data.get("authyId").and_then(value_as_string),
                anti_forgery_token: anti_forgery_token.to_string(),
            });
        }

        let reason = data
            .get("message")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("credentials rejected")
            .to_string();
        AuthResult::Failed(reason)
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginOptions {
    /// Log in again even when already logged in.
    pub force: bool,
    /// Raise on failure instead of returning `false`.
    pub strict: bool,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            force: false,
            strict: true,
        }
    }
}

impl LoginOptions {
    pub fn force() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn tolerant(mut self) -> Self {
        self.strict = false;
        self
    }
}

pub struct Authenticator {
    credentials: Credentials,
    store: Arc<dyn CredentialStore>,
    extractor: Arc<dyn PageExtractor>,
    otp: OtpGenerator,
    state: watch::Sender<AuthState>,
    /// States entered during the most recent login attempt.
    history: Vec<AuthState>,
    profile: Option<Value>,
}

impl Authenticator {
    pub fn new(
        credentials: Credentials,
        store: Arc<dyn CredentialStore>,
        extractor: Arc<dyn PageExtractor>,
        otp: OtpGenerator,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::LoggedOut);
        Self {
            credentials,
            store,
            extractor,
            otp,
            state,
            history: Vec::new(),
            profile: None,
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn history(&self) -> &[AuthState] {
        &self.history
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    /// Login response of the current session, if logged in.
    pub fn profile(&self) -> Option<&Value> {
        self.profile.as_ref()
    }

    /// Run a store operation on the blocking pool. Keychain and vault
    /// backends do synchronous I/O.
    async fn with_store<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&dyn CredentialStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("Credential store task failed: {}", e)))?
    }

    fn transition(&mut self, next: AuthState) {
        debug!(from = ?self.state(), to = ?next, "Auth state transition");
        self.history.push(next);
        self.state.send_replace(next);
    }

    /// Run the login sequence.
    ///
    /// Already being logged in without `force` fails with `AlreadyLoggedIn`
    /// before any network I/O. Other failures raise only in strict mode;
    /// tolerant mode returns `Ok(false)`.
    pub async fn login(&mut self, transport: &Transport, options: LoginOptions) -> Result<bool> {
        if self.state() == AuthState::LoggedIn && !options.force {
            error!(user = %self.credentials.username, "Client is already logged in");
            return Err(Error::AlreadyLoggedIn);
        }

        info!(user = %self.credentials.username, force = options.force, "Attempting login");
        self.history.clear();

        match self.run(transport).await {
            Ok(data) => {
                self.enter_logged_in(transport, data).await;
                Ok(true)
            }
            Err(e) => {
                self.profile = None;
                self.transition(AuthState::Failed);
                if options.strict {
                    error!(user = %self.credentials.username, error = %e, "Login failed");
                    Err(e)
                } else {
                    warn!(user = %self.credentials.username, error = %e, "Login failed");
                    Ok(false)
                }
            }
        }
    }

    /// Drop the session and return to `LoggedOut`.
    pub fn logout(&mut self, transport: &Transport) {
        info!(user = %self.credentials.username, "Logging out");
        transport.reset();
        self.profile = None;
        self.history.clear();
        self.transition(AuthState::LoggedOut);
    }

    async fn run(&mut self, transport: &Transport) -> Result<Value> {
        if let Some(data) = self.try_cookie_auth(transport).await {
            return Ok(data);
        }

        // Stale cookies are never mixed into a password login
        transport.reset();

        match self.try_password_auth(transport).await? {
            AuthResult::Success(data) => Ok(data),
            AuthResult::Failed(reason) => Err(Error::LoginFailed(reason)),
            AuthResult::NeedsOtp(continuation) => self.submit_otp(transport, continuation).await,
        }
    }

    /// Probe the auth endpoint with cached cookies. Never raises: anything
    /// but a success flag falls through to password auth.
    async fn try_cookie_auth(&mut self, transport: &Transport) -> Option<Value> {
        self.transition(AuthState::AttemptingCookieAuth);
        let username = self.credentials.username.clone();

        let id = username.clone();
        match self.with_store(move |store| store.load_cookies(&id)).await {
            Ok(Some(jar)) => {
                debug!(user = %username, cookies = jar.len(), "Loaded cached cookies");
                transport.with_session(|s| s.cookies.merge(&jar));
            }
            Ok(None) => debug!(user = %username, "No cached cookies"),
            Err(e) => {
                warn!(user = %username, error = %e, "Credential store unavailable, skipping cookie auth");
                return None;
            }
        }

        let response = match transport.call(Call::get(AUTH_ENDPOINT).tolerant().quiet()).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Cookie auth probe failed");
                return None;
            }
        };

        match response.json::<Value>() {
            Ok(data) if success_flag(&data) => {
                info!(user = %username, "Logged in with cached cookies");
                Some(data)
            }
            Ok(_) => {
                debug!(user = %username, "Cached cookies rejected");
                None
            }
            Err(e) => {
                debug!(error = %e, "Cookie auth probe returned no usable JSON");
                None
            }
        }
    }

    async fn try_password_auth(&mut self, transport: &Transport) -> Result<AuthResult> {
        self.transition(AuthState::AttemptingPasswordAuth);
        let password = self.password().await?;

        let landing = transport.call(Call::get(LANDING_ENDPOINT).quiet()).await?;
        let token = self
            .extractor
            .anti_forgery_token(landing.text())
            .ok_or_else(|| Error::LoginFailed("anti-forgery token not found on landing page".to_string()))?;

        let mut form: Vec<(String, String)> = LOGIN_PAYLOAD
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        form.push(("username".to_string(), self.credentials.username.clone()));
        form.push(("password".to_string(), password));
        form.push(("token".to_string(), token.clone()));

        let response = transport.call(Call::post(AUTH_ENDPOINT).form(form)).await?;
        let data: Value = response.json()?;

        let result = AuthResult::from_response(data, &token);
        match &result {
            AuthResult::Success(_) => info!(user = %self.credentials.username, "Logged in with password"),
            AuthResult::NeedsOtp(_) => info!(user = %self.credentials.username, "Second factor required"),
            AuthResult::Failed(reason) => warn!(user = %self.credentials.username, reason = %reason, "Password rejected"),
        }
        Ok(result)
    }

    async fn submit_otp(&mut self, transport: &Transport, continuation: OtpContinuation) -> Result<Value> {
        self.transition(AuthState::AwaitingOtp);
        let secret = self.otp_secret().await?;
        let code = self.otp.generate(&secret, Utc::now()).await?;

        let form = vec![
            ("authy_id".to_string(), continuation.authy_id.unwrap_or_default()),
            ("token".to_string(), continuation.anti_forgery_token),
            ("token2".to_string(), continuation.continuation_token),
            ("username".to_string(), self.credentials.username.clone()),
            ("verification_code".to_string(), code),
            ("verification_modal".to_string(), "1".to_string()),
        ];

        let response = transport.call(Call::post(AUTH_ENDPOINT).form(form)).await?;
        let data: Value = response.json()?;

        if success_flag(&data) {
            info!(user = %self.credentials.username, "Logged in with second factor");
            Ok(data)
        } else {
            debug!(response = %data, "Second factor rejected");
            Err(Error::TwoFactorFailed)
        }
    }

    /// The supplied password, backfilled from the store when absent.
    async fn password(&mut self) -> Result<String> {
        if let Some(password) = &self.credentials.password {
            return Ok(password.clone());
        }

        info!(user = %self.credentials.username, "No password provided, loading from credential store");
        let id = self.credentials.username.clone();
        match self.with_store(move |store| store.load_credentials(&id)).await {
            Ok(Some((_, password))) => {
                self.credentials.password = Some(password.clone());
                Ok(password)
            }
            Ok(None) => Err(Error::LoginFailed("no password available".to_string())),
            Err(e) => Err(Error::LoginFailed(format!("no password available: {}", e))),
        }
    }

    async fn otp_secret(&self) -> Result<String> {
        if let Some(secret) = &self.credentials.otp_secret {
            return Ok(secret.clone());
        }
        let id = self.credentials.username.clone();
        self.with_store(move |store| store.get_secret(&id))
            .await?
            .ok_or_else(|| Error::MissingOtpSecret(self.credentials.username.clone()))
    }

    async fn enter_logged_in(&mut self, transport: &Transport, data: Value) {
        let jar = transport.with_session(|s| {
            s.invalidate_token();
            s.cookies.clone()
        });
        self.transition(AuthState::LoggedIn);
        self.profile = Some(data);

        let id = self.credentials.username.clone();
        if let Err(e) = self.with_store(move |store| store.save_cookies(&id, &jar)).await {
            warn!(user = %self.credentials.username, error = %e, "Failed to persist cookies");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_result_success() {
        let result = AuthResult::from_response(json!({"success": "1", "username": "alice"}), "tok");
        assert!(matches!(result, AuthResult::Success(_)));
    }

    #[test]
    fn test_auth_result_needs_otp() {
        let result = AuthResult::from_response(
            json!({"success": "0", "autoLoginParameter": "cont-123", "authyId": 987}),
            "tok",
        );
        assert_eq!(
            result,
            AuthResult::NeedsOtp(OtpContinuation {
                continuation_token: "cont-123".to_string(),
                authy_id: Some("987".to_string()),
                anti_forgery_token: "tok".to_string(),
            })
        );
    }

    #[test]
    fn test_auth_result_failed_carries_message() {
        let result = AuthResult::from_response(json!({"success": 0, "message": "Bad password"}), "tok");
        assert_eq!(result, AuthResult::Failed("Bad password".to_string()));

        let result = AuthResult::from_response(json!({"success": 0, "autoLoginParameter": ""}), "tok");
        assert_eq!(result, AuthResult::Failed("credentials rejected".to_string()));
    }

    #[test]
    fn test_login_options() {
        assert_eq!(LoginOptions::default(), LoginOptions { force: false, strict: true });
        assert_eq!(LoginOptions::force().tolerant(), LoginOptions { force: true, strict: false });
    }
}
