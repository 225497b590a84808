//! Client facade.
//!
//! A [`Client`] owns one transport and one authenticator. The transport can
//! be used concurrently by harvest workers; logins are serialized through
//! the authenticator lock, and readers of the session token observe the
//! auth state through a watch channel instead of that lock.

use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::account::{Account, AccountKind, Collection};
use crate::auth::machine::LANDING_ENDPOINT;
use crate::auth::otp::decode_secret;
use crate::auth::{
    AuthState, Authenticator, CredentialStore, Credentials, LoginOptions, MemoryCredentialStore, OtpGenerator,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::{PageExtractor, RegexExtractor};
use crate::harvest::{HarvestPipeline, HarvestReport, JsonFileSink, StorageSink};
use crate::transport::{Call, ChallengeDetector, ChallengeSolver, Response, SessionToken, Transport};

/// Creator dashboard, visited before the video manager so it serves data
const CREATOR_DASHBOARD_ENDPOINT: &str = "creator/dashboard";

const VIDEO_MANAGER_ENDPOINT: &str = "creator/video_manager/json";

/// Sink category for creator video-manager reports
pub const VIDEO_MANAGER_CATEGORY: &str = "video_manager";

pub struct ClientBuilder {
    config: Config,
    credentials: Credentials,
    store: Option<Arc<dyn CredentialStore>>,
    extractor: Option<Arc<dyn PageExtractor>>,
    solver: Option<Arc<dyn ChallengeSolver>>,
    detector: Option<ChallengeDetector>,
    sink: Option<Arc<dyn StorageSink<Value>>>,
}

impl ClientBuilder {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            config: Config::default(),
            credentials,
            store: None,
            extractor: None,
            solver: None,
            detector: None,
            sink: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Credential store. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn challenge_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn challenge_detector(mut self, detector: ChallengeDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Harvest sink. Defaults to JSON files under the data directory.
    pub fn sink(mut self, sink: Arc<dyn StorageSink<Value>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Client> {
        let mut transport = Transport::new(&self.config)?;
        if let Some(detector) = self.detector {
            transport = transport.with_challenge_detector(detector);
        }
        if let Some(solver) = self.solver {
            transport = transport.with_challenge_solver(solver);
        }

        let store: Arc<dyn CredentialStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCredentialStore::new()),
        };
        let extractor: Arc<dyn PageExtractor> = match self.extractor {
            Some(extractor) => extractor,
            None => Arc::new(RegexExtractor::default()),
        };
        let sink: Arc<dyn StorageSink<Value>> = match self.sink {
            Some(sink) => sink,
            None => {
                let dir = self
                    .config
                    .data_dir()
                    .map_err(|e| Error::Config(e.to_string()))?
                    .join("batches");
                Arc::new(JsonFileSink::new(dir)?.with_retention(self.config.batch_retention))
            }
        };

        let username = self.credentials.username.clone();
        let auth = Authenticator::new(
            self.credentials,
            Arc::clone(&store),
            Arc::clone(&extractor),
            OtpGenerator::from_config(&self.config),
        );
        let state = auth.subscribe();

        Ok(Client {
            config: self.config,
            transport,
            auth: Mutex::new(auth),
            state,
            account: RwLock::new(None),
            extractor,
            store,
            sink,
            username,
        })
    }
}

pub struct Client {
    config: Config,
    transport: Transport,
    auth: Mutex<Authenticator>,
    state: watch::Receiver<AuthState>,
    account: RwLock<Option<Arc<Account>>>,
    extractor: Arc<dyn PageExtractor>,
    store: Arc<dyn CredentialStore>,
    sink: Arc<dyn StorageSink<Value>>,
    username: String,
}

/// One response body as harvest records: arrays are flattened.
fn records_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

impl Client {
    pub fn builder(credentials: Credentials) -> ClientBuilder {
        ClientBuilder::new(credentials)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    // ===== Authentication =====

    /// Log in through cookie, password and OTP stages.
    ///
    /// Strict options raise every failure; tolerant options return
    /// `Ok(false)`. `AlreadyLoggedIn` is raised in both modes.
    pub async fn login(&self, options: LoginOptions) -> Result<bool> {
        let mut auth = self.auth.lock().await;
        let result = auth.login(&self.transport, options).await;

        if matches!(result, Err(Error::AlreadyLoggedIn)) {
            return result;
        }

        let account = if matches!(result, Ok(true)) {
            auth.profile()
                .map(|profile| Arc::new(Account::from_login(profile, auth.username())))
        } else {
            None
        };
        *self.account.write().unwrap_or_else(PoisonError::into_inner) = account;
        result
    }

    pub async fn logout(&self) {
        let mut auth = self.auth.lock().await;
        auth.logout(&self.transport);
        *self.account.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == AuthState::LoggedIn
    }

    /// Receiver observing auth state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.state.clone()
    }

    /// States entered during the most recent login attempt.
    pub async fn login_history(&self) -> Vec<AuthState> {
        self.auth.lock().await.history().to_vec()
    }

    /// Save a password and optional OTP seed for `username`.
    pub fn register_credentials(&self, username: &str, password: &str, otp_secret: Option<&str>) -> Result<()> {
        if let Some(secret) = otp_secret {
            decode_secret(secret)?;
        }
        self.store.save_credentials(username, password)?;
        if let Some(secret) = otp_secret {
            self.store.save_secret(username, secret)?;
        }
        info!(user = %username, otp = otp_secret.is_some(), "Credentials registered");
        Ok(())
    }

    // ===== Calls =====

    pub async fn call(&self, call: Call) -> Result<Response> {
        self.transport.call(call).await
    }

    /// The session token, derived on first use and shared by every caller.
    ///
    /// Waits out a login in progress. Concurrent first callers trigger a
    /// single derivation. A token derived into a slot that a re-login
    /// replaced meanwhile is discarded and derived again.
    pub async fn session_token(&self) -> Result<SessionToken> {
        let mut state = self.state.clone();
        loop {
            let current = *state
                .wait_for(|s| {
                    !matches!(
                        s,
                        AuthState::AttemptingCookieAuth | AuthState::AttemptingPasswordAuth | AuthState::AwaitingOtp
                    )
                })
                .await
                .map_err(|_| Error::NotLoggedIn)?;
            if current != AuthState::LoggedIn {
                return Err(Error::NotLoggedIn);
            }

            let slot = self.transport.with_session(|s| s.token_slot());
            let derived = slot
                .get_or_try_init(|| async {
                    debug!("Deriving session token");
                    let landing = self.transport.call(Call::get(LANDING_ENDPOINT).quiet()).await?;
                    self.extractor
                        .anti_forgery_token(landing.text())
                        .map(SessionToken::new)
                        .ok_or_else(|| Error::InvalidResponse("session token not found on landing page".to_string()))
                })
                .await
                .cloned();

            let still_current = self.transport.with_session(|s| Arc::ptr_eq(&slot, &s.token_slot()));
            if still_current && self.is_logged_in() {
                return derived;
            }
            debug!("Session changed while deriving token, deriving again");
        }
    }

    pub fn invalidate_session_token(&self) {
        self.transport.with_session(|s| s.invalidate_token());
    }

    // ===== Account =====

    pub fn account(&self) -> Result<Arc<Account>> {
        self.account
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotLoggedIn)
    }

    /// Resolve whether the account is a member or a creator. The profile
    /// link of a creator redirects to a creator page.
    pub async fn account_kind(&self) -> Result<AccountKind> {
        let account = self.account()?;
        let kind = account
            .kind
            .get_or_try_init(|| async {
                let response = self.transport.call(Call::get(account.profile_endpoint()).quiet()).await?;
                let kind = AccountKind::from_profile_path(response.url().path());
                debug!(account = %account.name, kind = kind.as_str(), "Account kind resolved");
                Ok::<_, Error>(kind)
            })
            .await?;
        Ok(*kind)
    }

    /// Links listed by one account collection. Loaded once until
    /// [`Client::clear_cache`].
    pub async fn collection(&self, collection: Collection) -> Result<Vec<String>> {
        let account = self.account()?;
        let links = account
            .collection(collection)
            .get_or_try_init(|| async {
                let page = self
                    .transport
                    .call(Call::get(account.collection_endpoint(collection)))
                    .await?;
                let links = if collection.lists_profiles() {
                    self.extractor.user_links(page.text())
                } else {
                    self.extractor.video_links(page.text())
                };
                debug!(account = %account.name, collection = collection.as_str(), entries = links.len(), "Collection loaded");
                Ok::<_, Error>(links)
            })
            .await?;
        Ok(links.clone())
    }

    /// Profiles the account follows.
    pub async fn subscriptions(&self) -> Result<Vec<String>> {
        self.collection(Collection::Subscriptions).await
    }

    /// Recently watched videos.
    pub async fn watched(&self) -> Result<Vec<String>> {
        self.collection(Collection::Watched).await
    }

    pub async fn liked(&self) -> Result<Vec<String>> {
        self.collection(Collection::Liked).await
    }

    pub async fn recommended(&self) -> Result<Vec<String>> {
        self.collection(Collection::Recommended).await
    }

    pub async fn feed(&self) -> Result<Vec<String>> {
        self.collection(Collection::Feed).await
    }

    /// Drop every lazily loaded account collection.
    pub fn clear_cache(&self) {
        let mut slot = self.account.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(fresh) = slot.as_ref().map(|a| Arc::new(a.cleared())) {
            *slot = Some(fresh);
        }
    }

    /// Clear cached account data, optionally logging in again first.
    pub async fn refresh_account(&self, refresh_login: bool) -> Result<()> {
        if refresh_login {
            self.login(LoginOptions::force()).await?;
        }
        self.clear_cache();
        Ok(())
    }

    // ===== Harvesting =====

    fn pipeline(&self) -> HarvestPipeline<Value> {
        HarvestPipeline::new(Arc::clone(&self.sink), self.config.harvest_concurrency)
    }

    fn account_id(&self) -> String {
        self.account()
            .map(|a| a.name.clone())
            .unwrap_or_else(|_| self.username.clone())
    }

    fn json_fetcher(&self) -> impl Fn(String) -> BoxFuture<'static, anyhow::Result<Vec<Value>>> {
        let transport = self.transport.clone();
        move |endpoint| {
            let transport = transport.clone();
            async move {
                let response = transport.call(Call::get(endpoint).quiet()).await?;
                Ok::<_, anyhow::Error>(records_of(response.json()?))
            }
            .boxed()
        }
    }

    /// GET every endpoint concurrently and store the JSON bodies as one
    /// batch of `category`.
    pub async fn harvest<I>(&self, category: &str, endpoints: I) -> HarvestReport<Value>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.pipeline()
            .submit(category, &self.account_id(), endpoints, self.json_fetcher())
            .await
    }

    /// Store the creator video-manager listing. Members get `Unsupported`.
    pub async fn creator_report(&self) -> Result<HarvestReport<Value>> {
        let account = self.account()?;
        let kind = self.account_kind().await?;
        if !kind.capabilities().creator_reports {
            return Err(Error::Unsupported(kind.as_str()));
        }

        self.transport.call(Call::get(CREATOR_DASHBOARD_ENDPOINT).quiet()).await?;
        let report = self
            .pipeline()
            .submit(
                VIDEO_MANAGER_CATEGORY,
                &account.name,
                [VIDEO_MANAGER_ENDPOINT],
                self.json_fetcher(),
            )
            .await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::MemorySink;
    use crate::test_support::{test_config, RFC_SECRET};
    use crate::transport::CookieJar;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{body_string_contains, header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LANDING_PAGE: &str = r#"<form><input type="hidden" name="token" value="tok-123"></form>"#;

    struct Harness {
        server: MockServer,
        store: Arc<MemoryCredentialStore>,
        sink: Arc<MemorySink<Value>>,
    }

    impl Harness {
        async fn start() -> Self {
            Self {
                server: MockServer::start().await,
                store: Arc::new(MemoryCredentialStore::new()),
                sink: Arc::new(MemorySink::new()),
            }
        }

        fn client(&self, credentials: Credentials) -> Client {
            Client::builder(credentials)
                .config(test_config(&self.server.uri()))
                .store(self.store.clone())
                .sink(self.sink.clone())
                .build()
                .unwrap()
        }

        async fn request_count(&self) -> usize {
            self.server.received_requests().await.map(|r| r.len()).unwrap_or(0)
        }

        async fn mount_cookie_check(&self, body: Value) {
            Mock::given(method("GET"))
                .and(path("/front/authenticate"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(&self.server)
                .await;
        }

        async fn mount_landing(&self) {
            Mock::given(method("GET"))
                .and(path("/"))
                .respond_with(ResponseTemplate::new(200).set_body_string(LANDING_PAGE))
                .mount(&self.server)
                .await;
        }

        fn save_cookie(&self, name: &str, value: &str) {
            let mut jar = CookieJar::new();
            jar.set(name, value);
            self.store.save_cookies("alice", &jar).unwrap();
        }
    }

    fn alice() -> Credentials {
        Credentials::new("alice").with_password("hunter2")
    }

    /// Log in with a cookie the auth endpoint accepts.
    async fn logged_in(harness: &Harness) -> Client {
        harness.save_cookie("ss", "valid");
        harness
            .mount_cookie_check(json!({"success": "1", "username": "alice"}))
            .await;
        let client = harness.client(alice());
        assert!(client.login(LoginOptions::default()).await.unwrap());
        client
    }

    #[tokio::test]
    async fn test_valid_cookies_skip_password_login() {
        let harness = Harness::start().await;
        harness.save_cookie("ss", "valid");
        Mock::given(method("GET"))
            .and(path("/front/authenticate"))
            .and(header_regex("cookie", "ss=valid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "1", "username": "alice"})))
            .expect(1)
            .mount(&harness.server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&harness.server)
            .await;

        let client = harness.client(Credentials::new("alice"));
        assert!(client.login(LoginOptions::default()).await.unwrap());

        assert_eq!(client.state(), AuthState::LoggedIn);
        assert_eq!(
            client.login_history().await,
            vec![AuthState::AttemptingCookieAuth, AuthState::LoggedIn]
        );
        assert_eq!(client.account().unwrap().name, "alice");
    }

    #[tokio::test]
    async fn test_expired_cookies_fall_back_to_one_password_post() {
        let harness = Harness::start().await;
        harness.save_cookie("ss", "stale");
        harness.mount_cookie_check(json!({"success": "0"})).await;
        harness.mount_landing().await;
        Mock::given(method("POST"))
            .and(header_regex("cookie", "ss=stale"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .with_priority(1)
            .mount(&harness.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/front/authenticate"))
            .and(body_string_contains("password=hunter2"))
            .and(body_string_contains("token=tok-123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "ss=fresh; Path=/")
                    .set_body_json(json!({"success": "1", "username": "alice", "premium_redirect_cookie": "1"})),
            )
            .expect(1)
            .mount(&harness.server)
            .await;

        let client = harness.client(alice());
        assert!(client.login(LoginOptions::default()).await.unwrap());

        assert_eq!(
            client.login_history().await,
            vec![
                AuthState::AttemptingCookieAuth,
                AuthState::AttemptingPasswordAuth,
                AuthState::LoggedIn
            ]
        );
        assert!(client.account().unwrap().is_premium);

        // Fresh cookies are persisted for the next cookie login
        let saved = harness.store.load_cookies("alice").unwrap().unwrap();
        assert_eq!(saved.get("ss"), Some("fresh"));
    }

    #[tokio::test]
    async fn test_password_backfilled_from_store() {
        let harness = Harness::start().await;
        harness.store.save_credentials("alice", "from-store").unwrap();
        harness.mount_cookie_check(json!({"success": "0"})).await;
        harness.mount_landing().await;
        Mock::given(method("POST"))
            .and(body_string_contains("password=from-store"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "1"})))
            .expect(1)
            .mount(&harness.server)
            .await;

        let client = harness.client(Credentials::new("alice"));
        assert!(client.login(LoginOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_factor_submits_otp_once() {
        let harness = Harness::start().await;
        harness.mount_cookie_check(json!({"success": "0"})).await;
        harness.mount_landing().await;
        Mock::given(method("POST"))
            .and(path("/front/authenticate"))
            .and(body_string_contains("verification_code="))
            .and(body_string_contains("token2=cont-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "1", "username": "alice"})))
            .expect(1)
            .with_priority(1)
            .mount(&harness.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/front/authenticate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": "0", "autoLoginParameter": "cont-1", "authyId": "42"})),
            )
            .expect(1)
            .mount(&harness.server)
            .await;

        let client = harness.client(alice().with_otp_secret(RFC_SECRET));
        assert!(client.login(LoginOptions::default()).await.unwrap());

        assert_eq!(
            client.login_history().await,
            vec![
                AuthState::AttemptingCookieAuth,
                AuthState::AttemptingPasswordAuth,
                AuthState::AwaitingOtp,
                AuthState::LoggedIn
            ]
        );
    }

    async fn mount_otp_challenge(harness: &Harness) {
        harness.mount_cookie_check(json!({"success": "0"})).await;
        harness.mount_landing().await;
        Mock::given(method("POST"))
            .and(body_string_contains("verification_code="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "0"})))
            .with_priority(1)
            .mount(&harness.server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": "0", "autoLoginParameter": "cont-1"})),
            )
            .mount(&harness.server)
            .await;
    }

    #[tokio::test]
    async fn test_missing_otp_secret() {
        let harness = Harness::start().await;
        mount_otp_challenge(&harness).await;

        let client = harness.client(alice());
        let err = client.login(LoginOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::MissingOtpSecret(ref user) if user == "alice"));
        assert_eq!(client.state(), AuthState::Failed);
        assert!(client.account().is_err());
    }

    #[tokio::test]
    async fn test_rejected_otp_code() {
        let harness = Harness::start().await;
        mount_otp_challenge(&harness).await;
        harness.store.save_secret("alice", RFC_SECRET).unwrap();

        let client = harness.client(alice());
        let err = client.login(LoginOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::TwoFactorFailed));
    }

    #[tokio::test]
    async fn test_tolerant_login_returns_false() {
        let harness = Harness::start().await;
        harness.mount_cookie_check(json!({"success": "0"})).await;
        harness.mount_landing().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "0", "message": "Bad password"})))
            .mount(&harness.server)
            .await;

        let client = harness.client(alice());
        assert!(!client.login(LoginOptions::default().tolerant()).await.unwrap());
        assert_eq!(client.state(), AuthState::Failed);

        let err = client.login(LoginOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::LoginFailed(ref reason) if reason == "Bad password"));
    }

    #[tokio::test]
    async fn test_already_logged_in_makes_no_requests() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;
        let before = harness.request_count().await;

        let err = client.login(LoginOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyLoggedIn));
        let err = client.login(LoginOptions::default().tolerant()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyLoggedIn));

        assert_eq!(harness.request_count().await, before);
        assert!(client.is_logged_in());
        assert!(client.account().is_ok());

        // Forcing goes back to the network
        assert!(client.login(LoginOptions::force()).await.unwrap());
        assert!(harness.request_count().await > before);
    }

    #[tokio::test]
    async fn test_concurrent_session_token_derived_once() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LANDING_PAGE))
            .expect(1)
            .mount(&harness.server)
            .await;

        let tokens = futures::future::join_all((0..5).map(|_| client.session_token())).await;
        for token in tokens {
            assert_eq!(token.unwrap().as_str(), "tok-123");
        }
    }

    #[tokio::test]
    async fn test_session_token_requires_login() {
        let harness = Harness::start().await;
        let client = harness.client(alice());
        assert!(matches!(client.session_token().await, Err(Error::NotLoggedIn)));
    }

    #[tokio::test]
    async fn test_invalidated_token_is_derived_again() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LANDING_PAGE))
            .expect(2)
            .mount(&harness.server)
            .await;

        client.session_token().await.unwrap();
        client.session_token().await.unwrap();
        client.invalidate_session_token();
        client.session_token().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_derived_during_relogin_belongs_to_new_session() {
        let harness = Harness::start().await;
        harness.save_cookie("ss", "valid");
        Mock::given(method("GET"))
            .and(path("/front/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "1", "username": "alice"})))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&harness.server)
            .await;
        harness.mount_cookie_check(json!({"success": "0"})).await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(LANDING_PAGE)
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&harness.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/front/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "1", "username": "alice"})))
            .expect(1)
            .mount(&harness.server)
            .await;

        let client = harness.client(alice());
        assert!(client.login(LoginOptions::default()).await.unwrap());

        // The re-login starts while the reader's derivation is in flight
        let (token, relogin) = tokio::join!(client.session_token(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.login(LoginOptions::force()).await
        });

        assert!(relogin.unwrap());
        let token = token.unwrap();
        assert_eq!(client.state(), AuthState::LoggedIn);
        assert_eq!(client.transport().with_session(|s| s.token()), Some(token));
    }

    #[tokio::test]
    async fn test_logout_resets_session() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;

        client.logout().await;

        assert_eq!(client.state(), AuthState::LoggedOut);
        assert!(client.transport().cookies().get("ss").is_none());
        assert!(matches!(client.account(), Err(Error::NotLoggedIn)));
    }

    #[tokio::test]
    async fn test_subscriptions_cached_until_cleared() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;
        Mock::given(method("GET"))
            .and(path("/users/alice/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/users/bob">bob</a><a href="/model/carol">carol</a><a href="/users/bob">again</a>"#,
            ))
            .expect(2)
            .mount(&harness.server)
            .await;

        let first = client.subscriptions().await.unwrap();
        assert_eq!(first, vec!["/users/bob".to_string(), "/model/carol".to_string()]);
        assert_eq!(client.subscriptions().await.unwrap(), first);

        client.clear_cache();
        assert_eq!(client.subscriptions().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_video_collections_cached_until_cleared() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;
        let listing = r#"<a href="/view_video.php?viewkey=ph1">a</a><a href="/view_video.php?viewkey=ph2">b</a>"#;
        for endpoint in ["/users/alice/videos/recent", "/users/alice/videos/favorites", "/recommended", "/feeds"] {
            Mock::given(method("GET"))
                .and(path(endpoint))
                .respond_with(ResponseTemplate::new(200).set_body_string(listing))
                .expect(2)
                .mount(&harness.server)
                .await;
        }
        let expected = vec![
            "/view_video.php?viewkey=ph1".to_string(),
            "/view_video.php?viewkey=ph2".to_string(),
        ];

        for _ in 0..2 {
            assert_eq!(client.watched().await.unwrap(), expected);
            assert_eq!(client.liked().await.unwrap(), expected);
            assert_eq!(client.recommended().await.unwrap(), expected);
            assert_eq!(client.feed().await.unwrap(), expected);
        }

        client.clear_cache();
        for collection in [Collection::Watched, Collection::Liked, Collection::Recommended, Collection::Feed] {
            assert_eq!(client.collection(collection).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_collections_require_login() {
        let harness = Harness::start().await;
        let client = harness.client(alice());
        assert!(matches!(client.feed().await, Err(Error::NotLoggedIn)));
        assert_eq!(harness.request_count().await, 0);
    }

    #[tokio::test]
    async fn test_creator_report_stored_as_one_batch() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;
        Mock::given(method("GET"))
            .and(path("/users/alice"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/model/alice"))
            .mount(&harness.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/model/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_string("creator page"))
            .mount(&harness.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/creator/dashboard"))
            .respond_with(ResponseTemplate::new(200).set_body_string("dashboard"))
            .expect(1)
            .mount(&harness.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/creator/video_manager/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}])))
            .expect(1)
            .mount(&harness.server)
            .await;

        assert_eq!(client.account_kind().await.unwrap(), AccountKind::Creator);
        let report = client.creator_report().await.unwrap();
        assert_eq!(report.stored.as_ref().ok(), Some(&2));

        let batches = harness.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].category, VIDEO_MANAGER_CATEGORY);
        assert_eq!(batches[0].account, "alice");
    }

    #[tokio::test]
    async fn test_creator_report_unsupported_for_members() {
        let harness = Harness::start().await;
        let client = logged_in(&harness).await;
        Mock::given(method("GET"))
            .and(path("/users/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_string("member page"))
            .expect(1)
            .mount(&harness.server)
            .await;

        assert!(matches!(client.creator_report().await, Err(Error::Unsupported("member"))));
        // Kind is resolved once
        assert_eq!(client.account_kind().await.unwrap(), AccountKind::Member);
    }

    #[tokio::test]
    async fn test_harvest_reports_partial_success() {
        let harness = Harness::start().await;
        let client = harness.client(alice());
        Mock::given(method("GET"))
            .and(path("/feed/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"v": 1}, {"v": 2}])))
            .mount(&harness.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed/2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&harness.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 3})))
            .mount(&harness.server)
            .await;

        let report = client.harvest("feed", ["feed/1", "feed/2", "feed/3"]).await;

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.succeeded().count(), 2);
        assert!(matches!(
            &report.results[1].outcome,
            Err(Error::HarvestItemFailed { id, .. }) if id == "feed/2"
        ));
        assert_eq!(report.stored.as_ref().ok(), Some(&3));

        let batches = harness.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].account, "alice");
        assert_eq!(batches[0].records, vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 3})]);
    }

    #[tokio::test]
    async fn test_register_credentials() {
        let harness = Harness::start().await;
        let client = harness.client(Credentials::new("alice"));

        client.register_credentials("alice", "pw", Some(RFC_SECRET)).unwrap();
        assert_eq!(
            harness.store.load_credentials("alice").unwrap(),
            Some(("alice".to_string(), "pw".to_string()))
        );
        assert_eq!(harness.store.get_secret("alice").unwrap().as_deref(), Some(RFC_SECRET));

        let err = client.register_credentials("bob", "pw", Some("not base32!")).unwrap_err();
        assert!(matches!(err, Error::InvalidOtpSecret(_)));
        assert!(harness.store.load_credentials("bob").unwrap().is_none());
    }

    /// Store whose cookie lookup blocks the calling thread.
    struct SlowStore(MemoryCredentialStore);

    impl CredentialStore for SlowStore {
        fn load_credentials(&self, id: &str) -> Result<Option<(String, String)>> {
            self.0.load_credentials(id)
        }
        fn save_credentials(&self, username: &str, password: &str) -> Result<()> {
            self.0.save_credentials(username, password)
        }
        fn load_cookies(&self, id: &str) -> Result<Option<CookieJar>> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.load_cookies(id)
        }
        fn save_cookies(&self, id: &str, jar: &CookieJar) -> Result<()> {
            self.0.save_cookies(id, jar)
        }
        fn delete_cookies(&self, id: &str) -> Result<()> {
            self.0.delete_cookies(id)
        }
        fn get_secret(&self, id: &str) -> Result<Option<String>> {
            self.0.get_secret(id)
        }
        fn save_secret(&self, id: &str, seed: &str) -> Result<()> {
            self.0.save_secret(id, seed)
        }
    }

    #[tokio::test]
    async fn test_store_io_does_not_stall_the_runtime() {
        let harness = Harness::start().await;
        harness
            .mount_cookie_check(json!({"success": "1", "username": "alice"}))
            .await;
        let client = Client::builder(alice())
            .config(test_config(&harness.server.uri()))
            .store(Arc::new(SlowStore(MemoryCredentialStore::new())))
            .sink(harness.sink.clone())
            .build()
            .unwrap();

        // Single-threaded runtime: the timer only fires on time if the
        // store lookup runs off the runtime thread
        let started = Instant::now();
        let (logged_in, ticked) = tokio::join!(client.login(LoginOptions::default()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            started.elapsed()
        });

        assert!(logged_in.unwrap());
        assert!(ticked < Duration::from_millis(250), "timer stalled for {:?}", ticked);
    }
}
