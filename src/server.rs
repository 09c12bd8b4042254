//! ACME 請求分派器與伺服器生命週期。
//!
//! 宿主行程負責 HTTP 監聽與工作執行緒，把每個請求轉成 [`AcmeRequest`] 交給
//! [`AcmeServer::handle`]。每個回應（包含錯誤）都帶有新的 `Replay-Nonce`。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::{debug, error, info, warn};
use reqwest::{
    header::{
        HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LINK, LOCATION,
        RETRY_AFTER,
    },
    Method, StatusCode,
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    account::{Account, AccountError, AccountRegistry},
    ca::{CaBackend, CaClient},
    challenge::{ChallengeStatus, ChallengeType},
    config::{ConfigError, ServerConfig},
    directory::{Directory, Urls},
    ejbca::{EjbcaError, EjbcaSoapBackend},
    error::{AcmeError, Result},
    jws::{Jws, JwsError, KeyRef, ProtectedHeader},
    local_ca::{LocalCa, LocalCaError},
    maintenance::{Maintenance, MaintenanceHandle},
    nonce::{NonceStore, NonceT},
    order::{EngineSettings, OrderEngine, OrderStatus},
    payload::{
        AccountUpdatePayload, AuthorizationUpdatePayload, ChallengeValidationPayload,
        FinalizeOrderPayload, KeyChangePayload, NewAccountPayload, NewOrderPayload, PayloadT,
    },
    rate_limit::RateLimiter,
    storage::{self, StorageError},
    store::Store,
    validator::{ChallengeValidator, ChallengeVerifier},
    views::{AccountView, AuthorizationView, ChallengeView, OrderListView, OrderView},
};

const JOSE_JSON: &str = "application/jose+json";
const PROBLEM_JSON: &str = "application/problem+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
/// processing 中的訂單與挑戰建議用戶端等待的秒數。
const RETRY_AFTER_SECS: &str = "5";
const LOCAL_CA_NAME: &str = "Serles Local CA";
const LOCAL_CA_DAYS: u32 = 90;

fn replay_nonce() -> HeaderName {
    HeaderName::from_static("replay-nonce")
}

/// 建立伺服器時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("EJBCA backend error: {0}")]
    Ejbca(#[from] EjbcaError),
    #[error("Local CA error: {0}")]
    LocalCa(#[from] LocalCaError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Acme(#[from] AcmeError),
}

/// 由宿主行程轉交的請求。`url` 為完整的請求 URL。
#[derive(Debug, Clone)]
pub struct AcmeRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl AcmeRequest {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// 以 `application/jose+json` 送出的 POST。
    pub fn jose(url: &str, body: Vec<u8>) -> Self {
        let mut request = Self::new(Method::POST, url);
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(JOSE_JSON));
        request.body = body;
        request
    }
}

/// 交回宿主行程的回應。
#[derive(Debug, Clone)]
pub struct AcmeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl AcmeResponse {
    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value).map_err(|e| AcmeError::ServerError(e.to_string()))?;
        let mut response = Self::empty(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.body = body;
        Ok(response)
    }

    fn problem(error: &AcmeError) -> Self {
        let mut response = Self::empty(error.status());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        response.body = serde_json::to_vec(&error.problem()).unwrap_or_default();
        response
    }

    fn with_header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| AcmeError::ServerError(format!("invalid header value: {}", e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// 取得第一個同名標頭的字串值。
    pub fn header(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 回應的 `Replay-Nonce`。
    pub fn nonce(&self) -> Option<&str> {
        self.header(replay_nonce())
    }
}

/// 通過驗證的 POST 請求。
struct Verified {
    jws: Jws,
    header: ProtectedHeader,
}

impl Verified {
    fn payload<P: PayloadT>(&self) -> Result<P> {
        P::from_jws_payload(&self.jws.payload()?)
    }

    fn require_post_as_get(&self) -> Result<()> {
        if self.jws.is_post_as_get() {
            Ok(())
        } else {
            Err(AcmeError::BadRequest(
                "this resource only accepts POST-as-GET".to_string(),
            ))
        }
    }
}

/// ACME 伺服器核心。
#[derive(Debug)]
pub struct AcmeServer {
    config: ServerConfig,
    urls: Urls,
    directory: Directory,
    store: Arc<Store>,
    nonces: Arc<NonceStore>,
    accounts: AccountRegistry,
    engine: Arc<OrderEngine>,
    validator: ChallengeValidator,
    limiter: Arc<RateLimiter>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl AcmeServer {
    /// 依設定開啟儲存並組裝各元件，不啟動背景工作。
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn CaBackend>,
    ) -> std::result::Result<Self, ServerError> {
        let storage = storage::open_backend(&config.storage)?;
        Self::with_store(config, Arc::new(Store::new(Arc::from(storage))), backend)
    }

    pub fn with_store(
        config: ServerConfig,
        store: Arc<Store>,
        backend: Arc<dyn CaBackend>,
    ) -> std::result::Result<Self, ServerError> {
        let urls = Urls::new(&config.base_url);
        let directory = Directory::new(&urls, config.terms_of_service.as_deref());
        let ca = CaClient::new(backend, config.retry, config.backend_timeout);
        let engine = Arc::new(OrderEngine::new(
            store.clone(),
            ca,
            EngineSettings::from(&config),
        ));
        let validator = ChallengeValidator::with_defaults(
            engine.clone(),
            config.http01_port,
            &config.doh_url,
            config.validation_timeout,
        )?;
        Ok(Self {
            urls,
            directory,
            nonces: Arc::new(NonceStore::new(store.clone(), config.nonce_ttl)),
            accounts: AccountRegistry::new(store.clone()),
            engine,
            validator,
            limiter: Arc::new(RateLimiter::per_hour(config.orders_per_hour)),
            maintenance: Mutex::new(None),
            store,
            config,
        })
    }

    /// 以自訂驗證器取代預設的 HTTP-01 / DNS-01 驗證。
    pub fn with_verifiers(
        mut self,
        verifiers: HashMap<ChallengeType, Arc<dyn ChallengeVerifier>>,
    ) -> Self {
        self.validator = ChallengeValidator::new(self.engine.clone(), verifiers);
        self
    }

    /// 建立 CA 後端、開啟儲存並啟動背景維護。
    ///
    /// 設定了 EJBCA 時使用 SOAP 後端，否則使用行程內的本機 CA。
    pub fn start(config: ServerConfig) -> std::result::Result<Self, ServerError> {
        info!("Starting ACME server at {}", config.base_url);
        let backend: Arc<dyn CaBackend> = match &config.ejbca {
            Some(settings) => {
                info!("Using EJBCA at {} (CA {})", settings.url, settings.ca_name);
                Arc::new(EjbcaSoapBackend::new(settings.clone(), config.backend_timeout)?)
            }
            None => {
                let ca = LocalCa::generate(LOCAL_CA_NAME, LOCAL_CA_DAYS)?;
                warn!("No EJBCA configured, issuing from in-process CA \"{}\"", ca.name());
                Arc::new(ca)
            }
        };

        let server = Self::new(config, backend)?;
        let counts = storage::summarize(
            server.store.backend(),
            &["accounts/", "orders/", "certificates/"],
        )?;
        info!(
            "Loaded {} accounts, {} orders, {} certificates",
            counts.get("accounts/").copied().unwrap_or(0),
            counts.get("orders/").copied().unwrap_or(0),
            counts.get("certificates/").copied().unwrap_or(0)
        );

        match server.validator.resume_stalled() {
            Ok(0) => {}
            Ok(n) => info!("Resumed {} challenge validations", n),
            Err(e) => warn!("Could not resume challenge validations: {}", e),
        }

        let handle = server.maintenance().spawn(server.config.maintenance_interval)?;
        if let Ok(mut slot) = server.maintenance.lock() {
            *slot = Some(handle);
        }
        info!(
            "ACME server ready on {} ({}, {} workers)",
            server.config.process.bind_address(),
            server.config.process.protocol(),
            server.config.process.workers
        );
        Ok(server)
    }

    fn maintenance(&self) -> Maintenance {
        Maintenance::new(
            self.nonces.clone(),
            self.engine.clone(),
            self.validator.clone(),
            self.limiter.clone(),
        )
    }

    /// 宿主收到重新載入訊號時呼叫：立即執行一次維護。
    pub fn reload(&self) {
        info!("Reloading ACME server");
        let report = self.maintenance().run_once();
        info!(
            "Reload finished: {} nonces purged, {} expired, {} reconciled, {} resumed",
            report.nonces_purged, report.expired, report.reconciled, report.resumed
        );
    }

    /// 停止背景維護。進行中的請求不受影響。
    pub fn shutdown(&self) {
        info!("Shutting down ACME server");
        let handle = self.maintenance.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.stop();
        }
        info!("ACME server stopped");
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn urls(&self) -> &Urls {
        &self.urls
    }

    /// 處理單一請求；錯誤轉為 problem document，回應一律附上新 nonce。
    pub fn handle(&self, request: AcmeRequest) -> AcmeResponse {
        debug!("{} {}", request.method, request.url);
        let mut response = match self.dispatch(&request) {
            Ok(response) => response,
            Err(e) => {
                if e.status().is_server_error() {
                    warn!("{} {} failed: {}", request.method, request.url, e);
                } else {
                    debug!("{} {} rejected: {}", request.method, request.url, e);
                }
                let mut response = AcmeResponse::problem(&e);
                if let AcmeError::KeyInUse(owner) = &e {
                    if let Ok(location) = HeaderValue::from_str(&self.urls.account(owner)) {
                        response.headers.insert(LOCATION, location);
                    }
                }
                response
            }
        };

        match self.nonces.issue() {
            Ok(nonce) => match HeaderValue::from_str(&nonce) {
                Ok(value) => {
                    response.headers.insert(replay_nonce(), value);
                }
                Err(e) => error!("Generated an invalid nonce header: {}", e),
            },
            Err(e) => error!("Failed to issue nonce: {}", e),
        }
        if let Ok(link) = HeaderValue::from_str(&format!(
            "<{}>;rel=\"index\"",
            self.urls.directory()
        )) {
            response.headers.append(LINK, link);
        }
        response
            .headers
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }

    fn dispatch(&self, request: &AcmeRequest) -> Result<AcmeResponse> {
        let path = request
            .url
            .strip_prefix(self.urls.base())
            .ok_or_else(|| AcmeError::NotFound(request.url.clone()))?;
        let path = path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let method = &request.method;
        match segments.as_slice() {
            ["directory"] if *method == Method::GET => {
                AcmeResponse::json(StatusCode::OK, &self.directory)
            }
            ["new-nonce"] if *method == Method::HEAD => Ok(AcmeResponse::empty(StatusCode::OK)),
            ["new-nonce"] if *method == Method::GET => {
                Ok(AcmeResponse::empty(StatusCode::NO_CONTENT))
            }
            segments if *method == Method::POST && !matches!(segments, ["directory"] | ["new-nonce"]) => {
                self.dispatch_post(request, segments)
            }
            _ => Err(AcmeError::MethodNotAllowed(format!(
                "{} is not allowed on {}",
                method, path
            ))),
        }
    }

    fn dispatch_post(&self, request: &AcmeRequest, segments: &[&str]) -> Result<AcmeResponse> {
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type.split(';').next().map(str::trim) != Some(JOSE_JSON) {
            return Err(AcmeError::UnsupportedMediaType(format!(
                "expected {}, got \"{}\"",
                JOSE_JSON, content_type
            )));
        }

        let jws = Jws::from_json(&request.body)?;
        let header = jws.header()?;
        let nonce = header
            .nonce
            .as_deref()
            .ok_or_else(|| AcmeError::BadNonce("missing nonce".to_string()))?;
        self.nonces.consume(nonce)?;
        if header.url != request.url {
            return Err(AcmeError::Unauthorized(format!(
                "url header {} does not match {}",
                header.url, request.url
            )));
        }
        let req = Verified { jws, header };

        if let ["new-account"] = segments {
            return self.new_account(&req);
        }
        let account = self.authenticate(&req)?;
        match segments {
            ["key-change"] => self.key_change(&req, &account),
            ["account", id] => self.account(&req, &account, id),
            ["account", id, "orders"] => self.account_orders(&req, &account, id),
            ["new-order"] => self.new_order(&req, &account),
            ["order", id] => self.order(&req, &account, id),
            ["order", id, "finalize"] => self.finalize(&req, &account, id),
            ["authz", id] => self.authorization(&req, &account, id),
            ["chall", id] => self.challenge(&req, &account, id),
            ["cert", id] => self.certificate(&req, &account, id),
            _ => Err(AcmeError::NotFound(request.url.clone())),
        }
    }

    /// 以 `kid` 找出帳戶並以其金鑰驗證簽章。
    fn authenticate(&self, req: &Verified) -> Result<Account> {
        let kid = match req.header.key_ref()? {
            KeyRef::Kid(kid) => kid,
            KeyRef::Jwk(_) => {
                return Err(AcmeError::BadRequest(
                    "requests must be signed with the account key id".to_string(),
                ))
            }
        };
        let id = self
            .urls
            .account_id(kid)
            .ok_or(AcmeError::AccountDoesNotExist)?;
        let account = self.accounts.get(id)?;
        let key = account.jwk.to_public_key().map_err(JwsError::from)?;
        req.jws.verify(&req.header.alg, &key)?;
        AccountRegistry::ensure_active(&account)?;
        Ok(account)
    }

    fn account_response(&self, status: StatusCode, account: &Account) -> Result<AcmeResponse> {
        AcmeResponse::json(status, &AccountView::new(account, &self.urls))?
            .with_header(LOCATION, &self.urls.account(&account.id))
    }

    fn new_account(&self, req: &Verified) -> Result<AcmeResponse> {
        let jwk = req.jws.verify_embedded(&req.header)?;
        let payload: NewAccountPayload = req.payload()?;
        let thumbprint = jwk.thumbprint().map_err(AccountError::from)?;

        match self.accounts.lookup(&thumbprint) {
            Ok(existing) => {
                AccountRegistry::ensure_active(&existing)?;
                return self.account_response(StatusCode::OK, &existing);
            }
            Err(AccountError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if payload.only_return_existing {
            return Err(AcmeError::AccountDoesNotExist);
        }
        if self.config.terms_of_service.is_some() && !payload.terms_of_service_agreed {
            return Err(AcmeError::BadRequest(
                "termsOfServiceAgreed must be true".to_string(),
            ));
        }

        match self.accounts.register(
            jwk,
            &payload.contact,
            payload.terms_of_service_agreed,
        ) {
            Ok(account) => self.account_response(StatusCode::CREATED, &account),
            // 與另一個註冊請求競爭時，回傳勝出者建立的帳戶
            Err(AccountError::AlreadyRegistered(id)) => {
                self.account_response(StatusCode::OK, &self.accounts.get(&id)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn owned_account_id(account: &Account, id: &str) -> Result<()> {
        if account.id != id {
            return Err(AcmeError::Unauthorized(
                "account URL does not match the signing key".to_string(),
            ));
        }
        Ok(())
    }

    fn account(&self, req: &Verified, account: &Account, id: &str) -> Result<AcmeResponse> {
        Self::owned_account_id(account, id)?;
        if req.jws.is_post_as_get() {
            return self.account_response(StatusCode::OK, account);
        }
        let payload: AccountUpdatePayload = req.payload()?;
        let updated = if payload.status.is_some() {
            self.accounts.deactivate(id)?
        } else if let Some(contact) = &payload.contact {
            self.accounts.update(id, contact)?
        } else {
            account.clone()
        };
        self.account_response(StatusCode::OK, &updated)
    }

    fn account_orders(&self, req: &Verified, account: &Account, id: &str) -> Result<AcmeResponse> {
        Self::owned_account_id(account, id)?;
        req.require_post_as_get()?;
        let orders = self.engine.list_orders(account)?;
        AcmeResponse::json(StatusCode::OK, &OrderListView::new(&orders, &self.urls))
    }

    /// 金鑰輪替：外層以舊金鑰（kid）簽署，內層 JWS 以新金鑰（jwk）簽署。
    fn key_change(&self, req: &Verified, account: &Account) -> Result<AcmeResponse> {
        let inner = Jws::from_json(&req.jws.payload()?)?;
        let inner_header = inner.header()?;
        let new_jwk = inner.verify_embedded(&inner_header)?;
        if inner_header.url != req.header.url {
            return Err(AcmeError::BadRequest(
                "inner url must match the outer url".to_string(),
            ));
        }
        let payload = KeyChangePayload::from_jws_payload(&inner.payload()?)?;
        if payload.account != self.urls.account(&account.id) {
            return Err(AcmeError::Unauthorized(
                "inner account does not match the signer".to_string(),
            ));
        }
        if payload.old_key.thumbprint().map_err(AccountError::from)? != account.thumbprint {
            return Err(AcmeError::Unauthorized(
                "oldKey is not the current account key".to_string(),
            ));
        }
        let updated = self.accounts.change_key(&account.id, new_jwk)?;
        self.account_response(StatusCode::OK, &updated)
    }

    fn order_response(&self, status: StatusCode, order: &crate::order::Order) -> Result<AcmeResponse> {
        let mut response = AcmeResponse::json(status, &OrderView::new(order, &self.urls))?
            .with_header(LOCATION, &self.urls.order(&order.id))?;
        if order.status == OrderStatus::Processing {
            response = response.with_header(RETRY_AFTER, RETRY_AFTER_SECS)?;
        }
        Ok(response)
    }

    fn new_order(&self, req: &Verified, account: &Account) -> Result<AcmeResponse> {
        let payload: NewOrderPayload = req.payload()?;
        // 被拒絕的識別碼不計入配額
        let identifiers = self.engine.check_identifiers(&payload.identifiers)?;
        self.limiter.check(&account.id)?;
        let order = self.engine.create_order(account, &identifiers)?;
        self.order_response(StatusCode::CREATED, &order)
    }

    fn order(&self, req: &Verified, account: &Account, id: &str) -> Result<AcmeResponse> {
        req.require_post_as_get()?;
        let order = self.engine.get_order(id, account)?;
        self.order_response(StatusCode::OK, &order)
    }

    fn finalize(&self, req: &Verified, account: &Account, id: &str) -> Result<AcmeResponse> {
        let payload: FinalizeOrderPayload = req.payload()?;
        let order = self.engine.finalize(id, account, &payload.csr_der()?)?;
        self.order_response(StatusCode::OK, &order)
    }

    fn authorization(&self, req: &Verified, account: &Account, id: &str) -> Result<AcmeResponse> {
        let authz = if req.jws.is_post_as_get() {
            self.engine.get_authorization(id, account)?
        } else {
            let _: AuthorizationUpdatePayload = req.payload()?;
            self.engine.deactivate_authorization(id, account)?
        };
        let challenges = self.engine.challenges_for(&authz)?;
        AcmeResponse::json(
            StatusCode::OK,
            &AuthorizationView::new(&authz, &challenges, &self.urls),
        )
    }

    fn challenge(&self, req: &Verified, account: &Account, id: &str) -> Result<AcmeResponse> {
        let challenge = if req.jws.is_post_as_get() {
            self.engine.get_challenge(id, account)?.0
        } else {
            let _: ChallengeValidationPayload = req.payload()?;
            self.validator.initiate(id, account)?
        };
        let up = format!(
            "<{}>;rel=\"up\"",
            self.urls.authorization(&challenge.authorization_id)
        );
        let mut response =
            AcmeResponse::json(StatusCode::OK, &ChallengeView::new(&challenge, &self.urls))?
                .with_header(LINK, &up)?;
        if challenge.status == ChallengeStatus::Processing {
            response = response.with_header(RETRY_AFTER, RETRY_AFTER_SECS)?;
        }
        Ok(response)
    }

    fn certificate(&self, req: &Verified, account: &Account, id: &str) -> Result<AcmeResponse> {
        req.require_post_as_get()?;
        let cert = self.engine.certificate(id, account)?;
        let mut response = AcmeResponse::empty(StatusCode::OK);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(PEM_CHAIN));
        response.body = cert.pem.into_bytes();
        Ok(response)
    }
}

impl Drop for AcmeServer {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.maintenance.lock() {
            // MaintenanceHandle 的 Drop 會等待執行緒結束
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ca::tests::{issued, ScriptedBackend},
        challenge::Challenge,
        csr::CSR,
        error::Problem,
        key_pair::{KeyAlgorithm, KeyPair},
        testing::TestClient,
    };
    use serde_json::{json, Value};
    use std::{thread, time::Duration, time::Instant};

    const BASE: &str = "https://acme.test";

    #[derive(Debug)]
    struct AcceptAll;

    impl ChallengeVerifier for AcceptAll {
        fn verify(
            &self,
            _identifier: &str,
            _challenge: &Challenge,
            _key_authorization: &str,
        ) -> std::result::Result<(), Problem> {
            Ok(())
        }
    }

    fn server_with(backend: Arc<dyn CaBackend>, orders_per_hour: u32) -> AcmeServer {
        let config = ServerConfig::builder(BASE)
            .orders_per_hour(orders_per_hour)
            .terms_of_service("https://acme.test/tos")
            .build()
            .unwrap();
        let accept: Arc<dyn ChallengeVerifier> = Arc::new(AcceptAll);
        AcmeServer::with_store(config, Arc::new(Store::memory()), backend)
            .unwrap()
            .with_verifiers(HashMap::from([
                (ChallengeType::Http01, accept.clone()),
                (ChallengeType::Dns01, accept),
            ]))
    }

    fn server() -> AcmeServer {
        server_with(Arc::new(LocalCa::generate("Test CA", 30).unwrap()), 300)
    }

    fn body(response: &AcmeResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    fn problem_type(response: &AcmeResponse) -> String {
        body(response)["type"].as_str().unwrap_or_default().to_string()
    }

    fn wait_for_status(server: &AcmeServer, client: &TestClient, url: &str, wanted: &str) -> Value {
        let started = Instant::now();
        loop {
            let response = client.post_as_get(server, url);
            let json = body(&response);
            if json["status"] == wanted || started.elapsed() > Duration::from_secs(5) {
                return json;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_directory_and_nonce() {
        let server = server();
        let response = server.handle(AcmeRequest::new(Method::GET, "https://acme.test/directory"));
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body(&response)["newOrder"], "https://acme.test/new-order");
        assert!(response.nonce().is_some());

        let head = server.handle(AcmeRequest::new(Method::HEAD, "https://acme.test/new-nonce"));
        assert_eq!(head.status, StatusCode::OK);
        assert!(head.nonce().is_some());
        assert_eq!(head.header(CACHE_CONTROL), Some("no-store"));
        assert_eq!(
            head.header(LINK),
            Some("<https://acme.test/directory>;rel=\"index\"")
        );

        let get = server.handle(AcmeRequest::new(Method::GET, "https://acme.test/new-nonce"));
        assert_eq!(get.status, StatusCode::NO_CONTENT);

        let put = server.handle(AcmeRequest::new(Method::PUT, "https://acme.test/new-order"));
        assert_eq!(put.status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(put.nonce().is_some());
    }

    #[test]
    fn test_full_issuance_flow() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);

        let created = client.register(&server, json!({
            "contact": ["mailto:admin@example.com"],
            "termsOfServiceAgreed": true
        }));
        assert_eq!(created.status, StatusCode::CREATED);
        assert!(created.header(LOCATION).unwrap().starts_with("https://acme.test/account/"));

        let order = client.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] }),
        );
        assert_eq!(order.status, StatusCode::CREATED);
        let order_url = order.header(LOCATION).unwrap().to_string();
        let order_json = body(&order);
        assert_eq!(order_json["status"], "pending");

        let authz_url = order_json["authorizations"][0].as_str().unwrap().to_string();
        let authz = body(&client.post_as_get(&server, &authz_url));
        let challenge_url = authz["challenges"][0]["url"].as_str().unwrap().to_string();

        let started = client.post(&server, &challenge_url, &json!({}));
        assert_eq!(started.status, StatusCode::OK);
        assert!(started
            .headers
            .get_all(LINK)
            .iter()
            .any(|v| v.to_str().unwrap().contains("rel=\"up\"")));

        wait_for_status(&server, &client, &challenge_url, "valid");
        assert_eq!(body(&client.post_as_get(&server, &authz_url))["status"], "valid");
        assert_eq!(body(&client.post_as_get(&server, &order_url))["status"], "ready");

        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let csr = CSR::new().set_san("example.com").build(&key).unwrap();
        let finalized = client.post(
            &server,
            order_json["finalize"].as_str().unwrap(),
            &serde_json::to_value(FinalizeOrderPayload::new(&csr)).unwrap(),
        );
        assert_eq!(finalized.status, StatusCode::OK);
        let finalized = body(&finalized);
        assert_eq!(finalized["status"], "valid");

        let cert = client.post_as_get(&server, finalized["certificate"].as_str().unwrap());
        assert_eq!(cert.status, StatusCode::OK);
        assert_eq!(cert.header(CONTENT_TYPE), Some(PEM_CHAIN));
        assert!(String::from_utf8(cert.body).unwrap().contains("BEGIN CERTIFICATE"));

        let list = client.post_as_get(&server, &format!("{}/orders", client.kid().unwrap()));
        assert_eq!(body(&list)["orders"][0], order_url);
    }

    #[test]
    fn test_nonce_replay_is_rejected() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));

        let nonce = client.fresh_nonce(&server);
        let url = "https://acme.test/new-order";
        let payload = json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] });
        let first = server.handle(client.request_with_nonce(url, Some(&payload), &nonce));
        assert_eq!(first.status, StatusCode::CREATED);

        let replay = server.handle(client.request_with_nonce(url, Some(&payload), &nonce));
        assert_eq!(replay.status, StatusCode::BAD_REQUEST);
        assert_eq!(problem_type(&replay), "urn:ietf:params:acme:error:badNonce");
        assert!(replay.nonce().is_some());
    }

    #[test]
    fn test_request_validation() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));
        let payload = json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] });

        let mut wrong_type = client.request(&server, "https://acme.test/new-order", Some(&payload));
        wrong_type
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(
            server.handle(wrong_type).status,
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );

        let mut wrong_url = client.request(&server, "https://acme.test/new-order", Some(&payload));
        wrong_url.url = "https://acme.test/new-account".to_string();
        let response = server.handle(wrong_url);
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(problem_type(&response), "urn:ietf:params:acme:error:unauthorized");

        // 其他金鑰冒用同一個 kid
        let mut impostor = TestClient::new(KeyAlgorithm::EcP256);
        impostor.set_kid(client.kid().unwrap());
        let response = impostor.post(&server, "https://acme.test/new-order", &payload);
        assert_eq!(response.status, StatusCode::FORBIDDEN);

        let response = client.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [] }),
        );
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(problem_type(&response), "urn:ietf:params:acme:error:malformed");
    }

    #[test]
    fn test_new_account_variants() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::Rsa);

        let missing = client.register(&server, json!({ "onlyReturnExisting": true }));
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            problem_type(&missing),
            "urn:ietf:params:acme:error:accountDoesNotExist"
        );

        let no_tos = client.register(&server, json!({ "termsOfServiceAgreed": false }));
        assert_eq!(no_tos.status, StatusCode::BAD_REQUEST);

        let created = client.register(&server, json!({ "termsOfServiceAgreed": true }));
        assert_eq!(created.status, StatusCode::CREATED);
        let again = client.register(&server, json!({ "termsOfServiceAgreed": true }));
        assert_eq!(again.status, StatusCode::OK);
        assert_eq!(again.header(LOCATION), created.header(LOCATION));
        let existing = client.register(&server, json!({ "onlyReturnExisting": true }));
        assert_eq!(existing.status, StatusCode::OK);
    }

    #[test]
    fn test_account_update_and_deactivation() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));
        let kid = client.kid().unwrap().to_string();

        let updated = client.post(&server, &kid, &json!({ "contact": ["ops@example.com"] }));
        assert_eq!(updated.status, StatusCode::OK);
        assert_eq!(body(&updated)["contact"][0], "mailto:ops@example.com");

        let deactivated = client.post(&server, &kid, &json!({ "status": "deactivated" }));
        assert_eq!(body(&deactivated)["status"], "deactivated");

        let response = client.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] }),
        );
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(problem_type(&response), "urn:ietf:params:acme:error:unauthorized");
    }

    #[test]
    fn test_key_change() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));
        let kid = client.kid().unwrap().to_string();

        let new_key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let response = client.key_change(&server, &new_key);
        assert_eq!(response.status, StatusCode::OK);

        // 舊金鑰失效，新金鑰可用
        let old = client.post_as_get(&server, &kid);
        assert_eq!(old.status, StatusCode::FORBIDDEN);
        let mut rolled = TestClient::from_key(new_key);
        rolled.set_kid(&kid);
        assert_eq!(rolled.post_as_get(&server, &kid).status, StatusCode::OK);
    }

    #[test]
    fn test_identifier_problem_types() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));

        let invalid = client.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [{ "type": "dns", "value": "exa_mple.com" }] }),
        );
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            problem_type(&invalid),
            "urn:ietf:params:acme:error:rejectedIdentifier"
        );

        let ip = client.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [{ "type": "ip", "value": "10.0.0.1" }] }),
        );
        assert_eq!(ip.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            problem_type(&ip),
            "urn:ietf:params:acme:error:unsupportedIdentifier"
        );

        let contact = client.post(
            &server,
            client.kid().unwrap(),
            &json!({ "contact": ["mailto:not-an-address"] }),
        );
        assert_eq!(problem_type(&contact), "urn:ietf:params:acme:error:invalidContact");
    }

    #[test]
    fn test_finalize_problem_types() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));

        let created = client.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] }),
        );
        let finalize_url = body(&created)["finalize"].as_str().unwrap().to_string();
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let csr_for = |name: &str| {
            let csr = CSR::new().set_san(name).build(&key).unwrap();
            serde_json::to_value(FinalizeOrderPayload::new(&csr)).unwrap()
        };

        let not_ready = client.post(&server, &finalize_url, &csr_for("example.com"));
        assert_eq!(not_ready.status, StatusCode::FORBIDDEN);
        assert_eq!(problem_type(&not_ready), "urn:ietf:params:acme:error:orderNotReady");

        let order_id = created.header(LOCATION).unwrap().rsplit('/').next().unwrap().to_string();
        let order = server.engine.store().get::<crate::order::Order>(&order_id).unwrap();
        crate::order::tests::authorize_all(&server.engine, &order);

        let mismatched = client.post(&server, &finalize_url, &csr_for("other.com"));
        assert_eq!(mismatched.status, StatusCode::BAD_REQUEST);
        assert_eq!(problem_type(&mismatched), "urn:ietf:params:acme:error:badCSR");

        let garbage = client.post(&server, &finalize_url, &json!({ "csr": "bm90LWEtY3Ny" }));
        assert_eq!(problem_type(&garbage), "urn:ietf:params:acme:error:badCSR");

        let finalized = client.post(&server, &finalize_url, &csr_for("example.com"));
        assert_eq!(body(&finalized)["status"], "valid");
    }

    #[test]
    fn test_key_change_to_foreign_key() {
        let server = server();
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));
        let other_key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let mut other = TestClient::from_key(other_key.clone());
        other.register(&server, json!({ "termsOfServiceAgreed": true }));

        let response = client.key_change(&server, &other_key);
        assert_eq!(response.status, StatusCode::CONFLICT);
        assert_eq!(response.header(LOCATION), other.kid());
        assert_eq!(problem_type(&response), "urn:ietf:params:acme:error:malformed");
    }

    #[test]
    fn test_rate_limit() {
        let server = server_with(Arc::new(ScriptedBackend::new(Ok(issued()))), 1);
        let mut client = TestClient::new(KeyAlgorithm::EcP256);
        client.register(&server, json!({ "termsOfServiceAgreed": true }));
        let payload = json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] });

        // 被拒絕的訂單不消耗配額
        let rejected = client.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [{ "type": "dns", "value": "exa_mple.com" }] }),
        );
        assert_eq!(rejected.status, StatusCode::BAD_REQUEST);

        assert_eq!(
            client.post(&server, "https://acme.test/new-order", &payload).status,
            StatusCode::CREATED
        );
        let limited = client.post(&server, "https://acme.test/new-order", &payload);
        assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(problem_type(&limited), "urn:ietf:params:acme:error:rateLimited");
    }

    #[test]
    fn test_foreign_order_is_unauthorized() {
        let server = server();
        let mut owner = TestClient::new(KeyAlgorithm::EcP256);
        owner.register(&server, json!({ "termsOfServiceAgreed": true }));
        let mut other = TestClient::new(KeyAlgorithm::EcP256);
        other.register(&server, json!({ "termsOfServiceAgreed": true }));

        let order = owner.post(
            &server,
            "https://acme.test/new-order",
            &json!({ "identifiers": [{ "type": "dns", "value": "example.com" }] }),
        );
        let url = order.header(LOCATION).unwrap().to_string();
        assert_eq!(other.post_as_get(&server, &url).status, StatusCode::FORBIDDEN);
        assert_eq!(
            owner.post_as_get(&server, "https://acme.test/order/missing").status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_start_and_shutdown() {
        let config = ServerConfig::builder(BASE)
            .maintenance_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let server = AcmeServer::start(config).unwrap();
        server.reload();
        server.shutdown();
        let response = server.handle(AcmeRequest::new(Method::GET, "https://acme.test/directory"));
        assert_eq!(response.status, StatusCode::OK);
    }
}
