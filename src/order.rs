//! 訂單與授權的狀態機。
//!
//! 訂單：`pending → ready → processing → valid`，任何失敗或過期皆轉為 `invalid`。
//! 所有狀態轉換都在該實體的鎖內完成；CA 呼叫在鎖外進行，並以進行中集合保證
//! 同一張訂單最多只有一個 CA 呼叫。

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    account::{Account, AccountRegistry},
    authorization::{Authorization, AuthorizationStatus},
    base64::Base64,
    ca::{BackendError, CaClient, IssuanceRequest, IssuedCertificate, PollOutcome},
    certificate::Certificate,
    challenge::{Challenge, ChallengeType},
    config::ServerConfig,
    csr::ParsedCsr,
    error::{AcmeError, Problem, Result},
    payload::{Identifier, MAX_IDENTIFIERS},
    store::{Entity, Store},
};

/// 訂單狀態，目前支援的狀態有 pending、ready、processing、valid 與 invalid。
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

/// 一張證書訂單。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub identifiers: Vec<Identifier>,
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    pub authorizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
    /// finalize 時提交的 CSR（URL 安全 Base64 DER），對帳重送時使用。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_started_at: Option<DateTime<Utc>>,
    /// 對帳時是否已因 CA 查無紀錄而重送過一次。
    #[serde(default)]
    pub resubmitted: bool,
    pub created_at: DateTime<Utc>,
}

impl Entity for Order {
    const KIND: &'static str = "orders";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Order {
    fn fail(&mut self, problem: Problem) {
        self.status = OrderStatus::Invalid;
        self.error = Some(problem);
    }
}

/// 訂單引擎使用的參數。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub challenge_types: Vec<ChallengeType>,
    pub order_lifetime: Duration,
    pub authorization_lifetime: Duration,
    /// 與 CA 用戶端的硬性逾時相同；對帳會等到此時間加上 `reconcile_grace` 之後。
    pub backend_timeout: Duration,
    pub reconcile_grace: Duration,
}

impl From<&ServerConfig> for EngineSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            challenge_types: config.challenge_types.clone(),
            order_lifetime: config.order_lifetime,
            authorization_lifetime: config.authorization_lifetime,
            backend_timeout: config.backend_timeout,
            reconcile_grace: config.reconcile_grace,
        }
    }
}

fn lifetime(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36500))
}

/// 將識別碼正規化為小寫並檢查主機名稱語法；萬用字元只允許出現在最左側。
pub fn normalize_identifier(identifier: &Identifier) -> Result<Identifier> {
    if identifier.type_ != "dns" {
        return Err(AcmeError::UnsupportedIdentifier(format!(
            "type \"{}\"",
            identifier.type_
        )));
    }
    let value = identifier.value.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = value.strip_prefix("*.").unwrap_or(&value);
    let rejected = || {
        AcmeError::RejectedIdentifier(format!(
            "\"{}\" is not a valid hostname",
            identifier.value
        ))
    };

    if host.is_empty() || host.len() > 253 {
        return Err(rejected());
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return Err(rejected());
    }
    for label in &labels {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !valid {
            return Err(rejected());
        }
    }
    // 最後一段全為數字表示 IP 位址
    if labels
        .last()
        .is_some_and(|tld| tld.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(rejected());
    }
    Ok(Identifier::dns(&value))
}

/// 從進行中集合移除訂單的守衛。
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

enum FinalizeStart<'a> {
    /// 已在處理中，直接回傳目前狀態。
    Current(Order),
    Claimed(Order, InFlight<'a>),
}

/// 訂單與授權引擎。
#[derive(Debug)]
pub struct OrderEngine {
    store: Arc<Store>,
    ca: CaClient,
    settings: EngineSettings,
    in_flight: Mutex<HashSet<String>>,
}

impl OrderEngine {
    pub fn new(store: Arc<Store>, ca: CaClient, settings: EngineSettings) -> Self {
        Self {
            store,
            ca,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// 為帳戶建立訂單，每個識別碼產生一個授權與其挑戰組。
    pub fn create_order(&self, account: &Account, identifiers: &[Identifier]) -> Result<Order> {
        AccountRegistry::ensure_active(account)?;
        let normalized = self.check_identifiers(identifiers)?;

        let now = Utc::now();
        let mut order = Order {
            id: Uuid::new_v4().simple().to_string(),
            account_id: account.id.clone(),
            identifiers: normalized,
            status: OrderStatus::Pending,
            expires: now + lifetime(self.settings.order_lifetime),
            authorizations: Vec::new(),
            certificate_id: None,
            error: None,
            csr: None,
            finalize_started_at: None,
            resubmitted: false,
            created_at: now,
        };

        let authz_expires = now + lifetime(self.settings.authorization_lifetime);
        for identifier in &order.identifiers {
            let mut authz = Authorization::new(&order.id, identifier, authz_expires);
            let types: Vec<ChallengeType> = if authz.wildcard {
                vec![ChallengeType::Dns01]
            } else {
                self.settings.challenge_types.clone()
            };
            for challenge_type in types {
                let challenge = Challenge::new(&authz.id, challenge_type)
                    .map_err(|e| AcmeError::ServerError(e.to_string()))?;
                self.store.put(&challenge)?;
                authz.challenges.push(challenge.id);
            }
            self.store.put(&authz)?;
            order.authorizations.push(authz.id);
        }
        self.store.put(&order)?;

        info!(
            "Created order {} for account {} ({} identifiers)",
            order.id,
            account.id,
            order.identifiers.len()
        );
        Ok(order)
    }

    /// 正規化並檢查新訂單的識別碼：非空、語法正確、去除重複且不超過上限。
    pub fn check_identifiers(&self, identifiers: &[Identifier]) -> Result<Vec<Identifier>> {
        if identifiers.is_empty() {
            return Err(AcmeError::BadRequest(
                "At least one identifier is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::new();
        for identifier in identifiers {
            let identifier = normalize_identifier(identifier)?;
            if identifier.value.starts_with("*.")
                && !self.settings.challenge_types.contains(&ChallengeType::Dns01)
            {
                return Err(AcmeError::RejectedIdentifier(format!(
                    "wildcard {} requires dns-01",
                    identifier.value
                )));
            }
            if seen.insert(identifier.value.clone()) {
                normalized.push(identifier);
            }
        }
        if normalized.len() > MAX_IDENTIFIERS {
            return Err(AcmeError::RejectedIdentifier(format!(
                "at most {} identifiers per order",
                MAX_IDENTIFIERS
            )));
        }
        Ok(normalized)
    }

    fn owned_order(&self, id: &str, account: &Account) -> Result<Order> {
        let order = self
            .store
            .find::<Order>(id)?
            .ok_or_else(|| AcmeError::NotFound(format!("order {}", id)))?;
        if order.account_id != account.id {
            return Err(AcmeError::Unauthorized(
                "order belongs to another account".to_string(),
            ));
        }
        Ok(order)
    }

    /// 讀取訂單，順便套用過期與授權結果。
    pub fn get_order(&self, id: &str, account: &Account) -> Result<Order> {
        self.owned_order(id, account)?;
        self.refresh_order_status(id)
    }

    /// 帳戶的所有訂單，依建立時間排序。
    pub fn list_orders(&self, account: &Account) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .store
            .list::<Order>()?
            .into_iter()
            .filter(|order| order.account_id == account.id)
            .collect();
        orders.sort_by_key(|order| order.created_at);
        Ok(orders)
    }

    pub fn get_authorization(&self, id: &str, account: &Account) -> Result<Authorization> {
        let authz = self
            .store
            .find::<Authorization>(id)?
            .ok_or_else(|| AcmeError::NotFound(format!("authorization {}", id)))?;
        self.owned_order(&authz.order_id, account)?;

        let (authz, expired) = self.store.with_lock(Authorization::KIND, id, || -> Result<_> {
            let mut authz = self.store.get::<Authorization>(id)?;
            let expired = authz.expire_if_due(Utc::now());
            if expired {
                self.store.put(&authz)?;
            }
            Ok((authz, expired))
        })??;
        if expired {
            self.refresh_order_status(&authz.order_id)?;
        }
        Ok(authz)
    }

    /// 讀取挑戰，回傳挑戰、所屬授權與訂單。
    pub fn get_challenge(
        &self,
        id: &str,
        account: &Account,
    ) -> Result<(Challenge, Authorization, Order)> {
        let challenge = self
            .store
            .find::<Challenge>(id)?
            .ok_or_else(|| AcmeError::NotFound(format!("challenge {}", id)))?;
        let authz = self.store.get::<Authorization>(&challenge.authorization_id)?;
        let order = self.owned_order(&authz.order_id, account)?;
        Ok((challenge, authz, order))
    }

    pub fn challenges_for(&self, authz: &Authorization) -> Result<Vec<Challenge>> {
        authz
            .challenges
            .iter()
            .map(|id| self.store.get::<Challenge>(id).map_err(AcmeError::from))
            .collect()
    }

    /// 用戶端停用授權；pending 或 ready 的訂單隨之失效。
    pub fn deactivate_authorization(&self, id: &str, account: &Account) -> Result<Authorization> {
        AccountRegistry::ensure_active(account)?;
        let authz = self
            .store
            .find::<Authorization>(id)?
            .ok_or_else(|| AcmeError::NotFound(format!("authorization {}", id)))?;
        self.owned_order(&authz.order_id, account)?;

        let authz = self.store.with_lock(Authorization::KIND, id, || -> Result<_> {
            let mut authz = self.store.get::<Authorization>(id)?;
            match authz.status {
                AuthorizationStatus::Pending | AuthorizationStatus::Valid => {
                    authz.status = AuthorizationStatus::Deactivated;
                    self.store.put(&authz)?;
                    Ok(authz)
                }
                other => Err(AcmeError::Conflict(format!(
                    "authorization is {}",
                    other.as_str()
                ))),
            }
        })??;
        info!("Deactivated authorization {}", id);
        self.refresh_order_status(&authz.order_id)?;
        Ok(authz)
    }

    /// 依授權結果與期限重新推導 pending/ready 訂單的狀態。
    pub fn refresh_order_status(&self, order_id: &str) -> Result<Order> {
        self.store.with_lock(Order::KIND, order_id, || -> Result<Order> {
            let mut order = self.store.get::<Order>(order_id)?;
            if self.derive_status(&mut order)? {
                debug!("Order {} is now {}", order.id, order.status.as_str());
                self.store.put(&order)?;
            }
            Ok(order)
        })?
    }

    /// 呼叫端必須持有訂單鎖。回傳狀態是否改變。
    fn derive_status(&self, order: &mut Order) -> Result<bool> {
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
            return Ok(false);
        }
        let now = Utc::now();
        if now > order.expires {
            order.fail(Problem::acme("unauthorized", "order expired"));
            return Ok(true);
        }

        let mut all_valid = true;
        for authz_id in &order.authorizations {
            let authz = self.store.get::<Authorization>(authz_id)?;
            let status = if authz.status == AuthorizationStatus::Pending && now > authz.expires {
                AuthorizationStatus::Expired
            } else {
                authz.status
            };
            if status.is_failed() {
                order.fail(Problem::acme(
                    "unauthorized",
                    format!(
                        "authorization for {} is {}",
                        authz.identifier.value,
                        status.as_str()
                    ),
                ));
                return Ok(true);
            }
            all_valid &= status == AuthorizationStatus::Valid;
        }

        let next = if all_valid {
            OrderStatus::Ready
        } else {
            OrderStatus::Pending
        };
        if next != order.status {
            order.status = next;
            return Ok(true);
        }
        Ok(false)
    }

    fn all_authorizations_valid(&self, order: &Order) -> Result<bool> {
        for authz_id in &order.authorizations {
            if self.store.get::<Authorization>(authz_id)?.status != AuthorizationStatus::Valid {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 嘗試把訂單放入進行中集合；已在其中則回傳 `None`。
    fn claim(&self, order_id: &str) -> Result<Option<InFlight<'_>>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| AcmeError::ServerError("in-flight set poisoned".to_string()))?;
        if !set.insert(order_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(InFlight {
            set: &self.in_flight,
            id: order_id.to_string(),
        }))
    }

    /// 以 CSR 完成訂單。
    ///
    /// 只有 ready 的訂單可以 finalize；processing 中重複呼叫直接回傳目前狀態，
    /// 不會再次呼叫 CA。CA 逾時時訂單維持 processing，由 [`OrderEngine::reconcile`] 收尾。
    pub fn finalize(&self, order_id: &str, account: &Account, csr_der: &[u8]) -> Result<Order> {
        AccountRegistry::ensure_active(account)?;
        self.owned_order(order_id, account)?;

        let (order, _in_flight) = match self.begin_finalize(order_id, csr_der)? {
            FinalizeStart::Current(order) => return Ok(order),
            FinalizeStart::Claimed(order, guard) => (order, guard),
        };

        let request = IssuanceRequest {
            request_id: order.id.clone(),
            csr_der: csr_der.to_vec(),
            identifiers: order.identifiers.iter().map(|i| i.value.clone()).collect(),
        };
        info!("Submitting order {} to the CA", order.id);
        let result = self.ca.issue(&request);
        self.complete_issuance(&order.id, result)
    }

    fn begin_finalize(&self, order_id: &str, csr_der: &[u8]) -> Result<FinalizeStart<'_>> {
        self.store.with_lock(Order::KIND, order_id, || -> Result<_> {
            let mut order = self.store.get::<Order>(order_id)?;
            if self.derive_status(&mut order)? {
                self.store.put(&order)?;
            }
            match order.status {
                OrderStatus::Processing => return Ok(FinalizeStart::Current(order)),
                OrderStatus::Ready => {}
                other => {
                    return Err(AcmeError::OrderNotReady(format!(
                        "order is {}, not ready",
                        other.as_str()
                    )))
                }
            }

            let csr = ParsedCsr::parse(csr_der)?;
            if !csr.matches(order.identifiers.iter().map(|i| i.value.as_str())) {
                return Err(AcmeError::BadCsr(
                    "CSR identifiers do not match the order".to_string(),
                ));
            }

            let Some(guard) = self.claim(order_id)? else {
                return Ok(FinalizeStart::Current(order));
            };
            order.status = OrderStatus::Processing;
            order.csr = Some(Base64::new(csr_der).base64_url());
            order.finalize_started_at = Some(Utc::now());
            self.store.put(&order)?;
            Ok(FinalizeStart::Claimed(order, guard))
        })?
    }

    /// 套用 CA 呼叫結果。呼叫端必須已把訂單放入進行中集合。
    fn complete_issuance(
        &self,
        order_id: &str,
        result: std::result::Result<IssuedCertificate, BackendError>,
    ) -> Result<Order> {
        match &result {
            Err(BackendError::Timeout(after)) => {
                warn!(
                    "CA call for order {} timed out after {:?}, leaving it processing",
                    order_id, after
                );
                return Ok(self.store.get::<Order>(order_id)?);
            }
            Err(BackendError::Transient(reason)) => {
                warn!("CA unavailable for order {}: {}", order_id, reason);
                return Err(AcmeError::BackendUnavailable(reason.clone()));
            }
            _ => {}
        }

        self.store.with_lock(Order::KIND, order_id, || -> Result<Order> {
            let mut order = self.store.get::<Order>(order_id)?;
            if order.status != OrderStatus::Processing {
                return Ok(order);
            }
            match result {
                Ok(issued) => {
                    if !self.all_authorizations_valid(&order)? {
                        order.fail(Problem::acme(
                            "unauthorized",
                            "an authorization changed while the order was processing",
                        ));
                    } else {
                        match Certificate::from_pem_chain(
                            Uuid::new_v4().simple().to_string(),
                            &order.id,
                            &issued.pem_chain,
                            &issued.ca_reference,
                        ) {
                            Ok(cert) => {
                                self.store.put(&cert)?;
                                info!("Order {} is valid, certificate {}", order.id, cert.serial);
                                order.certificate_id = Some(cert.id);
                                order.status = OrderStatus::Valid;
                                order.error = None;
                            }
                            Err(e) => {
                                warn!("CA returned an unreadable certificate for {}: {}", order.id, e);
                                order.fail(Problem::acme("serverInternal", e.to_string()));
                            }
                        }
                    }
                }
                Err(BackendError::Rejected(reason)) => {
                    warn!("CA rejected order {}: {}", order.id, reason);
                    order.fail(Problem::acme("badCSR", reason));
                }
                Err(_) => return Ok(order),
            }
            self.store.put(&order)?;
            Ok(order)
        })?
    }

    /// 查詢已簽發的證書，只有訂單擁有者可以下載。
    pub fn certificate(&self, cert_id: &str, account: &Account) -> Result<Certificate> {
        let cert = self
            .store
            .find::<Certificate>(cert_id)?
            .ok_or_else(|| AcmeError::NotFound(format!("certificate {}", cert_id)))?;
        self.owned_order(&cert.order_id, account)?;
        Ok(cert)
    }

    /// 對帳：處理沒有進行中呼叫、且已超過逾時加寬限時間的 processing 訂單。
    ///
    /// CA 已簽發則轉為 valid，拒絕則 invalid，仍在處理則保持，查無紀錄則重送一次。
    /// 回傳狀態有變更的訂單數。
    pub fn reconcile(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - lifetime(self.settings.backend_timeout)
            - lifetime(self.settings.reconcile_grace);
        let mut settled = 0;
        for order in self.store.list::<Order>()? {
            if order.status != OrderStatus::Processing {
                continue;
            }
            if order.finalize_started_at.is_some_and(|t| t > cutoff) {
                continue;
            }
            match self.reconcile_order(&order) {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => warn!("Reconciliation of order {} failed: {}", order.id, e),
            }
        }
        if settled > 0 {
            info!("Reconciled {} processing orders", settled);
        }
        Ok(settled)
    }

    fn reconcile_order(&self, order: &Order) -> Result<bool> {
        let Some(_in_flight) = self.claim(&order.id)? else {
            return Ok(false);
        };
        let outcome = match self.ca.poll(&order.id) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Could not poll the CA for order {}: {}", order.id, e);
                return Ok(false);
            }
        };

        let result = match outcome {
            PollOutcome::Issued(cert) => Ok(cert),
            PollOutcome::Rejected(reason) => Err(BackendError::Rejected(reason)),
            PollOutcome::Pending => {
                debug!("Order {} is still pending at the CA", order.id);
                return Ok(false);
            }
            PollOutcome::Unknown if order.resubmitted => Err(BackendError::Rejected(
                "certificate authority has no record of the request".to_string(),
            )),
            PollOutcome::Unknown => {
                let csr_der = self.mark_resubmitted(&order.id)?;
                info!("CA has no record of order {}, resubmitting once", order.id);
                self.ca.issue(&IssuanceRequest {
                    request_id: order.id.clone(),
                    csr_der,
                    identifiers: order.identifiers.iter().map(|i| i.value.clone()).collect(),
                })
            }
        };
        let updated = self.complete_issuance(&order.id, result)?;
        Ok(updated.status != OrderStatus::Processing)
    }

    fn mark_resubmitted(&self, order_id: &str) -> Result<Vec<u8>> {
        self.store.with_lock(Order::KIND, order_id, || -> Result<Vec<u8>> {
            let mut order = self.store.get::<Order>(order_id)?;
            let csr = order
                .csr
                .as_deref()
                .ok_or_else(|| AcmeError::ServerError("processing order has no CSR".into()))?;
            let der = Base64::from_url(csr)
                .map_err(|e| AcmeError::ServerError(e.to_string()))?
                .into_bytes();
            order.resubmitted = true;
            order.finalize_started_at = Some(Utc::now());
            self.store.put(&order)?;
            Ok(der)
        })?
    }

    /// 將過期的 pending 授權標為 expired，並讓過期或失效的訂單轉為 invalid。
    pub fn expire_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut changed = 0;

        for authz in self.store.list::<Authorization>()? {
            if authz.status != AuthorizationStatus::Pending || now <= authz.expires {
                continue;
            }
            let expired = self.store.with_lock(Authorization::KIND, &authz.id, || -> Result<bool> {
                let mut authz = self.store.get::<Authorization>(&authz.id)?;
                let expired = authz.expire_if_due(now);
                if expired {
                    self.store.put(&authz)?;
                }
                Ok(expired)
            })??;
            if expired {
                changed += 1;
            }
        }

        for order in self.store.list::<Order>()? {
            if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
                continue;
            }
            if self.refresh_order_status(&order.id)?.status == OrderStatus::Invalid {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("Expired {} stale orders and authorizations", changed);
        }
        Ok(changed)
    }
}
