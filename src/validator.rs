//! 挑戰驗證：HTTP-01 與 DNS-01（透過 DNS-over-HTTPS 查詢 TXT 紀錄）。
//!
//! 驗證在背景執行緒進行，結果寫回挑戰與授權後再推導訂單狀態。

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use chrono::Utc;
use log::{debug, info, warn};
use reqwest::{blocking::Client, header::ACCEPT};

use crate::{
    account::{Account, AccountRegistry},
    authorization::{Authorization, AuthorizationStatus},
    challenge::{dns_record_name, dns_txt_value, Challenge, ChallengeStatus, ChallengeType},
    error::{AcmeError, Problem, Result},
    order::OrderEngine,
    store::Entity,
};

/// 單一挑戰類型的驗證方式。
pub trait ChallengeVerifier: Send + Sync + fmt::Debug {
    /// 確認 `identifier` 已發佈 `key_authorization`；失敗時回傳要記錄在挑戰上的問題描述。
    fn verify(
        &self,
        identifier: &str,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> std::result::Result<(), Problem>;
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AcmeError::ServerError(format!("failed to build HTTP client: {}", e)))
}

/// HTTP-01：GET `http://{domain}:{port}/.well-known/acme-challenge/{token}`。
#[derive(Debug, Clone)]
pub struct Http01Verifier {
    client: Client,
    port: u16,
}

impl Http01Verifier {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            port,
        })
    }
}

impl ChallengeVerifier for Http01Verifier {
    fn verify(
        &self,
        identifier: &str,
        challenge: &Challenge,
        key_authorization: &str,
    ) -> std::result::Result<(), Problem> {
        let url = format!(
            "http://{}:{}/.well-known/acme-challenge/{}",
            identifier, self.port, challenge.token
        );
        debug!("Fetching {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Problem::acme("connection", format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Problem::acme(
                "incorrectResponse",
                format!("{} returned {}", url, response.status()),
            ));
        }
        let body = response
            .text()
            .map_err(|e| Problem::acme("connection", format!("{}: {}", url, e)))?;
        if body.trim() != key_authorization {
            return Err(Problem::acme(
                "incorrectResponse",
                format!("unexpected key authorization at {}", url),
            ));
        }
        Ok(())
    }
}

/// DNS-01：以 DoH JSON API 查詢 `_acme-challenge.{domain}` 的 TXT 紀錄。
#[derive(Debug, Clone)]
pub struct Dns01Verifier {
    client: Client,
    doh_url: String,
}

impl Dns01Verifier {
    pub fn new(doh_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            doh_url: doh_url.to_string(),
        })
    }

    fn txt_records(&self, name: &str) -> std::result::Result<Vec<String>, Problem> {
        let response = self
            .client
            .get(&self.doh_url)
            .query(&[("name", name), ("type", "TXT")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .map_err(|e| Problem::acme("dns", format!("DNS query for {} failed: {}", name, e)))?;
        let json: serde_json::Value = response
            .json()
            .map_err(|e| Problem::acme("dns", format!("invalid DNS response: {}", e)))?;
        Ok(json["Answer"]
            .as_array()
            .map(|answers| {
                answers
                    .iter()
                    .filter_map(|entry| entry["data"].as_str())
                    .map(|s| s.trim_matches('"').to_string())
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl ChallengeVerifier for Dns01Verifier {
    fn verify(
        &self,
        identifier: &str,
        _challenge: &Challenge,
        key_authorization: &str,
    ) -> std::result::Result<(), Problem> {
        let name = dns_record_name(identifier);
        let expected = dns_txt_value(key_authorization);
        let records = self.txt_records(&name)?;
        if records.iter().any(|r| *r == expected) {
            return Ok(());
        }
        Err(Problem::acme(
            "incorrectResponse",
            format!("no TXT record at {} matches ({} found)", name, records.len()),
        ))
    }
}

/// 驅動挑戰狀態機的驗證器。
/// 正在背景驗證的挑戰；執行緒結束時自集合移除。
struct Running {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeValidator {
    engine: Arc<OrderEngine>,
    verifiers: Arc<HashMap<ChallengeType, Arc<dyn ChallengeVerifier>>>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl ChallengeValidator {
    pub fn new(
        engine: Arc<OrderEngine>,
        verifiers: HashMap<ChallengeType, Arc<dyn ChallengeVerifier>>,
    ) -> Self {
        Self {
            engine,
            verifiers: Arc::new(verifiers),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 以設定建立 HTTP-01 與 DNS-01 驗證器。
    pub fn with_defaults(
        engine: Arc<OrderEngine>,
        http01_port: u16,
        doh_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut verifiers: HashMap<ChallengeType, Arc<dyn ChallengeVerifier>> = HashMap::new();
        verifiers.insert(
            ChallengeType::Http01,
            Arc::new(Http01Verifier::new(http01_port, timeout)?),
        );
        verifiers.insert(
            ChallengeType::Dns01,
            Arc::new(Dns01Verifier::new(doh_url, timeout)?),
        );
        Ok(Self::new(engine, verifiers))
    }

    /// 用戶端回應挑戰：挑戰轉為 processing 並在背景驗證。
    ///
    /// 已在 processing 或 valid 的挑戰原樣回傳；processing 但沒有執行緒在驗證時重新開始驗證。
    /// 同一授權已有其他挑戰在處理中時回傳 `Conflict`。
    pub fn initiate(&self, challenge_id: &str, account: &Account) -> Result<Challenge> {
        AccountRegistry::ensure_active(account)?;
        let (_, authz, _) = self.engine.get_challenge(challenge_id, account)?;
        let store = self.engine.store();

        let (challenge, started) =
            store.with_lock(Authorization::KIND, &authz.id, || -> Result<_> {
                let mut authz = store.get::<Authorization>(&authz.id)?;
                let mut challenge = store.get::<Challenge>(challenge_id)?;
                match challenge.status {
                    ChallengeStatus::Processing | ChallengeStatus::Valid => {
                        return Ok((challenge, false))
                    }
                    ChallengeStatus::Invalid => {
                        return Err(AcmeError::Conflict("challenge is invalid".to_string()))
                    }
                    ChallengeStatus::Pending => {}
                }
                if authz.expire_if_due(Utc::now()) {
                    store.put(&authz)?;
                }
                if authz.status != AuthorizationStatus::Pending {
                    return Err(AcmeError::Conflict(format!(
                        "authorization is {}",
                        authz.status.as_str()
                    )));
                }
                for other in authz.challenges.iter().filter(|id| *id != challenge_id) {
                    if store.get::<Challenge>(other)?.status == ChallengeStatus::Processing {
                        return Err(AcmeError::Conflict(
                            "another challenge of this authorization is processing".to_string(),
                        ));
                    }
                }
                challenge.status = ChallengeStatus::Processing;
                store.put(&challenge)?;
                Ok((challenge, true))
            })??;

        if started {
            info!(
                "Validating {} challenge {} for {}",
                challenge.challenge_type.as_str(),
                challenge.id,
                authz.identifier.value
            );
            self.spawn_validation(&challenge.id)?;
        } else {
            if challenge.status == ChallengeStatus::Processing
                && self.spawn_validation(&challenge.id)?
            {
                info!("Resumed validation of challenge {}", challenge.id);
            }
            self.engine.refresh_order_status(&authz.order_id)?;
        }
        Ok(challenge)
    }

    /// 重新驗證停在 processing 卻沒有執行緒處理的挑戰，例如行程重新啟動之後。
    pub fn resume_stalled(&self) -> Result<usize> {
        let mut resumed = 0;
        for challenge in self.engine.store().list::<Challenge>()? {
            if challenge.status == ChallengeStatus::Processing
                && self.spawn_validation(&challenge.id)?
            {
                info!("Resumed validation of challenge {}", challenge.id);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    fn claim(&self, challenge_id: &str) -> Result<Option<Running>> {
        let mut set = self
            .running
            .lock()
            .map_err(|_| AcmeError::ServerError("validation set poisoned".to_string()))?;
        if !set.insert(challenge_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(Running {
            set: self.running.clone(),
            id: challenge_id.to_string(),
        }))
    }

    /// 在背景執行緒上驗證；已有執行緒在處理同一挑戰時回傳 `false`。
    fn spawn_validation(&self, challenge_id: &str) -> Result<bool> {
        let Some(running) = self.claim(challenge_id)? else {
            return Ok(false);
        };
        let validator = self.clone();
        thread::Builder::new()
            .name("challenge-validation".to_string())
            .spawn(move || {
                if let Err(e) = validator.validate(&running.id) {
                    warn!("Validation of challenge {} failed: {}", running.id, e);
                }
                drop(running);
            })
            .map_err(|e| AcmeError::ServerError(format!("failed to spawn validation: {}", e)))?;
        Ok(true)
    }

    /// 執行 processing 中挑戰的驗證並寫回結果，回傳挑戰最終狀態。
    pub fn validate(&self, challenge_id: &str) -> Result<ChallengeStatus> {
        let store = self.engine.store();
        let challenge = store.get::<Challenge>(challenge_id)?;
        if challenge.status != ChallengeStatus::Processing {
            return Ok(challenge.status);
        }
        let authz = store.get::<Authorization>(&challenge.authorization_id)?;
        let order = store.get::<crate::order::Order>(&authz.order_id)?;
        let account = store.get::<Account>(&order.account_id)?;

        let key_authorization = challenge.key_authorization(&account.thumbprint);
        let outcome = match self.verifiers.get(&challenge.challenge_type) {
            Some(verifier) => verifier.verify(&authz.identifier.value, &challenge, &key_authorization),
            None => Err(Problem::acme(
                "serverInternal",
                format!("no verifier for {}", challenge.challenge_type.as_str()),
            )),
        };

        let status = store.with_lock(Authorization::KIND, &authz.id, || -> Result<_> {
            let mut challenge = store.get::<Challenge>(challenge_id)?;
            if challenge.status != ChallengeStatus::Processing {
                return Ok(challenge.status);
            }
            let mut authz = store.get::<Authorization>(&challenge.authorization_id)?;
            match outcome {
                Ok(()) => {
                    challenge.status = ChallengeStatus::Valid;
                    challenge.validated = Some(Utc::now());
                    if authz.status == AuthorizationStatus::Pending {
                        authz.status = AuthorizationStatus::Valid;
                    }
                }
                Err(problem) => {
                    debug!("Challenge {} failed: {}", challenge.id, problem.detail);
                    challenge.status = ChallengeStatus::Invalid;
                    challenge.error = Some(problem);
                    // 其他挑戰仍可嘗試時授權維持 pending
                    let mut remaining = false;
                    for other in authz.challenges.iter().filter(|id| **id != challenge.id) {
                        remaining |= !store.get::<Challenge>(other)?.status.is_terminal();
                    }
                    if authz.status == AuthorizationStatus::Pending && !remaining {
                        authz.status = AuthorizationStatus::Invalid;
                    }
                }
            }
            // 授權先寫入，觀察到挑戰終態時授權必已更新
            store.put(&authz)?;
            store.put(&challenge)?;
            Ok(challenge.status)
        })??;

        info!(
            "Challenge {} for {} is {}",
            challenge_id,
            authz.identifier.value,
            status.as_str()
        );
        self.engine.refresh_order_status(&authz.order_id)?;
        Ok(status)
    }
}
