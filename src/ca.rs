//! CA 後端抽象，以及帶有重試與硬性逾時的呼叫端。

use std::{
    fmt,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use thiserror::Error;

/// 送往 CA 的簽發請求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    /// 請求識別碼，使用訂單 id；重送時 CA 端可據此去重，對帳時據此查詢。
    pub request_id: String,
    pub csr_der: Vec<u8>,
    pub identifiers: Vec<String>,
}

/// CA 回傳的證書。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// 終端證書在前的 PEM 證書鏈。
    pub pem_chain: String,
    pub ca_reference: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// 網路、I/O 或 CA 暫時無法服務，可以重試。
    #[error("Transient backend failure: {0}")]
    Transient(String),
    /// 超過硬性逾時；CA 端可能仍在處理。
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),
    /// CA 拒絕簽發，不可重試。
    #[error("Backend rejected the request: {0}")]
    Rejected(String),
}

type Result<T> = std::result::Result<T, BackendError>;

/// 對帳時查詢先前請求的結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Issued(IssuedCertificate),
    Pending,
    Rejected(String),
    /// CA 端沒有這筆請求的紀錄。
    Unknown,
}

/// CA 後端的介面。實作必須可以跨執行緒共用。
pub trait CaBackend: Send + Sync + fmt::Debug {
    /// 提交簽發請求並等待證書。
    fn submit(&self, request: &IssuanceRequest) -> Result<IssuedCertificate>;

    /// 以請求識別碼查詢先前提交的結果。
    fn poll(&self, request_id: &str) -> Result<PollOutcome>;
}

/// 指數退避的重試策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 總嘗試次數，包含第一次。
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次嘗試（從 1 起算）失敗後，下一次嘗試前應等待的時間；
    /// `None` 表示不再重試。
    pub fn next_delay(&self, attempt: u32, prior: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let delay = match prior {
            None => self.initial_delay,
            Some(prior) => prior.saturating_mul(self.multiplier),
        };
        Some(delay.min(self.max_delay))
    }
}

/// 包裝 [`CaBackend`]：暫時性失敗依 [`RetryPolicy`] 重試，整體呼叫受硬性逾時限制。
///
/// 每次嘗試在獨立執行緒上執行，逾時後呼叫端不再等待，但不會中斷進行中的呼叫。
#[derive(Debug, Clone)]
pub struct CaClient {
    backend: Arc<dyn CaBackend>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl CaClient {
    pub fn new(backend: Arc<dyn CaBackend>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            timeout,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CaBackend> {
        &self.backend
    }

    /// 提交簽發請求。
    ///
    /// 回傳 `Rejected` 時訂單應轉為 invalid；`Timeout` 與用盡重試的 `Transient`
    /// 則保留 processing，交由對帳處理。
    pub fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate> {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;
        let mut delay = None;

        loop {
            attempt += 1;
            let backend = self.backend.clone();
            let req = request.clone();
            match self.call_with_deadline(deadline, move || backend.submit(&req)) {
                Ok(cert) => {
                    debug!(
                        "Issued certificate for {} on attempt {}",
                        request.request_id, attempt
                    );
                    return Ok(cert);
                }
                Err(BackendError::Transient(reason)) => {
                    delay = self.policy.next_delay(attempt, delay);
                    let Some(wait) = delay else {
                        warn!(
                            "Giving up on {} after {} attempts: {}",
                            request.request_id, attempt, reason
                        );
                        return Err(BackendError::Transient(reason));
                    };
                    if Instant::now() + wait >= deadline {
                        warn!(
                            "No time left to retry {}: {}",
                            request.request_id, reason
                        );
                        return Err(BackendError::Timeout(self.timeout));
                    }
                    warn!(
                        "Transient failure for {} (attempt {}), retrying in {:?}: {}",
                        request.request_id, attempt, wait, reason
                    );
                    thread::sleep(wait);
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// 查詢先前請求的狀態，單次嘗試，同樣受硬性逾時限制。
    pub fn poll(&self, request_id: &str) -> Result<PollOutcome> {
        let backend = self.backend.clone();
        let id = request_id.to_string();
        self.call_with_deadline(Instant::now() + self.timeout, move || backend.poll(&id))
    }

    fn call_with_deadline<T, F>(&self, deadline: Instant, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("ca-call".to_string())
            .spawn(move || {
                // 接收端可能已因逾時離開
                let _ = tx.send(call());
            })
            .map_err(|e| BackendError::Transient(format!("failed to spawn worker: {}", e)))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(BackendError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(BackendError::Transient(
                "backend worker exited without a result".to_string(),
            )),
        }
    }
}
