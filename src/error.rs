//! ACME 伺服器的錯誤分類，以及對應的 RFC 7807 problem document。

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ERROR_NS: &str = "urn:ietf:params:acme:error:";

/// 伺服器核心對外呈現的錯誤分類。
///
/// 各子模組有自己的錯誤型別，在進入引擎邊界時轉換為此列舉；
/// 分派器再透過 [`AcmeError::problem`] 轉為回應內容。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcmeError {
    /// 請求格式錯誤或內容不合法。
    #[error("Malformed request: {0}")]
    BadRequest(String),
    /// 簽章錯誤、帳戶已停用，或存取他人資源。
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// 資源目前狀態不允許此操作，例如授權或挑戰已不在 pending。
    #[error("Conflict: {0}")]
    Conflict(String),
    /// 訂單狀態不允許 finalize。
    #[error("Order not ready: {0}")]
    OrderNotReady(String),
    /// 新金鑰已屬於其他帳戶，附帶該帳戶 id。
    #[error("Key is already in use by account {0}")]
    KeyInUse(String),
    #[error("Bad CSR: {0}")]
    BadCsr(String),
    #[error("Bad public key: {0}")]
    BadPublicKey(String),
    #[error("Invalid contact: {0}")]
    InvalidContact(String),
    #[error("Rejected identifier: {0}")]
    RejectedIdentifier(String),
    #[error("Unsupported identifier: {0}")]
    UnsupportedIdentifier(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Internal server error: {0}")]
    ServerError(String),
    /// CA 後端暫時性失敗且重試次數已用盡。
    #[error("CA backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Bad nonce: {0}")]
    BadNonce(String),
    #[error("Bad signature algorithm: {0}")]
    BadSignatureAlgorithm(String),
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("Account does not exist")]
    AccountDoesNotExist,
}

pub type Result<T> = std::result::Result<T, AcmeError>;

/// RFC 7807 problem document，內容型別為 `application/problem+json`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Problem {
    /// 以 ACME 命名空間內的錯誤名稱建立 problem，例如 `"incorrectResponse"`。
    pub fn acme(name: &str, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("{}{}", ERROR_NS, name),
            detail: detail.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status.as_u16());
        self
    }
}

impl AcmeError {
    /// 對應的 HTTP 狀態碼。
    pub fn status(&self) -> StatusCode {
        match self {
            AcmeError::BadRequest(_)
            | AcmeError::BadNonce(_)
            | AcmeError::BadSignatureAlgorithm(_)
            | AcmeError::BadCsr(_)
            | AcmeError::BadPublicKey(_)
            | AcmeError::InvalidContact(_)
            | AcmeError::RejectedIdentifier(_)
            | AcmeError::UnsupportedIdentifier(_)
            | AcmeError::AccountDoesNotExist => StatusCode::BAD_REQUEST,
            AcmeError::Unauthorized(_) | AcmeError::OrderNotReady(_) => StatusCode::FORBIDDEN,
            AcmeError::Conflict(_) | AcmeError::KeyInUse(_) => StatusCode::CONFLICT,
            AcmeError::NotFound(_) => StatusCode::NOT_FOUND,
            AcmeError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            AcmeError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AcmeError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AcmeError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AcmeError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// ACME 錯誤命名空間內的型別名稱。RFC 8555 沒有一般狀態衝突的型別，`Conflict` 歸為 `malformed`。
    fn type_name(&self) -> &'static str {
        match self {
            AcmeError::BadRequest(_)
            | AcmeError::Conflict(_)
            | AcmeError::KeyInUse(_)
            | AcmeError::NotFound(_)
            | AcmeError::MethodNotAllowed(_)
            | AcmeError::UnsupportedMediaType(_) => "malformed",
            AcmeError::Unauthorized(_) => "unauthorized",
            AcmeError::OrderNotReady(_) => "orderNotReady",
            AcmeError::BadCsr(_) => "badCSR",
            AcmeError::BadPublicKey(_) => "badPublicKey",
            AcmeError::InvalidContact(_) => "invalidContact",
            AcmeError::RejectedIdentifier(_) => "rejectedIdentifier",
            AcmeError::UnsupportedIdentifier(_) => "unsupportedIdentifier",
            AcmeError::RateLimited(_) => "rateLimited",
            AcmeError::ServerError(_) | AcmeError::BackendUnavailable(_) => "serverInternal",
            AcmeError::BadNonce(_) => "badNonce",
            AcmeError::BadSignatureAlgorithm(_) => "badSignatureAlgorithm",
            AcmeError::AccountDoesNotExist => "accountDoesNotExist",
        }
    }

    pub fn problem(&self) -> Problem {
        Problem::acme(self.type_name(), self.to_string()).with_status(self.status())
    }
}
