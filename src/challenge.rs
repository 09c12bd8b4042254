use chrono::{DateTime, Utc};
use openssl::sha::sha256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    base64::{random_url_token, Base64},
    error::Problem,
    store::Entity,
};

/// token 的隨機位元組長度（RFC 8555 要求至少 128 位元）。
const TOKEN_BYTES: usize = 32;

/// ACME 挑戰的類型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeType {
    /// 根據字串返回對應的挑戰類型，若不支援則返回 `None`。
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "http-01" => Some(Self::Http01),
            "dns-01" => Some(Self::Dns01),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
        }
    }
}

/// 挑戰狀態：pending → processing → valid | invalid。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// 判斷該狀態是否為終結狀態。
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

/// 一個 ACME 驗證挑戰，隸屬於單一授權。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub authorization_id: String,
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl Entity for Challenge {
    const KIND: &'static str = "challenges";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Challenge {
    /// 建立新的 pending 挑戰並產生隨機 token。
    pub fn new(
        authorization_id: &str,
        challenge_type: ChallengeType,
    ) -> Result<Self, openssl::error::ErrorStack> {
        Ok(Challenge {
            id: Uuid::new_v4().simple().to_string(),
            authorization_id: authorization_id.to_string(),
            challenge_type,
            token: random_url_token(TOKEN_BYTES)?,
            status: ChallengeStatus::Pending,
            validated: None,
            error: None,
        })
    }

    /// key authorization：`token || "." || 帳戶金鑰 thumbprint`。
    pub fn key_authorization(&self, thumbprint: &str) -> String {
        format!("{}.{}", self.token, thumbprint)
    }
}

/// 根據 key authorization 計算 DNS TXT 記錄值，使用 SHA-256 與 URL-safe Base64 編碼。
pub fn dns_txt_value(key_authorization: &str) -> String {
    Base64::new(sha256(key_authorization.as_bytes())).base64_url()
}

/// DNS-01 查詢的紀錄名稱，萬用字元前綴會被移除。
pub fn dns_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_challenge() {
        let challenge = Challenge::new("authz-1", ChallengeType::Http01).unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Pending);
        assert_eq!(challenge.token.len(), 43);
        assert_eq!(
            challenge.key_authorization("tp"),
            format!("{}.tp", challenge.token)
        );
        let json = serde_json::to_value(&challenge).unwrap();
        assert_eq!(json["type"], "http-01");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_dns_txt_value() {
        // RFC 8555 §8.4 的計算方式：base64url(SHA-256(key authorization))
        let value = dns_txt_value("token.thumbprint");
        assert_eq!(value.len(), 43);
        assert_eq!(value, dns_txt_value("token.thumbprint"));
        assert_ne!(value, dns_txt_value("token.other"));
        assert_eq!(dns_record_name("*.example.com"), "_acme-challenge.example.com");
    }

    #[test]
    fn test_type_parse() {
        assert_eq!(ChallengeType::parse("dns-01"), Some(ChallengeType::Dns01));
        assert_eq!(ChallengeType::parse("tls-alpn-01"), None);
        assert!(ChallengeStatus::Invalid.is_terminal());
        assert!(!ChallengeStatus::Processing.is_terminal());
    }
}
