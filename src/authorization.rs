use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{payload::Identifier, store::Entity};

/// 授權狀態。`deactivated` 為用戶端主動停用（RFC 8555 §7.5.2）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
    Revoked,
    Deactivated,
}

impl AuthorizationStatus {
    /// 除 pending 與 valid 之外皆代表授權已失效。
    pub fn is_failed(&self) -> bool {
        !matches!(self, Self::Pending | Self::Valid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Deactivated => "deactivated",
        }
    }
}

/// 對單一識別碼的控制權證明，隸屬於單一訂單。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub id: String,
    pub order_id: String,
    /// 去除萬用字元前綴後的識別碼。
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<String>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Entity for Authorization {
    const KIND: &'static str = "authorizations";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Authorization {
    /// 為識別碼建立 pending 授權；`*.` 前綴會移到 `wildcard` 旗標。
    pub fn new(order_id: &str, identifier: &Identifier, expires: DateTime<Utc>) -> Self {
        let wildcard = identifier.value.starts_with("*.");
        Authorization {
            id: Uuid::new_v4().simple().to_string(),
            order_id: order_id.to_string(),
            identifier: Identifier {
                type_: identifier.type_.clone(),
                value: identifier.value.trim_start_matches("*.").to_string(),
            },
            status: AuthorizationStatus::Pending,
            expires,
            challenges: Vec::new(),
            wildcard,
        }
    }

    /// pending 授權超過期限後轉為 expired；回傳是否有變更。
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == AuthorizationStatus::Pending && now > self.expires {
            self.status = AuthorizationStatus::Expired;
            true
        } else {
            false
        }
    }
}
