use serde::{Deserialize, Serialize};

/// ACME 目錄物件（RFC 8555 §7.1.1），列出用戶端需要的各端點 URL。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Directory {
    /// 取得新 nonce 的端點。
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    /// 新帳號註冊的端點。
    #[serde(rename = "newAccount")]
    pub new_account: String,
    /// 建立訂單的端點。
    #[serde(rename = "newOrder")]
    pub new_order: String,
    /// 帳戶金鑰輪替的端點。
    #[serde(rename = "keyChange")]
    pub key_change: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

/// 目錄的 `meta` 欄位。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DirectoryMeta {
    #[serde(rename = "termsOfService", skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(rename = "externalAccountRequired")]
    pub external_account_required: bool,
}

impl Directory {
    /// 依伺服器基底 URL 產生目錄。
    pub fn new(urls: &Urls, terms_of_service: Option<&str>) -> Self {
        Self {
            new_nonce: urls.endpoint("new-nonce"),
            new_account: urls.endpoint("new-account"),
            new_order: urls.endpoint("new-order"),
            key_change: urls.endpoint("key-change"),
            meta: Some(DirectoryMeta {
                terms_of_service: terms_of_service.map(str::to_string),
                external_account_required: false,
            }),
        }
    }
}

/// 由基底 URL 組出各資源 URL，並反向解析請求路徑。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urls {
    base: String,
}

impl Urls {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base, name)
    }

    pub fn directory(&self) -> String {
        self.endpoint("directory")
    }

    pub fn account(&self, id: &str) -> String {
        format!("{}/account/{}", self.base, id)
    }

    pub fn account_orders(&self, id: &str) -> String {
        format!("{}/account/{}/orders", self.base, id)
    }

    pub fn order(&self, id: &str) -> String {
        format!("{}/order/{}", self.base, id)
    }

    pub fn finalize(&self, id: &str) -> String {
        format!("{}/order/{}/finalize", self.base, id)
    }

    pub fn authorization(&self, id: &str) -> String {
        format!("{}/authz/{}", self.base, id)
    }

    pub fn challenge(&self, id: &str) -> String {
        format!("{}/chall/{}", self.base, id)
    }

    pub fn certificate(&self, id: &str) -> String {
        format!("{}/cert/{}", self.base, id)
    }

    /// 從帳戶 URL（JWS `kid`）取出帳戶 id。
    pub fn account_id<'a>(&self, kid: &'a str) -> Option<&'a str> {
        kid.strip_prefix(self.base.as_str())?
            .strip_prefix("/account/")
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }
}
