//! ACME 帳戶註冊表：以公鑰 thumbprint 為唯一鍵保存帳戶，並處理更新、停用與金鑰輪替。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::AcmeError,
    jwk::{Jwk, JwkError},
    payload::normalize_contact,
    store::{Entity, Store, StoreError},
};

const THUMBPRINT_INDEX: &str = "thumbprint";
const THUMBPRINT_LOCK: &str = "thumbprints";

/// 處理帳戶相關操作時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum AccountError {
    /// 此金鑰已註冊，附帶既有帳戶 id。
    #[error("Account already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Account not found: {0}")]
    NotFound(String),
    #[error("Account is {0}")]
    NotActive(&'static str),
    /// 新金鑰已屬於其他帳戶，附帶該帳戶 id。
    #[error("Key is already in use by account {0}")]
    KeyInUse(String),
    #[error("JWK error: {0}")]
    JwkError(#[from] JwkError),
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
}

impl From<AccountError> for AcmeError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::AlreadyRegistered(_) => AcmeError::Conflict(e.to_string()),
            AccountError::KeyInUse(owner) => AcmeError::KeyInUse(owner),
            AccountError::NotFound(_) => AcmeError::AccountDoesNotExist,
            AccountError::NotActive(_) => AcmeError::Unauthorized(e.to_string()),
            AccountError::JwkError(e) => AcmeError::BadPublicKey(e.to_string()),
            AccountError::StoreError(e) => e.into(),
        }
    }
}

/// 結果類型，當操作成功返回 `T`，失敗則返回 [`AccountError`].
pub type Result<T> = std::result::Result<T, AccountError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Deactivated => "deactivated",
            Self::Revoked => "revoked",
        }
    }
}

/// 已註冊的 ACME 帳戶。`id` 建立後不再改變。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub thumbprint: String,
    pub jwk: Jwk,
    pub contact: Vec<String>,
    pub status: AccountStatus,
    pub terms_of_service_agreed: bool,
    pub created_at: DateTime<Utc>,
}

impl Entity for Account {
    const KIND: &'static str = "accounts";

    fn id(&self) -> &str {
        &self.id
    }
}

/// 帳戶註冊表。
#[derive(Debug, Clone)]
pub struct AccountRegistry {
    store: Arc<Store>,
}

impl AccountRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// 註冊新帳戶；同一 thumbprint 的註冊彼此序列化，重複註冊回傳 `AlreadyRegistered`。
    pub fn register(&self, jwk: Jwk, contact: &[String], tos_agreed: bool) -> Result<Account> {
        let thumbprint = jwk.thumbprint()?;
        // 先確認金鑰可用
        jwk.to_public_key()?;

        self.store.with_lock(THUMBPRINT_LOCK, &thumbprint, || {
            if let Some(existing) = self.store.index_get(THUMBPRINT_INDEX, &thumbprint)? {
                return Err(AccountError::AlreadyRegistered(existing));
            }
            let account = Account {
                id: Uuid::new_v4().simple().to_string(),
                thumbprint: thumbprint.clone(),
                jwk,
                contact: contact.iter().map(|c| normalize_contact(c)).collect(),
                status: AccountStatus::Valid,
                terms_of_service_agreed: tos_agreed,
                created_at: Utc::now(),
            };
            self.store.put(&account)?;
            self.store
                .index_put(THUMBPRINT_INDEX, &thumbprint, &account.id)?;
            info!("Registered account {}", account.id);
            Ok(account)
        })?
    }

    /// 以金鑰 thumbprint 查詢帳戶。
    pub fn lookup(&self, thumbprint: &str) -> Result<Account> {
        let id = self
            .store
            .index_get(THUMBPRINT_INDEX, thumbprint)?
            .ok_or_else(|| AccountError::NotFound(thumbprint.to_string()))?;
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<Account> {
        self.store
            .find::<Account>(id)?
            .ok_or_else(|| AccountError::NotFound(id.to_string()))
    }

    /// 停用或撤銷的帳戶不得再進行任何操作。
    pub fn ensure_active(account: &Account) -> Result<()> {
        match account.status {
            AccountStatus::Valid => Ok(()),
            other => Err(AccountError::NotActive(other.as_str())),
        }
    }

    /// 以 `f` 修改啟用中的帳戶並寫回，整個過程持有帳戶鎖。
    fn modify(&self, id: &str, f: impl FnOnce(&mut Account) -> Result<()>) -> Result<Account> {
        self.store.with_lock(Account::KIND, id, || {
            let mut account = self.get(id)?;
            Self::ensure_active(&account)?;
            f(&mut account)?;
            self.store.put(&account)?;
            Ok(account)
        })?
    }

    /// 更新聯絡資訊。
    pub fn update(&self, id: &str, contact: &[String]) -> Result<Account> {
        self.modify(id, |account| {
            account.contact = contact.iter().map(|c| normalize_contact(c)).collect();
            Ok(())
        })
    }

    pub fn deactivate(&self, id: &str) -> Result<Account> {
        let account = self.modify(id, |account| {
            account.status = AccountStatus::Deactivated;
            Ok(())
        })?;
        info!("Deactivated account {}", id);
        Ok(account)
    }

    /// 金鑰輪替（RFC 8555 §7.3.5）。新金鑰若屬於其他帳戶則回傳 `KeyInUse`。
    pub fn change_key(&self, id: &str, new_jwk: Jwk) -> Result<Account> {
        let new_thumbprint = new_jwk.thumbprint()?;
        new_jwk.to_public_key()?;

        self.store.with_lock(THUMBPRINT_LOCK, &new_thumbprint, || {
            match self.store.index_get(THUMBPRINT_INDEX, &new_thumbprint)? {
                Some(owner) if owner != id => return Err(AccountError::KeyInUse(owner)),
                _ => {}
            }
            let mut old_thumbprint = None;
            let account = self.modify(id, |account| {
                if account.thumbprint != new_thumbprint {
                    old_thumbprint = Some(account.thumbprint.clone());
                }
                account.thumbprint = new_thumbprint.clone();
                account.jwk = new_jwk;
                Ok(())
            })?;
            self.store
                .index_put(THUMBPRINT_INDEX, &new_thumbprint, &account.id)?;
            if let Some(old) = old_thumbprint {
                self.store.index_remove(THUMBPRINT_INDEX, &old)?;
            }
            info!("Rolled over key for account {}", account.id);
            Ok(account)
        })?
    }
}
