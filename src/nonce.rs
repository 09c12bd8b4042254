use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    base64::random_url_token,
    error::AcmeError,
    store::{Entity, Store, StoreError},
};

/// 隨機位元組長度，編碼後為 22 字元。
const NONCE_BYTES: usize = 16;
/// 每發出這麼多個 nonce 就清理一次過期紀錄。
const PURGE_EVERY: u64 = 256;

/// 表示在發出或消耗 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 從未發出、已過期或已被清除。
    #[error("Nonce not found")]
    NotFound,
    /// 已被使用過，即重送攻擊。
    #[error("Nonce already used")]
    AlreadyUsed,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Random generator error: {0}")]
    Random(#[from] openssl::error::ErrorStack),
}

impl From<NonceError> for AcmeError {
    fn from(e: NonceError) -> Self {
        match e {
            NonceError::NotFound | NonceError::AlreadyUsed => AcmeError::BadNonce(e.to_string()),
            NonceError::Store(e) => e.into(),
            NonceError::Random(e) => AcmeError::ServerError(e.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, NonceError>;

/// 儲存中的 nonce 紀錄。消耗後保留為墓碑直到過期，以區分重送與未知值。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRecord {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl Entity for NonceRecord {
    const KIND: &'static str = "nonces";

    fn id(&self) -> &str {
        &self.value
    }
}

/// 定義發出與消耗 Nonce 的行為。
pub trait NonceT: Send + Sync {
    /// 發出一個新的 nonce。
    fn issue(&self) -> Result<String>;
    /// 消耗 nonce；每個值最多成功一次。
    fn consume(&self, nonce: &str) -> Result<()>;
}

/// 以 [`Store`] 保存的 nonce 集合。
#[derive(Debug)]
pub struct NonceStore {
    store: Arc<Store>,
    ttl: Duration,
    issued: AtomicU64,
}

impl NonceStore {
    pub fn new(store: Arc<Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            issued: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, record: &NonceRecord, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(record.issued_at) > ttl
    }

    /// 移除過期的 nonce 與墓碑，回傳移除數量。
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for record in self.store.list::<NonceRecord>()? {
            if self.is_expired(&record, now) {
                self.store.delete::<NonceRecord>(&record.value)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Purged {} expired nonces", removed);
        }
        Ok(removed)
    }
}

impl NonceT for NonceStore {
    fn issue(&self) -> Result<String> {
        let value = random_url_token(NONCE_BYTES)?;
        self.store.put(&NonceRecord {
            value: value.clone(),
            issued_at: Utc::now(),
            consumed_at: None,
        })?;

        if (self.issued.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            self.purge_expired()?;
        }
        Ok(value)
    }

    fn consume(&self, nonce: &str) -> Result<()> {
        self.store.with_lock(NonceRecord::KIND, nonce, || {
            let mut record = self
                .store
                .find::<NonceRecord>(nonce)?
                .ok_or(NonceError::NotFound)?;
            let now = Utc::now();
            if self.is_expired(&record, now) {
                self.store.delete::<NonceRecord>(nonce)?;
                return Err(NonceError::NotFound);
            }
            if record.consumed_at.is_some() {
                return Err(NonceError::AlreadyUsed);
            }
            record.consumed_at = Some(now);
            self.store.put(&record)?;
            Ok(())
        })?
    }
}

/// 固定回傳同一個值的 Nonce 實作，供測試使用；`consume` 只接受該值。
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

#[cfg(test)]
impl MockNonce {
    pub fn new(value: impl Into<String>) -> Self {
        MockNonce {
            value: value.into(),
        }
    }
}

#[cfg(test)]
impl NonceT for MockNonce {
    fn issue(&self) -> Result<String> {
        Ok(self.value.clone())
    }

    fn consume(&self, nonce: &str) -> Result<()> {
        if nonce == self.value {
            Ok(())
        } else {
            Err(NonceError::NotFound)
        }
    }
}
