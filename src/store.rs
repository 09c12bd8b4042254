//! 以 [`Storage`] 為基礎的型別化實體儲存，以及以實體為單位的鎖。

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    error::AcmeError,
    storage::{MemStorage, Storage, StorageError},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Corrupted record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for AcmeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, id } => AcmeError::NotFound(format!("{} {}", kind, id)),
            other => AcmeError::ServerError(other.to_string()),
        }
    }
}

/// 可被 [`Store`] 保存的實體。
pub trait Entity: Serialize + DeserializeOwned {
    /// 實體種類，同時作為儲存 key 的前綴。
    const KIND: &'static str;

    fn id(&self) -> &str;
}

/// 帳戶、訂單、授權、挑戰、nonce 與憑證的共用儲存抽象。
///
/// 後端可以是記憶體或檔案（見 [`crate::storage`]）；並發控制由
/// [`Store::with_lock`] 以實體為單位提供，不存在跨實體的全域鎖。
pub struct Store {
    backend: Arc<dyn Storage>,
    locks: LockTable,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self {
            backend,
            locks: LockTable::default(),
        }
    }

    /// 建立以記憶體為後端的儲存，測試與單機部署使用。
    pub fn memory() -> Self {
        Self::new(Arc::new(MemStorage::new()))
    }

    pub fn backend(&self) -> &dyn Storage {
        &*self.backend
    }

    fn key(kind: &str, id: &str) -> String {
        format!("{}/{}", kind, id)
    }

    pub fn find<T: Entity>(&self, id: &str) -> Result<Option<T>> {
        match self.backend.read_file(&Self::key(T::KIND, id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(StorageError::InvalidKey(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get<T: Entity>(&self, id: &str) -> Result<T> {
        self.find(id)?.ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })
    }

    pub fn put<T: Entity>(&self, entity: &T) -> Result<()> {
        let bytes = serde_json::to_vec(entity)?;
        self.backend
            .write_file(&Self::key(T::KIND, entity.id()), &bytes)?;
        Ok(())
    }

    pub fn delete<T: Entity>(&self, id: &str) -> Result<()> {
        self.backend.remove(&Self::key(T::KIND, id))?;
        Ok(())
    }

    /// 列出某種實體的所有紀錄。
    pub fn list<T: Entity>(&self) -> Result<Vec<T>> {
        let prefix = format!("{}/", T::KIND);
        let mut out = Vec::new();
        for key in self.backend.list(&prefix)? {
            match self.backend.read_file(&key) {
                Ok(bytes) => out.push(serde_json::from_slice(&bytes)?),
                // 列舉與讀取之間被刪除
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    /// 讀取次要索引，例如 thumbprint → 帳戶 id。
    pub fn index_get(&self, index: &str, key: &str) -> Result<Option<String>> {
        match self.backend.read_file(&format!("index/{}/{}", index, key)) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn index_put(&self, index: &str, key: &str, value: &str) -> Result<()> {
        self.backend
            .write_file(&format!("index/{}/{}", index, key), value.as_bytes())?;
        Ok(())
    }

    pub fn index_remove(&self, index: &str, key: &str) -> Result<()> {
        self.backend.remove(&format!("index/{}/{}", index, key))?;
        Ok(())
    }

    /// 在持有 `kind/id` 實體鎖的情況下執行 `f`。
    ///
    /// 同一實體上的呼叫彼此序列化，不同實體互不影響。
    pub fn with_lock<R>(&self, kind: &str, id: &str, f: impl FnOnce() -> R) -> Result<R> {
        self.locks.with_lock(&Self::key(kind, id), f)
    }
}

/// 依 key 動態配置的互斥鎖表；無人使用的鎖會被回收。
#[derive(Debug, Default)]
struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> Result<R> {
        let entry = {
            let mut locks = self.locks.lock().map_err(|_| StoreError::LockPoisoned)?;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = entry.lock().map_err(|_| StoreError::LockPoisoned)?;
            f()
        };

        let mut locks = self.locks.lock().map_err(|_| StoreError::LockPoisoned)?;
        // 表中一份、此處一份：沒有其他等待者
        if Arc::strong_count(&entry) == 2 {
            locks.remove(key);
        }
        Ok(result)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::{sync::atomic::{AtomicUsize, Ordering}, thread, time::Duration};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        size: u32,
    }

    impl Entity for Widget {
        const KIND: &'static str = "widgets";

        fn id(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn test_put_get_list() -> Result<()> {
        let store = Store::memory();
        store.put(&Widget { id: "a".into(), size: 1 })?;
        store.put(&Widget { id: "b".into(), size: 2 })?;

        assert_eq!(store.get::<Widget>("a")?.size, 1);
        assert!(store.find::<Widget>("missing")?.is_none());
        assert!(matches!(
            store.get::<Widget>("missing"),
            Err(StoreError::NotFound { kind: "widgets", .. })
        ));
        // 來自使用者的 id 可能含有非法字元，視為不存在
        assert!(store.find::<Widget>("../etc").unwrap().is_none());
        assert_eq!(store.list::<Widget>()?.len(), 2);

        store.delete::<Widget>("a")?;
        assert_eq!(store.list::<Widget>()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_index() -> Result<()> {
        let store = Store::memory();
        store.index_put("thumbprint", "tp1", "acct-1")?;
        assert_eq!(store.index_get("thumbprint", "tp1")?, Some("acct-1".into()));
        store.index_remove("thumbprint", "tp1")?;
        assert_eq!(store.index_get("thumbprint", "tp1")?, None);
        Ok(())
    }

    #[test]
    fn test_entity_lock_serializes_same_key() {
        let store = Arc::new(Store::memory());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let active = active.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    store
                        .with_lock("orders", "o1", || {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(5));
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.locks.len(), 0);
    }
}
