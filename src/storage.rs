use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use log::{debug, info};
use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error("File is corrupted at offset {0}")]
    CorruptedFile(u64),
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 位元組層級的鍵值儲存介面。
///
/// key 以 `/` 分段，例如 `orders/<id>`；上層的 [`crate::store::Store`]
/// 負責序列化與實體鎖，此介面只需保證單一操作的原子性。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 的內容。
    fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 寫入（或覆寫）指定 key 的內容。
    fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 刪除指定 key；不存在時不視為錯誤。
    fn remove(&self, key: &str) -> Result<()>;

    /// 檢查 key 是否存在。
    fn exists(&self, key: &str) -> Result<bool>;

    /// 列出所有以 `prefix` 開頭的 key，依字典序排列。
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// 私有工具，負責 key 的格式驗證。
struct KeyUtils;

impl KeyUtils {
    fn verify(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        if key.starts_with('/') || key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "Key cannot start or end with '/': {}",
                key
            )));
        }
        if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(StorageError::InvalidKey(format!(
                "Invalid path segment in key: {}",
                key
            )));
        }
        Ok(())
    }
}

/// 基於記憶體的儲存實作，程序結束後資料即消失。
#[derive(Debug, Default)]
pub struct MemStorage {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        KeyUtils::verify(key)?;
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        data.get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        KeyUtils::verify(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        KeyUtils::verify(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        KeyUtils::verify(key)?;
        Ok(self
            .data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// 以單一附加式（append-only）檔案保存資料的儲存實作。
///
/// 每筆紀錄的格式為：
///
/// ```text
/// [key_len: u32 LE][flags: u8][value_len: u32 LE][key][value]
/// ```
///
/// `flags` 的第 0 位元表示刪除標記（tombstone）。開啟時重播整個檔案以重建索引。
/// 失效紀錄不少於有效紀錄時壓縮檔案：開啟時一律檢查，執行期間則在失效紀錄累積到
/// [`COMPACT_MIN_DEAD`] 筆以上才檢查。
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    file: File,
    index: BTreeMap<String, EntryLocation>,
    dead_records: usize,
}

/// 索引中保存的 value 位置。
#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    value_offset: u64,
    value_len: u32,
}

const HEADER_LEN: u64 = 9;
const FLAG_DELETED: u8 = 1;
/// 執行期間觸發壓縮所需的最少失效紀錄數。
pub const COMPACT_MIN_DEAD: usize = 1024;

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open_file(&path, false)?;
        let (index, dead_records, valid_len) = Self::build_index(&file)?;

        // 截斷寫到一半的尾端紀錄，避免之後的附加內容無法解析
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }

        let storage = Self {
            path,
            inner: Mutex::new(FileInner {
                file,
                index,
                dead_records,
            }),
        };

        let needs_compaction = {
            let inner = storage.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
            inner.dead_records > 0 && inner.dead_records >= inner.index.len()
        };
        if needs_compaction {
            storage.compact()?;
        }

        Ok(storage)
    }

    fn open_file(path: &Path, truncate: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        Ok(options.open(path)?)
    }

    /// 重播檔案並回傳（索引, 失效紀錄數, 有效內容長度）。
    fn build_index(file: &File) -> Result<(BTreeMap<String, EntryLocation>, usize, u64)> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;
        let mut index = BTreeMap::new();
        let mut dead_records = 0usize;
        let mut offset = 0u64;

        loop {
            let mut header = [0u8; HEADER_LEN as usize];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let (key_len, flags, value_len) = Self::parse_header(&header);

            let mut key_buf = vec![0u8; key_len as usize];
            if let Err(e) = reader.read_exact(&mut key_buf) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(e.into());
            }
            let key = String::from_utf8(key_buf).map_err(|_| StorageError::CorruptedFile(offset))?;

            let value_offset = offset + HEADER_LEN + key_len as u64;
            let skipped = io::copy(&mut (&mut reader).take(value_len as u64), &mut io::sink())?;
            if skipped != value_len as u64 {
                break;
            }

            let replaced = if flags & FLAG_DELETED != 0 {
                dead_records += 1;
                index.remove(&key)
            } else {
                index.insert(
                    key,
                    EntryLocation {
                        value_offset,
                        value_len,
                    },
                )
            };
            if replaced.is_some() {
                dead_records += 1;
            }
            offset = value_offset + value_len as u64;
        }

        Ok((index, dead_records, offset))
    }

    fn parse_header(header: &[u8; HEADER_LEN as usize]) -> (u32, u8, u32) {
        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let flags = header[4];
        let value_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
        (key_len, flags, value_len)
    }

    fn create_header(key_len: u32, flags: u8, value_len: u32) -> [u8; HEADER_LEN as usize] {
        let mut header = [0u8; HEADER_LEN as usize];
        header[0..4].copy_from_slice(&key_len.to_le_bytes());
        header[4] = flags;
        header[5..9].copy_from_slice(&value_len.to_le_bytes());
        header
    }

    /// 在檔案尾端附加一筆紀錄，回傳 value 的位置。
    fn append(file: &mut File, key: &str, value: &[u8], flags: u8) -> Result<EntryLocation> {
        let end = file.seek(SeekFrom::End(0))?;
        let key_bytes = key.as_bytes();
        let value_len = u32::try_from(value.len())
            .map_err(|_| StorageError::InvalidKey(format!("Value too large for {}", key)))?;
        let mut record = Vec::with_capacity(HEADER_LEN as usize + key_bytes.len() + value.len());
        record.extend_from_slice(&Self::create_header(key_bytes.len() as u32, flags, value_len));
        record.extend_from_slice(key_bytes);
        record.extend_from_slice(value);
        file.write_all(&record)?;
        file.flush()?;
        Ok(EntryLocation {
            value_offset: end + HEADER_LEN + key_bytes.len() as u64,
            value_len,
        })
    }

    fn read_value(file: &mut File, location: EntryLocation) -> Result<Vec<u8>> {
        file.seek(SeekFrom::Start(location.value_offset))?;
        let mut data = vec![0u8; location.value_len as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// 將仍有效的紀錄寫入暫存檔後取代原檔案。
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        self.compact_locked(&mut inner)
    }

    /// 寫入或刪除後呼叫；失效紀錄過多時就地壓縮。
    fn maybe_compact(&self, inner: &mut FileInner) -> Result<()> {
        if inner.dead_records >= COMPACT_MIN_DEAD && inner.dead_records >= inner.index.len() {
            self.compact_locked(inner)?;
        }
        Ok(())
    }

    fn compact_locked(&self, inner: &mut FileInner) -> Result<()> {
        let temp_path = self.path.with_extension("compact");
        let mut temp_file = Self::open_file(&temp_path, true)?;

        let mut new_index = BTreeMap::new();
        let entries: Vec<(String, EntryLocation)> =
            inner.index.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (key, location) in entries {
            let value = Self::read_value(&mut inner.file, location)?;
            let new_location = Self::append(&mut temp_file, &key, &value, 0)?;
            new_index.insert(key, new_location);
        }
        temp_file.sync_all()?;
        std::fs::rename(&temp_path, &self.path)?;

        info!(
            "Compacted {} ({} dead records dropped)",
            self.path.display(),
            inner.dead_records
        );
        inner.file = Self::open_file(&self.path, false)?;
        inner.index = new_index;
        inner.dead_records = 0;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        KeyUtils::verify(key)?;
        // File 的 seek 與 read 需要可變引用，因此讀取也要取得互斥鎖
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let location = *inner
            .index
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Self::read_value(&mut inner.file, location)
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        KeyUtils::verify(key)?;
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let location = Self::append(&mut inner.file, key, value, 0)?;
        if inner.index.insert(key.to_string(), location).is_some() {
            inner.dead_records += 1;
        }
        self.maybe_compact(&mut inner)
    }

    fn remove(&self, key: &str) -> Result<()> {
        KeyUtils::verify(key)?;
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        if inner.index.remove(key).is_some() {
            Self::append(&mut inner.file, key, &[], FLAG_DELETED)?;
            inner.dead_records += 2;
            debug!("Removed {} from {}", key, self.path.display());
            self.maybe_compact(&mut inner)?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        KeyUtils::verify(key)?;
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner.index.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner
            .index
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// 依設定字串建立儲存後端：`memory` 或 `file:<path>`。
pub fn open_backend(backend: &str) -> Result<Box<dyn Storage>> {
    match backend.split_once(':') {
        Some(("file", path)) if !path.is_empty() => Ok(Box::new(FileStorage::open(path)?)),
        None if backend == "memory" => Ok(Box::new(MemStorage::new())),
        _ => Err(StorageError::InvalidKey(format!(
            "Unknown storage backend: {}",
            backend
        ))),
    }
}

/// 將儲存內容依前綴分組計數，用於啟動時的日誌摘要。
pub fn summarize(storage: &dyn Storage, prefixes: &[&str]) -> Result<HashMap<String, usize>> {
    let mut counts = HashMap::new();
    for prefix in prefixes {
        counts.insert(prefix.to_string(), storage.list(prefix)?.len());
    }
    Ok(counts)
}
