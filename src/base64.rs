use ::base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use thiserror::Error;

/// Base64 解碼失敗時回傳的錯誤。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// 輸入不是合法的 Base64 字串。
    #[error("Invalid base64 input: {0}")]
    Invalid(String),
}

impl From<::base64::DecodeError> for DecodeError {
    fn from(e: ::base64::DecodeError) -> Self {
        DecodeError::Invalid(e.to_string())
    }
}

/// 封裝一段原始位元組，並提供 ACME/JOSE 所需的 Base64 表示法。
///
/// JOSE 只使用不含填充的 URL 安全字元集；EJBCA 的 SOAP 介面則使用標準字元集，
/// 兩者都由此型別提供。
///
/// # 範例
///
/// ```
/// use serles::base64::Base64;
///
/// let b64 = Base64::new("Hello, World!");
/// assert_eq!(b64.as_standard(), "SGVsbG8sIFdvcmxkIQ==");
/// assert_eq!(b64.base64_url(), "SGVsbG8sIFdvcmxkIQ");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64 {
    bytes: Vec<u8>,
}

impl Base64 {
    /// 以任何可轉為位元組切片的資料建立實例。
    pub fn new<T: AsRef<[u8]>>(input: T) -> Self {
        Self {
            bytes: input.as_ref().to_vec(),
        }
    }

    /// 解析 URL 安全（不含填充）的 Base64 字串。
    ///
    /// JOSE 規範禁止填充，因此帶有 `=` 的輸入會被拒絕。
    pub fn from_url(url_encoded: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            bytes: URL_SAFE_NO_PAD.decode(url_encoded)?,
        })
    }

    /// 解析標準字元集的 Base64 字串，允許夾帶空白與換行（SOAP 回應常見）。
    pub fn from_standard(encoded: &str) -> Result<Self, DecodeError> {
        let compact: String = encoded.split_whitespace().collect();
        Ok(Self {
            bytes: STANDARD.decode(compact)?,
        })
    }

    /// 回傳 URL 安全且不含填充的編碼字串。
    pub fn base64_url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.bytes)
    }

    /// 回傳標準字元集（含填充）的編碼字串。
    pub fn as_standard(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// 產生指定長度的隨機位元組，並以 URL 安全 Base64 回傳（nonce 與挑戰 token 使用）。
pub fn random_url_token(len: usize) -> Result<String, openssl::error::ErrorStack> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf)?;
    Ok(Base64::new(buf).base64_url())
}
