//! 此模組處理 ACME 請求所使用的 JSON Web Signature（flattened JSON 序列化），
//! 包含解析、protected header 檢查與簽章驗證。

use std::result;

use openssl::pkey::{PKey, Public};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    base64::{Base64, DecodeError},
    error::AcmeError,
    jwk::{Jwk, JwkError},
    key_pair::KeyPair,
    signature::{self, SignatureError},
};

/// 一個 flattened JSON 序列化的 JWS 物件。
///
/// 三個欄位皆為 URL 安全 Base64 字串；`payload` 為空字串代表 POST-as-GET。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Jws {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

/// JWS 處理過程中的錯誤。
#[derive(Error, Debug)]
pub enum JwsError {
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] DecodeError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid protected header: {0}")]
    InvalidHeader(String),
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] JwkError),
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("JWS signature does not verify")]
    BadSignature,
}

type Result<T> = result::Result<T, JwsError>;

impl From<JwsError> for AcmeError {
    fn from(e: JwsError) -> Self {
        match e {
            JwsError::UnsupportedAlgorithm(alg) => AcmeError::BadSignatureAlgorithm(alg),
            JwsError::BadSignature => AcmeError::Unauthorized(e.to_string()),
            other => AcmeError::BadRequest(other.to_string()),
        }
    }
}

/// JWS protected header 中 ACME 使用的欄位。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// 請求者以何種方式指明簽署金鑰。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef<'a> {
    /// 內嵌 JWK（new-account 與 key-change 內層）。
    Jwk(&'a Jwk),
    /// 帳戶 URL。
    Kid(&'a str),
}

impl ProtectedHeader {
    /// 檢查 `jwk` 與 `kid` 恰好只出現一個，並回傳金鑰來源。
    pub fn key_ref(&self) -> Result<KeyRef<'_>> {
        match (&self.jwk, &self.kid) {
            (Some(jwk), None) => Ok(KeyRef::Jwk(jwk)),
            (None, Some(kid)) => Ok(KeyRef::Kid(kid)),
            (Some(_), Some(_)) => Err(JwsError::InvalidHeader(
                "jwk and kid are mutually exclusive".to_string(),
            )),
            (None, None) => Err(JwsError::InvalidHeader(
                "either jwk or kid is required".to_string(),
            )),
        }
    }
}

impl Jws {
    /// 解析請求主體。
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 解碼並檢查 protected header，`alg` 必須是伺服器支援的演算法。
    pub fn header(&self) -> Result<ProtectedHeader> {
        let raw = Base64::from_url(&self.header)?;
        let header: ProtectedHeader = serde_json::from_slice(raw.as_bytes())?;
        if !signature::is_supported(&header.alg) {
            return Err(JwsError::UnsupportedAlgorithm(header.alg));
        }
        header.key_ref()?;
        Ok(header)
    }

    /// 解碼 payload；POST-as-GET 時為空。
    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(Base64::from_url(&self.payload)?.into_bytes())
    }

    pub fn is_post_as_get(&self) -> bool {
        self.payload.is_empty()
    }

    fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }

    /// 以給定公鑰驗證簽章。
    pub fn verify(&self, alg: &str, key: &PKey<Public>) -> Result<()> {
        let sig = Base64::from_url(&self.signature)?;
        if signature::verify_signature(alg, self.signing_input().as_bytes(), sig.as_bytes(), key)? {
            Ok(())
        } else {
            Err(JwsError::BadSignature)
        }
    }

    /// 以 header 內嵌的 JWK 驗證簽章，回傳該 JWK。
    pub fn verify_embedded(&self, header: &ProtectedHeader) -> Result<Jwk> {
        match header.key_ref()? {
            KeyRef::Jwk(jwk) => {
                self.verify(&header.alg, &jwk.to_public_key()?)?;
                Ok(jwk.clone())
            }
            KeyRef::Kid(_) => Err(JwsError::InvalidHeader(
                "this request must carry an embedded jwk".to_string(),
            )),
        }
    }

    /// 以金鑰對簽署 payload，產生 JWS。伺服器只在測試與工具中使用此方向。
    pub fn sign(header: &ProtectedHeader, payload: &[u8], key_pair: &KeyPair) -> Result<Self> {
        let header_b64 = Base64::new(serde_json::to_vec(header)?).base64_url();
        let payload_b64 = if payload.is_empty() {
            String::new()
        } else {
            Base64::new(payload).base64_url()
        };
        let input = format!("{}.{}", header_b64, payload_b64);
        let sig = signature::create_signature(input.as_bytes(), key_pair.alg, &key_pair.pri_key)?;
        Ok(Jws {
            header: header_b64,
            payload: payload_b64,
            signature: Base64::new(sig).base64_url(),
        })
    }
}
