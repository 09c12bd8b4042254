use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    nid::Nid,
    pkey::{Id, PKey, Public},
    rsa::Rsa,
    sha::sha256,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{base64::Base64, key_pair::KeyPair};

/// JWK 相關操作的錯誤類型。
#[derive(Debug, Error)]
pub enum JwkError {
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),
    #[error("Failed to convert key: {0}")]
    KeyConversionError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<openssl::error::ErrorStack> for JwkError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        JwkError::KeyConversionError(e.to_string())
    }
}

/// 用戶端提交的 JSON Web Key（僅公開參數）。
///
/// 目前接受 RSA 與 P-256 橢圓曲線金鑰，對應 RS256 與 ES256。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    #[serde(rename = "EC")]
    Ec(EcJwk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    n: String,
    e: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    crv: String,
    x: String,
    y: String,
}

fn decode_param(value: &str, name: &str) -> Result<Vec<u8>, JwkError> {
    Base64::from_url(value)
        .map(Base64::into_bytes)
        .map_err(|e| JwkError::KeyConversionError(format!("{}: {}", name, e)))
}

impl Jwk {
    /// 由金鑰對產生 JWK。
    pub fn from_key_pair(key_pair: &KeyPair) -> Result<Self, JwkError> {
        Self::from_public_key(&key_pair.pub_key)
    }

    pub fn from_public_key(key: &PKey<Public>) -> Result<Self, JwkError> {
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa()?;
                Ok(Jwk::Rsa(RsaJwk {
                    n: Base64::new(rsa.n().to_vec()).base64_url(),
                    e: Base64::new(rsa.e().to_vec()).base64_url(),
                }))
            }
            Id::EC => {
                let ec = key.ec_key()?;
                let group = ec.group();
                if group.curve_name() != Some(Nid::X9_62_PRIME256V1) {
                    return Err(JwkError::UnsupportedCurve(format!("{:?}", group.curve_name())));
                }
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates(group, &mut x, &mut y, &mut ctx)?;
                Ok(Jwk::Ec(EcJwk {
                    crv: "P-256".to_string(),
                    x: Base64::new(x.to_vec_padded(32)?).base64_url(),
                    y: Base64::new(y.to_vec_padded(32)?).base64_url(),
                }))
            }
            other => Err(JwkError::UnsupportedKeyType(format!("{:?}", other))),
        }
    }

    /// 轉換為 OpenSSL 公鑰以驗證簽章。
    pub fn to_public_key(&self) -> Result<PKey<Public>, JwkError> {
        match self {
            Jwk::Rsa(jwk) => {
                let n = BigNum::from_slice(&decode_param(&jwk.n, "n")?)?;
                let e = BigNum::from_slice(&decode_param(&jwk.e, "e")?)?;
                if n.num_bits() < 2048 {
                    return Err(JwkError::KeyConversionError(format!(
                        "RSA modulus too small: {} bits",
                        n.num_bits()
                    )));
                }
                Ok(PKey::from_rsa(Rsa::from_public_components(n, e)?)?)
            }
            Jwk::Ec(jwk) => {
                if jwk.crv != "P-256" {
                    return Err(JwkError::UnsupportedCurve(jwk.crv.clone()));
                }
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                let x = BigNum::from_slice(&decode_param(&jwk.x, "x")?)?;
                let y = BigNum::from_slice(&decode_param(&jwk.y, "y")?)?;
                let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y)?;
                ec.check_key()?;
                Ok(PKey::from_ec_key(ec)?)
            }
        }
    }

    /// 依 RFC 7638 產生只含必要成員、依字典序排列的 JSON。
    pub fn to_acme_json(&self) -> Result<String, JwkError> {
        let mut map = Map::new();
        match self {
            Jwk::Rsa(jwk) => {
                map.insert("e".to_string(), Value::String(jwk.e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(jwk.n.clone()));
            }
            Jwk::Ec(jwk) => {
                map.insert("crv".to_string(), Value::String(jwk.crv.clone()));
                map.insert("kty".to_string(), Value::String("EC".to_string()));
                map.insert("x".to_string(), Value::String(jwk.x.clone()));
                map.insert("y".to_string(), Value::String(jwk.y.clone()));
            }
        }
        serde_json::to_string(&Value::Object(map)).map_err(JwkError::from)
    }

    /// 計算 JWK thumbprint（SHA-256，URL 安全 Base64），作為帳戶的唯一識別。
    pub fn thumbprint(&self) -> Result<String, JwkError> {
        let hash = sha256(self.to_acme_json()?.as_bytes());
        Ok(Base64::new(hash).base64_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair::KeyAlgorithm;

    #[test]
    fn test_rfc7638_thumbprint_vector() {
        // RFC 7638 §3.1 的範例金鑰
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "RSA",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB",
            "alg": "RS256",
            "kid": "2011-04-29"
        }))
        .unwrap();
        assert_eq!(
            jwk.thumbprint().unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn test_ec_round_trip_to_openssl() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let jwk = Jwk::from_key_pair(&key).unwrap();
        let pkey = jwk.to_public_key().unwrap();
        assert!(pkey.public_eq(&key.pub_key));
        assert!(jwk.to_acme_json().unwrap().starts_with("{\"crv\":\"P-256\",\"kty\":\"EC\""));
    }

    #[test]
    fn test_small_rsa_key_rejected() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, Some(1024)).unwrap();
        let jwk = Jwk::from_key_pair(&key).unwrap();
        assert!(matches!(
            jwk.to_public_key(),
            Err(JwkError::KeyConversionError(_))
        ));
    }

    #[test]
    fn test_unknown_kty_rejected() {
        let result: Result<Jwk, _> =
            serde_json::from_value(serde_json::json!({"kty": "OKP", "crv": "Ed25519", "x": "AA"}));
        assert!(result.is_err());
    }
}
