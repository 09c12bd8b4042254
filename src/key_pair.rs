use openssl::{
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
};
use thiserror::Error;

/// 金鑰相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 支援的金鑰演算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA，搭配 RS256 簽章。
    Rsa,
    /// NIST P-256，搭配 ES256 簽章。
    EcP256,
}

impl KeyAlgorithm {
    /// 不分大小寫解析演算法名稱，接受金鑰名稱或 JWS `alg` 名稱。
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_uppercase().as_str() {
            "RSA" | "RS256" => Ok(Self::Rsa),
            "EC" | "ECDSA" | "ES256" | "P-256" => Ok(Self::EcP256),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// 對應的 JWS `alg` 名稱。
    pub fn jws_alg(&self) -> &'static str {
        match self {
            Self::Rsa => "RS256",
            Self::EcP256 => "ES256",
        }
    }
}

/// 一組非對稱金鑰對。
///
/// 伺服器端用於本機 CA 的簽發金鑰；測試中則扮演 ACME 用戶端的帳戶金鑰與憑證金鑰。
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub alg: KeyAlgorithm,
    pub pri_key: PKey<Private>,
    pub pub_key: PKey<Public>,
}

impl KeyPair {
    /// 產生新的金鑰對。`bits` 僅對 RSA 有效，預設 2048。
    pub fn generate(alg: KeyAlgorithm, bits: Option<u32>) -> Result<Self> {
        let pri_key = match alg {
            KeyAlgorithm::Rsa => PKey::from_rsa(Rsa::generate(bits.unwrap_or(2048))?)?,
            KeyAlgorithm::EcP256 => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        let pub_key = Self::derive_public_key(&pri_key)?;
        Ok(Self {
            alg,
            pri_key,
            pub_key,
        })
    }

    /// 從 PEM 格式的私鑰建立金鑰對，演算法由金鑰內容判斷。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem)?;
        let alg = match pri_key.id() {
            Id::RSA => KeyAlgorithm::Rsa,
            Id::EC => KeyAlgorithm::EcP256,
            other => return Err(KeyError::UnsupportedAlgorithm(format!("{:?}", other))),
        };
        let pub_key = Self::derive_public_key(&pri_key)?;
        Ok(Self {
            alg,
            pri_key,
            pub_key,
        })
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 根據私鑰派生出公鑰。
    fn derive_public_key(pri_key: &PKey<Private>) -> Result<PKey<Public>> {
        let der = pri_key.public_key_to_der()?;
        Ok(PKey::public_key_from_der(&der)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(KeyAlgorithm::parse("rsa").unwrap(), KeyAlgorithm::Rsa);
        assert_eq!(KeyAlgorithm::parse("ES256").unwrap(), KeyAlgorithm::EcP256);
        assert!(KeyAlgorithm::parse("ed25519").is_err());
    }

    #[test]
    fn test_pem_round_trip_keeps_algorithm() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let restored = KeyPair::from_pem(&key.to_pem().unwrap()).unwrap();
        assert_eq!(restored.alg, KeyAlgorithm::EcP256);
        assert_eq!(
            restored.pub_key.public_key_to_der().unwrap(),
            key.pub_key.public_key_to_der().unwrap()
        );
    }
}
