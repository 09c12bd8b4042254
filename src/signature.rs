use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    pkey::{PKey, Private, Public},
    sign::{Signer, Verifier},
};
use thiserror::Error;

use crate::key_pair::KeyAlgorithm;

/// 簽章與驗章操作可能遇到的錯誤類型。
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Signing error: {0}")]
    SigningError(String),
    #[error("Verification error: {0}")]
    VerificationError(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl From<openssl::error::ErrorStack> for SignatureError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SignatureError::VerificationError(e.to_string())
    }
}

type Result<T> = std::result::Result<T, SignatureError>;

/// P-256 座標長度（位元組）。
const ES256_COORD_LEN: usize = 32;

/// 簽章演算法的介面。
trait SignatureAlgorithmT {
    /// 以私鑰簽署資料，回傳 JWS 格式的簽章位元組。
    fn sign(&self, data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>>;

    /// 以公鑰驗證 JWS 格式的簽章。簽章不符時回傳 `Ok(false)`。
    fn verify(&self, data: &[u8], signature: &[u8], key: &PKey<Public>) -> Result<bool>;
}

/// RS256：RSASSA-PKCS1-v1_5 搭配 SHA-256。
struct RSASignature;

impl SignatureAlgorithmT for RSASignature {
    fn sign(&self, data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)
            .map_err(|e| SignatureError::SigningError(e.to_string()))?;
        signer
            .update(data)
            .map_err(|e| SignatureError::SigningError(e.to_string()))?;
        signer
            .sign_to_vec()
            .map_err(|e| SignatureError::SigningError(e.to_string()))
    }

    fn verify(&self, data: &[u8], signature: &[u8], key: &PKey<Public>) -> Result<bool> {
        if key.rsa().is_err() {
            return Err(SignatureError::VerificationError(
                "RS256 requires an RSA key".to_string(),
            ));
        }
        let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
        verifier.update(data)?;
        // 格式錯誤的簽章在 OpenSSL 中是錯誤而非 false
        Ok(verifier.verify(signature).unwrap_or(false))
    }
}

/// ES256：ECDSA P-256 搭配 SHA-256。
///
/// JWS 使用固定長度的 `r || s`，OpenSSL 則使用 DER，兩者在此轉換。
struct ES256Signature;

impl SignatureAlgorithmT for ES256Signature {
    fn sign(&self, data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)
            .map_err(|e| SignatureError::SigningError(e.to_string()))?;
        signer
            .update(data)
            .map_err(|e| SignatureError::SigningError(e.to_string()))?;
        let der = signer
            .sign_to_vec()
            .map_err(|e| SignatureError::SigningError(e.to_string()))?;

        let sig = EcdsaSig::from_der(&der)
            .map_err(|e| SignatureError::SigningError(e.to_string()))?;
        let mut raw = sig
            .r()
            .to_vec_padded(ES256_COORD_LEN as i32)
            .map_err(|e| SignatureError::SigningError(e.to_string()))?;
        raw.extend(
            sig.s()
                .to_vec_padded(ES256_COORD_LEN as i32)
                .map_err(|e| SignatureError::SigningError(e.to_string()))?,
        );
        Ok(raw)
    }

    fn verify(&self, data: &[u8], signature: &[u8], key: &PKey<Public>) -> Result<bool> {
        if key.ec_key().is_err() {
            return Err(SignatureError::VerificationError(
                "ES256 requires an EC key".to_string(),
            ));
        }
        if signature.len() != ES256_COORD_LEN * 2 {
            return Ok(false);
        }
        let (r, s) = signature.split_at(ES256_COORD_LEN);
        let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
        let der = sig.to_der()?;

        let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
        verifier.update(data)?;
        Ok(verifier.verify(&der).unwrap_or(false))
    }
}

/// 簽章演算法工廠，依 JWS `alg` 名稱取得對應實作。
struct SignatureAlgorithmFactory;

impl SignatureAlgorithmFactory {
    fn get_algorithm(alg_name: &str) -> Result<Box<dyn SignatureAlgorithmT>> {
        match alg_name {
            "RS256" => Ok(Box::new(RSASignature)),
            "ES256" => Ok(Box::new(ES256Signature)),
            _ => Err(SignatureError::UnsupportedAlgorithm(alg_name.to_string())),
        }
    }
}

/// 伺服器接受的 JWS `alg` 值。
pub fn is_supported(alg_name: &str) -> bool {
    SignatureAlgorithmFactory::get_algorithm(alg_name).is_ok()
}

/// 以指定演算法簽署 `signing_input`。
pub fn create_signature(
    signing_input: &[u8],
    alg: KeyAlgorithm,
    key: &PKey<Private>,
) -> Result<Vec<u8>> {
    SignatureAlgorithmFactory::get_algorithm(alg.jws_alg())?.sign(signing_input, key)
}

/// 驗證 JWS 簽章；`alg_name` 為 protected header 中的 `alg`。
pub fn verify_signature(
    alg_name: &str,
    signing_input: &[u8],
    signature: &[u8],
    key: &PKey<Public>,
) -> Result<bool> {
    SignatureAlgorithmFactory::get_algorithm(alg_name)?.verify(signing_input, signature, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair::KeyPair;

    #[test]
    fn test_sign_and_verify_each_algorithm() {
        for alg in [KeyAlgorithm::Rsa, KeyAlgorithm::EcP256] {
            let key = KeyPair::generate(alg, None).unwrap();
            let sig = create_signature(b"header.payload", alg, &key.pri_key).unwrap();
            assert!(verify_signature(alg.jws_alg(), b"header.payload", &sig, &key.pub_key).unwrap());
            assert!(!verify_signature(alg.jws_alg(), b"header.other", &sig, &key.pub_key).unwrap());
        }
    }

    #[test]
    fn test_es256_signature_is_raw_r_s() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let sig = create_signature(b"data", KeyAlgorithm::EcP256, &key.pri_key).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(!verify_signature("ES256", b"data", &sig[..63], &key.pub_key).unwrap());
    }

    #[test]
    fn test_algorithm_key_mismatch() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let sig = create_signature(b"data", KeyAlgorithm::EcP256, &key.pri_key).unwrap();
        assert!(verify_signature("RS256", b"data", &sig, &key.pub_key).is_err());
        assert!(matches!(
            verify_signature("HS256", b"data", &sig, &key.pub_key),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));
        assert!(is_supported("ES256"));
        assert!(!is_supported("none"));
    }
}
