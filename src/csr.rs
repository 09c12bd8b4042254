use std::{collections::BTreeSet, result};

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

use crate::{error::AcmeError, key_pair::KeyPair};

/// 建立或解析 CSR（證書簽名請求）時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
    #[error("Malformed CSR: {0}")]
    Malformed(String),
    #[error("CSR signature does not verify")]
    BadSignature,
    #[error("CSR names no identifiers")]
    NoIdentifiers,
}

impl From<CsrError> for AcmeError {
    fn from(e: CsrError) -> Self {
        AcmeError::BadCsr(e.to_string())
    }
}

type Result<T> = result::Result<T, CsrError>;

/// CSR 建構器，產生包含 SAN 擴展的證書簽名請求。
///
/// 伺服器本身不需要產生 CSR；此建構器供本機 CA 測試與開發工具使用。
pub struct CSR {
    common_name: Option<String>,
    san_entries: Vec<String>,
}

impl CSR {
    pub fn new() -> Self {
        CSR {
            common_name: None,
            san_entries: Vec::new(),
        }
    }

    /// 新增一個 DNS SAN。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    pub fn set_common_name(mut self, cn: &str) -> Self {
        self.common_name = Some(cn.to_string());
        self
    }

    /// 以金鑰對簽署並回傳 DER 編碼的 CSR。
    pub fn build(self, key_pair: &KeyPair) -> Result<Vec<u8>> {
        let mut req_builder = X509Req::builder()?;

        if self.san_entries.is_empty() {
            return Err(CsrError::NoSanEntries);
        }

        if let Some(cn) = &self.common_name {
            let mut name = X509NameBuilder::new()?;
            name.append_entry_by_text("CN", cn)?;
            req_builder.set_subject_name(&name.build())?;
        }

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build().to_der()?)
    }
}

impl Default for CSR {
    fn default() -> Self {
        Self::new()
    }
}

/// 已驗證簽章的 CSR 內容。
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    pub der: Vec<u8>,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
}

impl ParsedCsr {
    /// 解析 DER 編碼的 CSR 並驗證其自簽章。
    pub fn parse(der: &[u8]) -> Result<Self> {
        let req = X509Req::from_der(der)?;
        let public_key = req.public_key()?;
        if !req.verify(&public_key)? {
            return Err(CsrError::BadSignature);
        }

        let (rest, parsed) = X509CertificationRequest::from_der(der)
            .map_err(|e| CsrError::Malformed(e.to_string()))?;
        if !rest.is_empty() {
            return Err(CsrError::Malformed("trailing data after CSR".to_string()));
        }

        let common_name = parsed
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .map(|cn| {
                cn.as_str()
                    .map(str::to_string)
                    .map_err(|e| CsrError::Malformed(e.to_string()))
            })
            .transpose()?;

        let mut dns_names = Vec::new();
        if let Some(extensions) = parsed.requested_extensions() {
            for ext in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = ext {
                    for name in &san.general_names {
                        match name {
                            GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                            other => {
                                return Err(CsrError::Malformed(format!(
                                    "unsupported subject alternative name: {:?}",
                                    other
                                )))
                            }
                        }
                    }
                }
            }
        }

        let parsed = ParsedCsr {
            der: der.to_vec(),
            common_name,
            dns_names,
        };
        if parsed.identifiers().is_empty() {
            return Err(CsrError::NoIdentifiers);
        }
        Ok(parsed)
    }

    /// CSR 所要求的名稱集合：SAN dNSName 與主體 CN 的聯集，統一為小寫。
    pub fn identifiers(&self) -> BTreeSet<String> {
        self.dns_names
            .iter()
            .chain(self.common_name.iter())
            .map(|name| name.to_ascii_lowercase())
            .collect()
    }

    /// 與訂單識別碼集合比較（不分大小寫，視為集合）。
    pub fn matches<'a>(&self, order_identifiers: impl IntoIterator<Item = &'a str>) -> bool {
        let expected: BTreeSet<String> = order_identifiers
            .into_iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        self.identifiers() == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair::KeyAlgorithm;

    #[test]
    fn test_build_and_parse() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let der = CSR::new()
            .set_common_name("Example.com")
            .set_san("example.com")
            .set_san("WWW.example.com")
            .build(&key)
            .unwrap();

        let parsed = ParsedCsr::parse(&der).unwrap();
        assert_eq!(parsed.common_name.as_deref(), Some("Example.com"));
        assert_eq!(parsed.dns_names.len(), 2);
        assert!(parsed.matches(["www.example.com", "EXAMPLE.COM"]));
        assert!(!parsed.matches(["example.com"]));
        assert!(!parsed.matches(["example.com", "www.example.com", "api.example.com"]));
    }

    #[test]
    fn test_cn_outside_san_counts() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, None).unwrap();
        let der = CSR::new()
            .set_common_name("other.example.com")
            .set_san("example.com")
            .build(&key)
            .unwrap();
        let parsed = ParsedCsr::parse(&der).unwrap();
        assert!(!parsed.matches(["example.com"]));
        assert!(parsed.matches(["example.com", "other.example.com"]));
    }

    #[test]
    fn test_tampered_csr_rejected() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let mut der = CSR::new().set_san("example.com").build(&key).unwrap();
        let pos = der
            .windows(b"example.com".len())
            .position(|w| w == b"example.com")
            .unwrap();
        der[pos] = b'f';
        assert!(ParsedCsr::parse(&der).is_err());
        assert!(ParsedCsr::parse(b"not a csr").is_err());
    }

    #[test]
    fn test_build_requires_san() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        assert!(matches!(CSR::new().build(&key), Err(CsrError::NoSanEntries)));
    }
}
