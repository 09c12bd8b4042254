use std::{
    collections::HashMap,
    sync::RwLock,
};

use log::info;
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    x509::{
        extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName},
        X509Builder, X509NameBuilder, X509Req, X509,
    },
};
use thiserror::Error;

use crate::{
    ca::{BackendError, CaBackend, IssuanceRequest, IssuedCertificate, PollOutcome},
    csr::ParsedCsr,
    key_pair::{KeyAlgorithm, KeyPair},
};

#[derive(Debug, Error)]
pub enum LocalCaError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("Key error: {0}")]
    Key(#[from] crate::key_pair::KeyError),
    #[error("Invalid CSR: {0}")]
    Csr(#[from] crate::csr::CsrError),
}

type Result<T> = std::result::Result<T, LocalCaError>;

/// 行程內的 OpenSSL CA，以自有金鑰直接簽署 CSR。
///
/// 用於開發部署與測試，取代遠端的 EJBCA。
#[derive(Debug)]
pub struct LocalCa {
    name: String,
    key: KeyPair,
    cert: X509,
    validity_days: u32,
    issued: RwLock<HashMap<String, IssuedCertificate>>,
}

fn random_serial() -> Result<BigNum> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

impl LocalCa {
    /// 產生自簽根證書，`validity_days` 為簽出證書的效期。
    pub fn generate(name: &str, validity_days: u32) -> Result<Self> {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None)?;

        let mut subject = X509NameBuilder::new()?;
        subject.append_entry_by_text("CN", name)?;
        let subject = subject.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(random_serial()?.to_asn1_integer()?.as_ref())?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(&subject)?;
        builder.set_pubkey(&key.pri_key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(3650)?.as_ref())?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        builder.sign(&key.pri_key, MessageDigest::sha256())?;

        info!("Generated local CA \"{}\"", name);
        Ok(Self {
            name: name.to_string(),
            key,
            cert: builder.build(),
            validity_days,
            issued: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_pem(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.cert.to_pem()?).into_owned())
    }

    /// 簽署 DER 編碼的 CSR，回傳終端證書加上根證書的 PEM 鏈。
    pub fn sign(&self, csr_der: &[u8]) -> Result<String> {
        let parsed = ParsedCsr::parse(csr_der)?;
        let req = X509Req::from_der(csr_der)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(random_serial()?.to_asn1_integer()?.as_ref())?;
        builder.set_subject_name(req.subject_name())?;
        builder.set_issuer_name(self.cert.subject_name())?;
        let req_key = req.public_key()?;
        builder.set_pubkey(&req_key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(self.validity_days)?.as_ref())?;

        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let mut san = SubjectAlternativeName::new();
        for name in parsed.identifiers() {
            san.dns(&name);
        }
        let san = san.build(&builder.x509v3_context(Some(&*self.cert), None))?;
        builder.append_extension(san)?;

        builder.sign(&self.key.pri_key, MessageDigest::sha256())?;
        let leaf = builder.build();

        let mut pem = String::new();
        for cert in [&leaf, &self.cert] {
            pem.push_str(&String::from_utf8_lossy(&cert.to_pem()?));
        }
        Ok(pem)
    }
}

impl CaBackend for LocalCa {
    fn submit(&self, request: &IssuanceRequest) -> std::result::Result<IssuedCertificate, BackendError> {
        let pem_chain = self.sign(&request.csr_der).map_err(|e| match e {
            LocalCaError::Csr(e) => BackendError::Rejected(e.to_string()),
            other => BackendError::Transient(other.to_string()),
        })?;
        let issued = IssuedCertificate {
            pem_chain,
            ca_reference: self.name.clone(),
        };
        self.issued
            .write()
            .map_err(|_| BackendError::Transient("issued map poisoned".to_string()))?
            .insert(request.request_id.clone(), issued.clone());
        Ok(issued)
    }

    fn poll(&self, request_id: &str) -> std::result::Result<PollOutcome, BackendError> {
        let issued = self
            .issued
            .read()
            .map_err(|_| BackendError::Transient("issued map poisoned".to_string()))?;
        Ok(match issued.get(request_id) {
            Some(cert) => PollOutcome::Issued(cert.clone()),
            None => PollOutcome::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::CSR;

    #[test]
    fn test_signed_certificate_carries_csr_names() {
        let ca = LocalCa::generate("Test CA", 10).unwrap();
        let key = KeyPair::generate(KeyAlgorithm::Rsa, None).unwrap();
        let csr = CSR::new()
            .set_san("example.com")
            .set_san("www.example.com")
            .build(&key)
            .unwrap();

        let pem = ca.sign(&csr).unwrap();
        let chain = X509::stack_from_pem(pem.as_bytes()).unwrap();
        assert_eq!(chain.len(), 2);
        let ca_key = chain[1].public_key().unwrap();
        assert!(chain[0].verify(&ca_key).unwrap());
        assert_eq!(
            String::from_utf8(chain[1].to_pem().unwrap()).unwrap(),
            ca.root_pem().unwrap()
        );

        let names: Vec<String> = chain[0]
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_backend_records_for_poll() {
        let ca = LocalCa::generate("Test CA", 10).unwrap();
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let request = IssuanceRequest {
            request_id: "o1".to_string(),
            csr_der: CSR::new().set_san("example.com").build(&key).unwrap(),
            identifiers: vec!["example.com".to_string()],
        };
        assert_eq!(ca.poll("o1").unwrap(), PollOutcome::Unknown);
        let issued = ca.submit(&request).unwrap();
        assert_eq!(ca.poll("o1").unwrap(), PollOutcome::Issued(issued));

        let bad = IssuanceRequest {
            csr_der: b"garbage".to_vec(),
            ..request
        };
        assert!(matches!(ca.submit(&bad), Err(BackendError::Rejected(_))));
    }
}
