use chrono::{DateTime, TimeZone, Utc};
use openssl::{asn1::Asn1Time, x509::X509};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Entity;

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    #[error("Empty certificate chain")]
    EmptyChain,
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

type Result<T> = std::result::Result<T, CertificateError>;

/// 已簽發的證書。建立後不再變動。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    pub id: String,
    pub order_id: String,
    /// 十六進位序號。
    pub serial: String,
    /// 終端證書在前的 PEM 證書鏈。
    pub pem: String,
    pub issued_at: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// CA 端的識別（例如 EJBCA 使用者名稱或本機 CA 名稱）。
    pub ca_reference: String,
}

impl Entity for Certificate {
    const KIND: &'static str = "certificates";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Certificate {
    /// 由 CA 回傳的 PEM 證書鏈建立紀錄，序號與到期時間取自第一張證書。
    pub fn from_pem_chain(
        id: impl Into<String>,
        order_id: impl Into<String>,
        pem: &str,
        ca_reference: impl Into<String>,
    ) -> Result<Self> {
        let chain = X509::stack_from_pem(pem.as_bytes())?;
        let leaf = chain.first().ok_or(CertificateError::EmptyChain)?;
        let serial = leaf.serial_number().to_bn()?.to_hex_str()?.to_string();

        Ok(Certificate {
            id: id.into(),
            order_id: order_id.into(),
            serial,
            pem: pem.to_string(),
            issued_at: Utc::now(),
            not_after: asn1_to_utc(leaf.not_after())?,
            ca_reference: ca_reference.into(),
        })
    }
}

fn asn1_to_utc(time: &openssl::asn1::Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = diff.days as i64 * 86400 + diff.secs as i64;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(CertificateError::InvalidTimestamp)
}
