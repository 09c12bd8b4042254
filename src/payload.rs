use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{base64::Base64, error::AcmeError, jwk::Jwk};

/// 每張訂單允許的識別碼上限。
pub const MAX_IDENTIFIERS: usize = 100;

/// 所有請求載荷（JWS payload）必須實作的功能。
///
/// 伺服器端以 [`PayloadT::from_jws_payload`] 反序列化並立即驗證；
/// 驗證失敗一律視為 `malformed`。
pub trait PayloadT: Serialize + DeserializeOwned {
    /// 解析 JWS payload 並執行 [`PayloadT::validate`]。
    fn from_jws_payload(bytes: &[u8]) -> Result<Self, AcmeError> {
        let payload: Self = serde_json::from_slice(bytes)
            .map_err(|e| AcmeError::BadRequest(format!("invalid payload: {}", e)))?;
        payload.validate()?;
        Ok(payload)
    }

    /// 將載荷轉換成 JSON 格式的字串。
    fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 檢查載荷內容是否合法。
    fn validate(&self) -> Result<(), AcmeError>;
}

/// newAccount 請求。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountPayload {
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    #[serde(default)]
    pub only_return_existing: bool,
}

impl NewAccountPayload {
    /// 建立帶有單一聯絡信箱的請求，`mailto:` 前綴會自動補上。
    pub fn new(email: &str) -> Self {
        NewAccountPayload {
            contact: vec![normalize_contact(email)],
            terms_of_service_agreed: true,
            only_return_existing: false,
        }
    }
}

impl PayloadT for NewAccountPayload {
    fn validate(&self) -> Result<(), AcmeError> {
        validate_contacts(&self.contact)
    }
}

/// 帳戶更新請求；`status` 只接受 `deactivated`。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl PayloadT for AccountUpdatePayload {
    fn validate(&self) -> Result<(), AcmeError> {
        if let Some(contact) = &self.contact {
            validate_contacts(contact)?;
        }
        match self.status.as_deref() {
            None | Some("deactivated") => Ok(()),
            Some(other) => Err(AcmeError::BadRequest(format!(
                "account status cannot be set to \"{}\"",
                other
            ))),
        }
    }
}

/// 補上 `mailto:` 前綴。
pub fn normalize_contact(contact: &str) -> String {
    if contact.starts_with("mailto:") {
        contact.to_string()
    } else {
        format!("mailto:{}", contact)
    }
}

fn validate_contacts(contacts: &[String]) -> Result<(), AcmeError> {
    for contact in contacts {
        let address = normalize_contact(contact);
        let address = &address["mailto:".len()..];
        let valid = match address.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && domain.contains('.') && !address.contains([',', ' ', '?'])
            }
            None => false,
        };
        if !valid {
            return Err(AcmeError::InvalidContact(format!(
                "{} is not a valid mailto address",
                contact
            )));
        }
    }
    Ok(())
}

/// 證書所涵蓋的識別碼，目前只有 `dns` 類型。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: value.to_string(),
        }
    }
}

/// newOrder 請求。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
}

impl NewOrderPayload {
    /// 為每個網域建立 `dns` 識別碼。
    pub fn new(domains: Vec<&str>) -> Self {
        NewOrderPayload {
            identifiers: domains.into_iter().map(Identifier::dns).collect(),
            not_before: None,
            not_after: None,
        }
    }
}

impl PayloadT for NewOrderPayload {
    fn validate(&self) -> Result<(), AcmeError> {
        if self.identifiers.is_empty() {
            return Err(AcmeError::BadRequest(
                "At least one identifier is required".to_string(),
            ));
        }
        if self.identifiers.len() > MAX_IDENTIFIERS {
            return Err(AcmeError::RejectedIdentifier(format!(
                "at most {} identifiers per order",
                MAX_IDENTIFIERS
            )));
        }
        if self.not_before.is_some() || self.not_after.is_some() {
            return Err(AcmeError::BadRequest(
                "notBefore and notAfter are not supported".to_string(),
            ));
        }
        Ok(())
    }
}

/// 觸發挑戰驗證的空物件 `{}`。
#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ChallengeValidationPayload {}

impl ChallengeValidationPayload {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadT for ChallengeValidationPayload {
    fn validate(&self) -> Result<(), AcmeError> {
        Ok(())
    }
}

/// finalize 請求，內含 URL 安全 Base64 編碼的 DER CSR。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    #[serde(rename = "csr")]
    csr_b64_str: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_der: &[u8]) -> Self {
        FinalizeOrderPayload {
            csr_b64_str: Base64::new(csr_der).base64_url(),
        }
    }

    pub fn csr_der(&self) -> Result<Vec<u8>, AcmeError> {
        Base64::from_url(&self.csr_b64_str)
            .map(Base64::into_bytes)
            .map_err(|e| AcmeError::BadCsr(e.to_string()))
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<(), AcmeError> {
        self.csr_der().map(|_| ())
    }
}

/// 授權停用請求。
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizationUpdatePayload {
    pub status: String,
}

impl PayloadT for AuthorizationUpdatePayload {
    fn validate(&self) -> Result<(), AcmeError> {
        if self.status == "deactivated" {
            Ok(())
        } else {
            Err(AcmeError::BadRequest(format!(
                "authorization status cannot be set to \"{}\"",
                self.status
            )))
        }
    }
}

/// keyChange 內層 JWS 的載荷。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChangePayload {
    pub account: String,
    pub old_key: Jwk,
}

impl PayloadT for KeyChangePayload {
    fn validate(&self) -> Result<(), AcmeError> {
        if self.account.is_empty() {
            return Err(AcmeError::BadRequest("account URL is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_payload() {
        let payload = NewAccountPayload::from_jws_payload(
            br#"{"contact":["mailto:admin@example.com"],"termsOfServiceAgreed":true}"#,
        )
        .unwrap();
        assert!(payload.terms_of_service_agreed);
        assert!(!payload.only_return_existing);

        assert!(NewAccountPayload::from_jws_payload(br#"{"contact":["mailto:nobody"]}"#).is_err());
        assert_eq!(NewAccountPayload::new("a@example.com").contact, vec!["mailto:a@example.com"]);
        assert!(NewAccountPayload::from_jws_payload(br#"{"onlyReturnExisting":true}"#).is_ok());
    }

    #[test]
    fn test_new_order_limits() {
        assert!(NewOrderPayload::from_jws_payload(br#"{"identifiers":[]}"#).is_err());
        let many: Vec<String> = (0..=MAX_IDENTIFIERS).map(|i| format!("h{}.example.com", i)).collect();
        let payload = NewOrderPayload::new(many.iter().map(String::as_str).collect());
        assert!(payload.validate().is_err());
        let ok = NewOrderPayload::new(vec!["example.com"]);
        assert!(NewOrderPayload::from_jws_payload(ok.to_json_string().unwrap().as_bytes()).is_ok());
    }

    #[test]
    fn test_finalize_payload_decodes_csr() {
        let payload = FinalizeOrderPayload::new(&[1, 2, 3]);
        let parsed = FinalizeOrderPayload::from_jws_payload(
            payload.to_json_string().unwrap().as_bytes(),
        )
        .unwrap();
        assert_eq!(parsed.csr_der().unwrap(), vec![1, 2, 3]);
        assert!(FinalizeOrderPayload::from_jws_payload(br#"{"csr":"not base64!"}"#).is_err());
    }

    #[test]
    fn test_status_updates() {
        assert!(AuthorizationUpdatePayload::from_jws_payload(br#"{"status":"deactivated"}"#).is_ok());
        assert!(AuthorizationUpdatePayload::from_jws_payload(br#"{"status":"valid"}"#).is_err());
        assert!(AccountUpdatePayload::from_jws_payload(br#"{"status":"revoked"}"#).is_err());
        assert!(ChallengeValidationPayload::from_jws_payload(b"{}").is_ok());
    }
}
