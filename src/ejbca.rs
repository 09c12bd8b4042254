//! EJBCA Web Service（SOAP 1.1）後端。
//!
//! 使用三個操作：`certificateRequest` 簽發、`findCerts` 對帳、`getLastCAChain` 組出完整證書鏈。

use std::{borrow::Cow, fs, time::Duration};

use log::{debug, info, warn};
use openssl::x509::X509;
use quick_xml::{escape::escape, events::Event, Reader};
use reqwest::{
    blocking::Client,
    header::{CONTENT_TYPE, HeaderValue},
    StatusCode,
};
use thiserror::Error;

use crate::{
    base64::{random_url_token, Base64},
    ca::{BackendError, CaBackend, IssuanceRequest, IssuedCertificate, PollOutcome},
    config::EjbcaSettings,
};

const SERVICE_PATH: &str = "/ejbca/ejbcaws/ejbcaws";
const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const WS_NS: &str = "http://ws.protocol.core.ejbca.org/";

/// PKCS#10 請求類型。
const CERT_REQ_TYPE_PKCS10: u32 = 0;
/// End entity 狀態 NEW。
const STATUS_NEW: u32 = 10;

/// 代表 CA 暫時無法服務、值得重試的 fault 名稱。
const TRANSIENT_FAULTS: &[&str] = &["CAOfflineException", "ServiceUnavailable"];

#[derive(Debug, Error)]
pub enum EjbcaError {
    #[error("Failed to read client identity: {0}")]
    Identity(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// SOAP 回應解析後的結果。
#[derive(Debug, Clone, PartialEq, Eq)]
enum SoapReply {
    /// 依序出現的 `data` / `certificateData` 內容。
    Certificates(Vec<String>),
    Fault { code: String, message: String, detail: Option<String> },
}

/// 透過 SOAP 呼叫 EJBCA 的 [`CaBackend`] 實作。
#[derive(Debug)]
pub struct EjbcaSoapBackend {
    client: Client,
    endpoint: String,
    settings: EjbcaSettings,
}

impl EjbcaSoapBackend {
    /// 建立後端；若設定了 PKCS#12 檔案則作為 TLS 用戶端身分。
    pub fn new(settings: EjbcaSettings, timeout: Duration) -> Result<Self, EjbcaError> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(path) = &settings.client_p12 {
            let der = fs::read(path)?;
            let password = settings.client_p12_password.as_deref().unwrap_or("");
            builder = builder.identity(reqwest::Identity::from_pkcs12_der(&der, password)?);
            debug!("Using EJBCA client identity from {}", path.display());
        }
        let endpoint = format!("{}{}", settings.url.trim_end_matches('/'), SERVICE_PATH);
        info!("EJBCA backend at {} (CA \"{}\")", endpoint, settings.ca_name);
        Ok(Self {
            client: builder.build()?,
            endpoint,
            settings,
        })
    }

    fn username(&self, request_id: &str) -> String {
        format!("{}{}", self.settings.username_prefix, request_id)
    }

    fn call(&self, body: String) -> Result<SoapReply, BackendError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/xml; charset=utf-8"))
            .header("SOAPAction", HeaderValue::from_static("\"\""))
            .body(body)
            .send()
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        if [
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ]
        .contains(&status)
        {
            return Err(BackendError::Transient(format!("EJBCA returned {}", status)));
        }

        match parse_reply(&text) {
            Ok(reply) => Ok(reply),
            Err(e) if status.is_success() => Err(BackendError::Transient(format!(
                "unreadable EJBCA response: {}",
                e
            ))),
            Err(_) if status.is_client_error() => {
                Err(BackendError::Rejected(format!("EJBCA returned {}", status)))
            }
            Err(_) => Err(BackendError::Transient(format!("EJBCA returned {}", status))),
        }
    }

    /// 取得 CA 證書鏈（PEM），接在終端證書之後。
    fn ca_chain(&self) -> Result<String, BackendError> {
        let body = envelope(&format!(
            "<ws:getLastCAChain><arg0>{}</arg0></ws:getLastCAChain>",
            escape(self.settings.ca_name.as_str())
        ));
        let certs = expect_certificates(self.call(body)?)?;
        let mut pem = String::new();
        for data in certs {
            pem.push_str(&der_to_pem(&decode_certificate(&data)?)?);
        }
        Ok(pem)
    }

    fn with_chain(&self, leaf_der: &[u8], username: String) -> Result<IssuedCertificate, BackendError> {
        assemble_chain(leaf_der, self.ca_chain(), username)
    }
}

/// 組出終端證書加 CA 鏈。證書已經簽發，取不到 CA 鏈時只回傳終端證書，不讓呼叫端重新提交。
fn assemble_chain(
    leaf_der: &[u8],
    ca_chain: Result<String, BackendError>,
    username: String,
) -> Result<IssuedCertificate, BackendError> {
    let mut pem_chain = der_to_pem(leaf_der).map_err(|e| issued_but_unreadable(&username, e))?;
    match ca_chain {
        Ok(chain) => pem_chain.push_str(&chain),
        Err(e) => warn!("Returning {} without the CA chain: {}", username, e),
    }
    Ok(IssuedCertificate {
        pem_chain,
        ca_reference: username,
    })
}

/// `certificateRequest` 回傳的終端證書。解不開時重送也不會變好，因此不可重試。
fn issued_leaf(certs: &[String], username: &str) -> Result<Vec<u8>, BackendError> {
    let data = certs
        .first()
        .ok_or_else(|| BackendError::Transient("certificateRequest returned no data".into()))?;
    decode_certificate(data).map_err(|e| issued_but_unreadable(username, e))
}

fn issued_but_unreadable(username: &str, e: BackendError) -> BackendError {
    let reason = match e {
        BackendError::Transient(reason) | BackendError::Rejected(reason) => reason,
        other => other.to_string(),
    };
    BackendError::Rejected(format!(
        "EJBCA issued a certificate for {} that could not be read: {}",
        username, reason
    ))
}

impl CaBackend for EjbcaSoapBackend {
    fn submit(&self, request: &IssuanceRequest) -> Result<IssuedCertificate, BackendError> {
        let username = self.username(&request.request_id);
        let password = random_url_token(18).map_err(|e| BackendError::Transient(e.to_string()))?;
        let body = certificate_request_body(&self.settings, &username, &password, request);

        debug!("Submitting certificateRequest for {}", username);
        let certs = expect_certificates(self.call(body)?)?;
        let leaf = issued_leaf(&certs, &username)?;
        self.with_chain(&leaf, username)
    }

    fn poll(&self, request_id: &str) -> Result<PollOutcome, BackendError> {
        let username = self.username(request_id);
        let body = envelope(&format!(
            "<ws:findCerts><arg0>{}</arg0><arg1>false</arg1></ws:findCerts>",
            escape(username.as_str())
        ));
        match self.call(body)? {
            SoapReply::Certificates(certs) => match certs.last() {
                Some(data) => {
                    let leaf = decode_certificate(data)?;
                    Ok(PollOutcome::Issued(self.with_chain(&leaf, username)?))
                }
                None => Ok(PollOutcome::Unknown),
            },
            SoapReply::Fault { detail, message, .. }
                if detail.as_deref() == Some("NotFoundException") =>
            {
                debug!("EJBCA has no end entity {}: {}", username, message);
                Ok(PollOutcome::Unknown)
            }
            fault => Err(fault_error(fault)),
        }
    }
}

fn envelope(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <soapenv:Envelope xmlns:soapenv=\"{}\" xmlns:ws=\"{}\">\
         <soapenv:Header/><soapenv:Body>{}</soapenv:Body></soapenv:Envelope>",
        SOAP_NS, WS_NS, body
    )
}

fn certificate_request_body(
    settings: &EjbcaSettings,
    username: &str,
    password: &str,
    request: &IssuanceRequest,
) -> String {
    let subject_dn = request
        .identifiers
        .first()
        .map(|cn| format!("CN={}", cn.trim_start_matches("*.")))
        .unwrap_or_default();
    let alt_names = request
        .identifiers
        .iter()
        .map(|name| format!("dNSName={}", name))
        .collect::<Vec<_>>()
        .join(", ");

    envelope(&format!(
        "<ws:certificateRequest>\
         <arg0>\
         <caName>{ca}</caName>\
         <certificateProfileName>{cp}</certificateProfileName>\
         <clearPwd>false</clearPwd>\
         <endEntityProfileName>{eep}</endEntityProfileName>\
         <keyRecoverable>false</keyRecoverable>\
         <password>{password}</password>\
         <sendNotification>false</sendNotification>\
         <status>{status}</status>\
         <subjectAltName>{san}</subjectAltName>\
         <subjectDN>{dn}</subjectDN>\
         <tokenType>USERGENERATED</tokenType>\
         <username>{username}</username>\
         </arg0>\
         <arg1>{csr}</arg1>\
         <arg2>{req_type}</arg2>\
         <arg3></arg3>\
         <arg4>CERTIFICATE</arg4>\
         </ws:certificateRequest>",
        ca = escape(settings.ca_name.as_str()),
        cp = escape(settings.certificate_profile.as_str()),
        eep = escape(settings.end_entity_profile.as_str()),
        password = escape(password),
        status = STATUS_NEW,
        san = escape(alt_names.as_str()),
        dn = escape(subject_dn.as_str()),
        username = escape(username),
        csr = Base64::new(&request.csr_der).as_standard(),
        req_type = CERT_REQ_TYPE_PKCS10,
    ))
}

/// 解析 SOAP 回應，收集證書資料欄位或 fault 資訊。
fn parse_reply(xml: &str) -> Result<SoapReply, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut certs = Vec::new();
    let mut fault = false;
    let mut code = String::new();
    let mut message = String::new();
    let mut detail = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "Fault" {
                    fault = true;
                }
                // detail 底下第一個元素即例外名稱
                if fault && detail.is_none() && path.last().map(String::as_str) == Some("detail") {
                    detail = Some(name.clone());
                }
                path.push(name);
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if fault && detail.is_none() && path.last().map(String::as_str) == Some("detail") {
                    detail = Some(name);
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                match path.last().map(String::as_str) {
                    Some("data") | Some("certificateData") if !fault => {
                        certs.push(text.into_owned())
                    }
                    Some("faultcode") => code = text.into_owned(),
                    Some("faultstring") => message = text.into_owned(),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(if fault {
        SoapReply::Fault {
            code,
            message,
            detail,
        }
    } else {
        SoapReply::Certificates(certs)
    })
}

fn fault_error(reply: SoapReply) -> BackendError {
    match reply {
        SoapReply::Fault {
            code,
            message,
            detail,
        } => {
            let name = detail.unwrap_or_default();
            let reason = format!("{} {} {}", code, name, message).trim().to_string();
            let transient = TRANSIENT_FAULTS
                .iter()
                .any(|t| name.contains(t) || message.contains(t));
            if transient {
                warn!("EJBCA temporarily unavailable: {}", reason);
                BackendError::Transient(reason)
            } else {
                BackendError::Rejected(reason)
            }
        }
        SoapReply::Certificates(_) => BackendError::Transient("unexpected reply".to_string()),
    }
}

fn expect_certificates(reply: SoapReply) -> Result<Vec<String>, BackendError> {
    match reply {
        SoapReply::Certificates(certs) => Ok(certs),
        fault => Err(fault_error(fault)),
    }
}

/// EJBCA 的證書欄位是「Base64 後再 Base64」的 DER，也接受只編碼一次的形式。
fn decode_certificate(data: &str) -> Result<Vec<u8>, BackendError> {
    let bad = |e: &dyn std::fmt::Display| {
        BackendError::Transient(format!("undecodable certificate data: {}", e))
    };
    let once = Base64::from_standard(data).map_err(|e| bad(&e))?;
    if X509::from_der(once.as_bytes()).is_ok() {
        return Ok(once.into_bytes());
    }
    let inner: Cow<str> = String::from_utf8_lossy(once.as_bytes());
    let twice = Base64::from_standard(&inner).map_err(|e| bad(&e))?;
    X509::from_der(twice.as_bytes()).map_err(|e| bad(&e))?;
    Ok(twice.into_bytes())
}

fn der_to_pem(der: &[u8]) -> Result<String, BackendError> {
    let cert = X509::from_der(der).map_err(|e| BackendError::Transient(e.to_string()))?;
    let pem = cert
        .to_pem()
        .map_err(|e| BackendError::Transient(e.to_string()))?;
    Ok(String::from_utf8_lossy(&pem).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        csr::CSR,
        key_pair::{KeyAlgorithm, KeyPair},
        local_ca::LocalCa,
    };

    fn settings() -> EjbcaSettings {
        EjbcaSettings {
            url: "https://ejbca.test:8443/".to_string(),
            ca_name: "Issuing <CA>".to_string(),
            certificate_profile: "SERVER".to_string(),
            end_entity_profile: "ACME".to_string(),
            username_prefix: "acme-".to_string(),
            client_p12: None,
            client_p12_password: None,
        }
    }

    fn leaf_der() -> Vec<u8> {
        let ca = LocalCa::generate("Test CA", 5).unwrap();
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let pem = ca.sign(&CSR::new().set_san("example.com").build(&key).unwrap()).unwrap();
        X509::from_pem(pem.as_bytes()).unwrap().to_der().unwrap()
    }

    #[test]
    fn test_certificate_request_body() {
        let request = IssuanceRequest {
            request_id: "o1".to_string(),
            csr_der: vec![0xde, 0xad],
            identifiers: vec!["*.example.com".to_string(), "example.com".to_string()],
        };
        let body = certificate_request_body(&settings(), "acme-o1", "pw", &request);
        assert!(body.contains("<caName>Issuing &lt;CA&gt;</caName>"));
        assert!(body.contains("<username>acme-o1</username>"));
        assert!(body.contains("<subjectDN>CN=example.com</subjectDN>"));
        assert!(body.contains("<subjectAltName>dNSName=*.example.com, dNSName=example.com</subjectAltName>"));
        assert!(body.contains("<arg1>3q0=</arg1>"));
        assert!(body.contains("<arg4>CERTIFICATE</arg4>"));
    }

    #[test]
    fn test_parse_certificate_response() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
            <soap:Body><ns2:certificateRequestResponse xmlns:ns2="http://ws.protocol.core.ejbca.org/">
            <return><data>QUJD</data><responseType>CERTIFICATE</responseType></return>
            </ns2:certificateRequestResponse></soap:Body></soap:Envelope>"#;
        assert_eq!(
            parse_reply(xml).unwrap(),
            SoapReply::Certificates(vec!["QUJD".to_string()])
        );
    }

    #[test]
    fn test_parse_fault_classification() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
            <soap:Body><soap:Fault><faultcode>soap:Server</faultcode>
            <faultstring>Wrong certificate profile</faultstring>
            <detail><ns2:UserDoesntFullfillEndEntityProfile xmlns:ns2="http://ws.protocol.core.ejbca.org/"/></detail>
            </soap:Fault></soap:Body></soap:Envelope>"#;
        let reply = parse_reply(xml).unwrap();
        assert!(matches!(
            &reply,
            SoapReply::Fault { detail: Some(d), .. } if d == "UserDoesntFullfillEndEntityProfile"
        ));
        assert!(matches!(fault_error(reply), BackendError::Rejected(_)));

        let offline = SoapReply::Fault {
            code: "soap:Server".into(),
            message: "CA is offline".into(),
            detail: Some("CAOfflineException".into()),
        };
        assert!(matches!(fault_error(offline), BackendError::Transient(_)));
    }

    #[test]
    fn test_decode_single_and_double_encoded() {
        let der = leaf_der();
        let once = Base64::new(&der).as_standard();
        let twice = Base64::new(once.as_bytes()).as_standard();
        assert_eq!(decode_certificate(&once).unwrap(), der);
        assert_eq!(decode_certificate(&twice).unwrap(), der);
        assert!(decode_certificate("QUJD").is_err());
        assert!(der_to_pem(&der).unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_issued_certificate_survives_chain_failure() {
        let der = leaf_der();
        let leaf_pem = der_to_pem(&der).unwrap();

        let issued = assemble_chain(
            &der,
            Err(BackendError::Transient("EJBCA returned 503".into())),
            "acme-o1".to_string(),
        )
        .unwrap();
        assert_eq!(issued.pem_chain, leaf_pem);
        assert_eq!(issued.ca_reference, "acme-o1");

        let root = "-----BEGIN CERTIFICATE-----\nroot\n-----END CERTIFICATE-----\n";
        let issued = assemble_chain(&der, Ok(root.to_string()), "acme-o1".to_string()).unwrap();
        assert_eq!(issued.pem_chain, format!("{}{}", leaf_pem, root));
    }

    #[test]
    fn test_unreadable_issued_leaf_is_not_retried() {
        let der = leaf_der();
        let certs = vec![Base64::new(&der).as_standard()];
        assert_eq!(issued_leaf(&certs, "acme-o1").unwrap(), der);

        let garbage = vec!["QUJD".to_string()];
        assert!(matches!(
            issued_leaf(&garbage, "acme-o1"),
            Err(BackendError::Rejected(reason)) if reason.contains("acme-o1")
        ));
        assert!(matches!(
            issued_leaf(&[], "acme-o1"),
            Err(BackendError::Transient(_))
        ));
    }

    #[test]
    fn test_endpoint_and_username() {
        let backend = EjbcaSoapBackend::new(settings(), Duration::from_secs(5)).unwrap();
        assert_eq!(backend.endpoint, "https://ejbca.test:8443/ejbca/ejbcaws/ejbcaws");
        assert_eq!(backend.username("o1"), "acme-o1");
    }
}
