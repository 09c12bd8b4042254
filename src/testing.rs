//! 測試用的 ACME 用戶端：以產生的金鑰簽署請求並直接呼叫 [`AcmeServer::handle`]。

use reqwest::{header::LOCATION, Method, StatusCode};
use serde_json::{json, Value};

use crate::{
    jwk::Jwk,
    jws::{Jws, ProtectedHeader},
    key_pair::{KeyAlgorithm, KeyPair},
    server::{AcmeRequest, AcmeResponse, AcmeServer},
};

pub(crate) struct TestClient {
    key: KeyPair,
    kid: Option<String>,
}

impl TestClient {
    pub(crate) fn new(alg: KeyAlgorithm) -> Self {
        Self::from_key(KeyPair::generate(alg, None).unwrap())
    }

    pub(crate) fn from_key(key: KeyPair) -> Self {
        Self { key, kid: None }
    }

    pub(crate) fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub(crate) fn set_kid(&mut self, kid: &str) {
        self.kid = Some(kid.to_string());
    }

    pub(crate) fn fresh_nonce(&self, server: &AcmeServer) -> String {
        let url = server.urls().endpoint("new-nonce");
        let response = server.handle(AcmeRequest::new(Method::HEAD, &url));
        response.nonce().unwrap().to_string()
    }

    fn header(&self, url: &str, nonce: Option<&str>, embed_jwk: bool) -> ProtectedHeader {
        ProtectedHeader {
            alg: self.key.alg.jws_alg().to_string(),
            nonce: nonce.map(str::to_string),
            url: url.to_string(),
            jwk: embed_jwk.then(|| Jwk::from_key_pair(&self.key).unwrap()),
            kid: if embed_jwk { None } else { self.kid.clone() },
        }
    }

    fn sign(&self, header: &ProtectedHeader, payload: Option<&Value>) -> Vec<u8> {
        let bytes = payload
            .map(|p| serde_json::to_vec(p).unwrap())
            .unwrap_or_default();
        Jws::sign(header, &bytes, &self.key)
            .unwrap()
            .to_json()
            .unwrap()
            .into_bytes()
    }

    /// 以指定 nonce 組出以 kid 簽署的請求；`payload` 為 `None` 時為 POST-as-GET。
    pub(crate) fn request_with_nonce(
        &self,
        url: &str,
        payload: Option<&Value>,
        nonce: &str,
    ) -> AcmeRequest {
        let header = self.header(url, Some(nonce), false);
        AcmeRequest::jose(url, self.sign(&header, payload))
    }

    pub(crate) fn request(
        &self,
        server: &AcmeServer,
        url: &str,
        payload: Option<&Value>,
    ) -> AcmeRequest {
        self.request_with_nonce(url, payload, &self.fresh_nonce(server))
    }

    pub(crate) fn post(&self, server: &AcmeServer, url: &str, payload: &Value) -> AcmeResponse {
        server.handle(self.request(server, url, Some(payload)))
    }

    pub(crate) fn post_as_get(&self, server: &AcmeServer, url: &str) -> AcmeResponse {
        server.handle(self.request(server, url, None))
    }

    /// new-account；成功時記下帳戶 URL 作為之後的 kid。
    pub(crate) fn register(&mut self, server: &AcmeServer, payload: Value) -> AcmeResponse {
        let url = server.urls().endpoint("new-account");
        let nonce = self.fresh_nonce(server);
        let header = self.header(&url, Some(&nonce), true);
        let response = server.handle(AcmeRequest::jose(&url, self.sign(&header, Some(&payload))));
        if response.status == StatusCode::OK || response.status == StatusCode::CREATED {
            if let Some(location) = response.header(LOCATION) {
                self.kid = Some(location.to_string());
            }
        }
        response
    }

    /// 把帳戶金鑰換成 `new_key`：內層以新金鑰簽署，外層以目前金鑰簽署。
    pub(crate) fn key_change(&self, server: &AcmeServer, new_key: &KeyPair) -> AcmeResponse {
        let url = server.urls().endpoint("key-change");
        let inner_client = TestClient::from_key(new_key.clone());
        let inner_header = inner_client.header(&url, None, true);
        let inner_payload = json!({
            "account": self.kid.clone().unwrap(),
            "oldKey": Jwk::from_key_pair(&self.key).unwrap(),
        });
        let inner: Value =
            serde_json::from_slice(&inner_client.sign(&inner_header, Some(&inner_payload))).unwrap();
        self.post(server, &url, &inner)
    }
}
