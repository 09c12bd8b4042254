//! ACME 資源對外的 JSON 表示（RFC 8555 §7.1）。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    account::Account,
    authorization::Authorization,
    challenge::Challenge,
    directory::Urls,
    error::Problem,
    order::Order,
    payload::Identifier,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub status: &'static str,
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    pub orders: String,
}

impl AccountView {
    pub fn new(account: &Account, urls: &Urls) -> Self {
        Self {
            status: account.status.as_str(),
            contact: account.contact.clone(),
            terms_of_service_agreed: account.terms_of_service_agreed,
            orders: urls.account_orders(&account.id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub status: &'static str,
    pub expires: DateTime<Utc>,
    pub identifiers: Vec<Identifier>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl OrderView {
    pub fn new(order: &Order, urls: &Urls) -> Self {
        Self {
            status: order.status.as_str(),
            expires: order.expires,
            identifiers: order.identifiers.clone(),
            authorizations: order
                .authorizations
                .iter()
                .map(|id| urls.authorization(id))
                .collect(),
            finalize: urls.finalize(&order.id),
            certificate: order.certificate_id.as_deref().map(|id| urls.certificate(id)),
            error: order.error.clone(),
        }
    }
}

/// `account/{id}/orders` 的回應。
#[derive(Debug, Clone, Serialize)]
pub struct OrderListView {
    pub orders: Vec<String>,
}

impl OrderListView {
    pub fn new(orders: &[Order], urls: &Urls) -> Self {
        Self {
            orders: orders.iter().map(|o| urls.order(&o.id)).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeView {
    #[serde(rename = "type")]
    pub challenge_type: &'static str,
    pub url: String,
    pub status: &'static str,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl ChallengeView {
    pub fn new(challenge: &Challenge, urls: &Urls) -> Self {
        Self {
            challenge_type: challenge.challenge_type.as_str(),
            url: urls.challenge(&challenge.id),
            status: challenge.status.as_str(),
            token: challenge.token.clone(),
            validated: challenge.validated,
            error: challenge.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationView {
    pub identifier: Identifier,
    pub status: &'static str,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<ChallengeView>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub wildcard: bool,
}

impl AuthorizationView {
    pub fn new(authz: &Authorization, challenges: &[Challenge], urls: &Urls) -> Self {
        Self {
            identifier: authz.identifier.clone(),
            status: authz.status.as_str(),
            expires: authz.expires,
            challenges: challenges
                .iter()
                .map(|c| ChallengeView::new(c, urls))
                .collect(),
            wildcard: authz.wildcard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{challenge::ChallengeType, order::OrderStatus};

    #[test]
    fn test_order_view() {
        let urls = Urls::new("https://acme.example.com");
        let now = Utc::now();
        let order = Order {
            id: "o1".into(),
            account_id: "a1".into(),
            identifiers: vec![Identifier::dns("example.com")],
            status: OrderStatus::Valid,
            expires: now,
            authorizations: vec!["z1".into()],
            certificate_id: Some("c1".into()),
            error: None,
            csr: Some("ignored".into()),
            finalize_started_at: Some(now),
            resubmitted: false,
            created_at: now,
        };
        let json = serde_json::to_value(OrderView::new(&order, &urls)).unwrap();
        assert_eq!(json["status"], "valid");
        assert_eq!(json["identifiers"][0]["type"], "dns");
        assert_eq!(json["authorizations"][0], "https://acme.example.com/authz/z1");
        assert_eq!(json["finalize"], "https://acme.example.com/order/o1/finalize");
        assert_eq!(json["certificate"], "https://acme.example.com/cert/c1");
        assert!(json.get("csr").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_authorization_view() {
        let urls = Urls::new("https://acme.example.com");
        let authz = Authorization::new(
            "o1",
            &Identifier::dns("*.example.com"),
            Utc::now(),
        );
        let challenge = Challenge::new(&authz.id, ChallengeType::Dns01).unwrap();
        let json =
            serde_json::to_value(AuthorizationView::new(&authz, &[challenge.clone()], &urls)).unwrap();
        assert_eq!(json["identifier"]["value"], "example.com");
        assert_eq!(json["wildcard"], true);
        assert_eq!(json["challenges"][0]["type"], "dns-01");
        assert_eq!(
            json["challenges"][0]["url"],
            format!("https://acme.example.com/chall/{}", challenge.id)
        );
        assert_eq!(json["challenges"][0]["token"], challenge.token);
    }
}
