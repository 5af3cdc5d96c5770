//! ACME wire model (RFC 8555 resources).

use serde::{Deserialize, Serialize};

/// Directory document: the provider's endpoint map.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default)]
    pub terms_of_service: Option<String>,
}

/// `newAccount` request payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountRequest {
    pub terms_of_service_agreed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
}

/// A DNS identifier on an order or authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// `newOrder` request payload.
#[derive(Debug, Serialize)]
pub struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
}

/// Order resource status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }
}

/// Order resource.
#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    #[serde(default)]
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
}

/// Authorization resource. Statuses other than order statuses can appear
/// (`deactivated`, `revoked`, `expired`), so this stays a plain string.
#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub status: String,
    pub identifier: Identifier,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    /// Set when this authorization covers a wildcard identifier; the
    /// identifier value then carries the name *without* the `*.` prefix.
    #[serde(default)]
    pub wildcard: bool,
}

/// Challenge resource.
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub status: String,
}

/// `finalize` request payload.
#[derive(Debug, Serialize)]
pub struct FinalizeRequest {
    /// base64url DER CSR.
    pub csr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_decodes_optional_fields() {
        let json = r#"{
            "newNonce": "https://ca.example/nonce",
            "newAccount": "https://ca.example/account",
            "newOrder": "https://ca.example/order",
            "meta": {"termsOfService": "https://ca.example/terms"}
        }"#;
        let dir: Directory = serde_json::from_str(json).unwrap();
        assert_eq!(dir.new_nonce, "https://ca.example/nonce");
        assert!(dir.revoke_cert.is_none());
        assert_eq!(
            dir.meta.unwrap().terms_of_service.as_deref(),
            Some("https://ca.example/terms")
        );
    }

    #[test]
    fn test_wildcard_authorization_decodes() {
        let json = r#"{
            "status": "pending",
            "identifier": {"type": "dns", "value": "example.com"},
            "wildcard": true,
            "challenges": [
                {"type": "dns-01", "url": "https://ca.example/chal/1", "token": "tok", "status": "pending"}
            ]
        }"#;
        let auth: Authorization = serde_json::from_str(json).unwrap();
        assert!(auth.wildcard);
        assert_eq!(auth.identifier.value, "example.com");
        assert_eq!(auth.challenges[0].kind, "dns-01");
    }

    #[test]
    fn test_order_status_round_trip() {
        let order: Order = serde_json::from_str(
            r#"{"status": "ready", "finalize": "https://ca.example/fin/1"}"#,
        )
        .unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
        assert_eq!(order.status.as_str(), "ready");
    }
}
