//! The `identify` handshake payload and client role derivation.

use serde::Serialize;
use serde_json::Value;

/// Which side of the popup protocol a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Automated client that issues asks.
    Requester,
    /// Interactive client that presents asks to a human and answers them.
    Responder,
}

impl Role {
    /// Derive a role from the handshake's `clientType` field.
    ///
    /// Only an explicit `"responder"` yields [`Role::Responder`]; missing or
    /// unrecognized values identify as requesters.
    pub fn from_client_type(client_type: Option<&str>) -> Self {
        match client_type {
            Some("responder") => Self::Responder,
            _ => Self::Requester,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Responder => "responder",
        }
    }

    /// The role a message from this role is routed to.
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Requester => Self::Responder,
            Self::Responder => Self::Requester,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata a client supplies when identifying. Stored and reported as-is;
/// the broker interprets nothing here beyond `client_type`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl IdentifyParams {
    /// Extract handshake metadata from a `params` object. Missing or
    /// mistyped fields are dropped rather than failing the handshake.
    pub fn from_params(params: &Value) -> Self {
        Self {
            client_type: string_field(params, "clientType"),
            version: string_field(params, "version"),
            capabilities: params.get("capabilities").cloned(),
            instance_id: string_field(params, "instanceId"),
            client_name: string_field(params, "clientName"),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_client_type(self.client_type.as_deref())
    }
}

fn string_field(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responder_client_type_maps_to_responder() {
        let params = IdentifyParams::from_params(&json!({"clientType": "responder"}));
        assert_eq!(params.role(), Role::Responder);
    }

    #[test]
    fn missing_or_unrecognized_client_type_defaults_to_requester() {
        assert_eq!(IdentifyParams::from_params(&json!({})).role(), Role::Requester);
        assert_eq!(
            IdentifyParams::from_params(&json!({"clientType": "widget"})).role(),
            Role::Requester
        );
    }

    #[test]
    fn metadata_fields_are_extracted() {
        let params = IdentifyParams::from_params(&json!({
            "clientType": "responder",
            "version": "2.1.0",
            "capabilities": ["popups"],
            "instanceId": "inst-7",
            "clientName": "desk",
            "future": "ignored"
        }));
        assert_eq!(params.version.as_deref(), Some("2.1.0"));
        assert_eq!(params.capabilities, Some(json!(["popups"])));
        assert_eq!(params.instance_id.as_deref(), Some("inst-7"));
        assert_eq!(params.client_name.as_deref(), Some("desk"));
    }

    #[test]
    fn mistyped_fields_are_dropped_not_fatal() {
        let params = IdentifyParams::from_params(&json!({"clientType": 17, "version": true}));
        assert!(params.client_type.is_none());
        assert!(params.version.is_none());
        assert_eq!(params.role(), Role::Requester);
    }

    #[test]
    fn counterpart_is_symmetric() {
        assert_eq!(Role::Requester.counterpart(), Role::Responder);
        assert_eq!(Role::Responder.counterpart(), Role::Requester);
    }
}
