use serde::{Deserialize, Serialize};

/// Request body of the peering endpoint.
///
/// Sent by a registry that has just issued a fresh replication password
/// for one of its peers. Field names are part of the wire protocol and
/// must not change. The receiving side answers `204 No Content`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringRequest {
    #[serde(rename = "PeerHostName")]
    pub peer_hostname: String,
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "Password")]
    pub password: String,
}

impl PeeringRequest {
    /// The user name under which `peer_hostname` may authenticate with the
    /// issued password.
    pub fn replication_user_name(peer_hostname: &str) -> String {
        format!("replication@{peer_hostname}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peering_request_wire_format() {
        let req = PeeringRequest {
            peer_hostname: "registry.example.org".into(),
            user_name: PeeringRequest::replication_user_name("registry-2.example.org"),
            password: "s3cret".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["PeerHostName"], "registry.example.org");
        assert_eq!(json["UserName"], "replication@registry-2.example.org");
        assert_eq!(json["Password"], "s3cret");
    }
}
