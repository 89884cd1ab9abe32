use std::fmt;

use serde::{Deserialize, Serialize};

/// The actor behind an audited operation.
///
/// The janitor never acts on behalf of a user; its writes are attributed
/// to a synthetic identity that carries no permissions and only exists so
/// that audit events have a well-formed originator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Identity {
    /// A human or robot user authenticated through the auth plugin.
    User { name: String },
    /// Another registry in the peer group, authenticated with its
    /// replication password.
    Peer { hostname: String },
    /// A janitor task acting on its own authority.
    Janitor { task: String },
}

impl Identity {
    pub fn janitor(task: &str) -> Self {
        Identity::Janitor {
            task: task.to_string(),
        }
    }

    pub fn has_permissions(&self) -> bool {
        !matches!(self, Identity::Janitor { .. })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Identity::User { name } => write!(f, "user:{name}"),
            Identity::Peer { hostname } => write!(f, "peer:{hostname}"),
            Identity::Janitor { task } => write!(f, "janitor:{task}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn janitor_identity() {
        let identity = Identity::janitor("account enforcement");
        assert!(!identity.has_permissions());
        assert_eq!(identity.to_string(), "janitor:account enforcement");

        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["type"], "janitor");
        assert_eq!(json["task"], "account enforcement");
    }
}
