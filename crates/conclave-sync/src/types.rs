//! Records stored under the coordination prefix and values handed to callers.

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::error::DecodeSnafu;
use crate::error::EncodeSnafu;
use crate::error::SyncError;

/// Role of a member within its namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Currently holds the election.
    Primary,
    /// Registered but not elected.
    #[default]
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// A participant registered in an election namespace.
///
/// Stored as JSON at `<prefix>/leaders/<namespace>/<id>`. The stored role is
/// informational; listings derive it from election order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Election namespace.
    pub namespace: String,
    /// Member id, unique within the namespace.
    pub id: String,
    /// Primary or follower.
    #[serde(default)]
    pub role: Role,
}

impl Member {
    /// A follower in `namespace`.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            role: Role::Follower,
        }
    }

    /// Same member with a different role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Whether this member currently leads its namespace.
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Serialize for storage.
    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).context(EncodeSnafu)
    }

    /// Parse the record stored at `key`.
    pub fn decode(key: &str, value: &str) -> Result<Self, SyncError> {
        serde_json::from_str(value).context(DecodeSnafu { key })
    }
}

/// Leader identity as reported by observation streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserveResult {
    /// Election namespace.
    pub namespace: String,
    /// Id of the current leader.
    pub id: String,
}

/// Membership change reported by an [`ElectWatcher`](crate::ElectWatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectEvent {
    /// A member registered or rewrote its record.
    Joined(Member),
    /// A member's record was removed, by resignation or session expiry.
    Left {
        /// Election namespace.
        namespace: String,
        /// Departed member id.
        id: String,
    },
}

/// Lifecycle of one [`Leadership`](crate::Leadership) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidacyState {
    /// Registered and waiting for every earlier candidate to leave.
    Campaigning,
    /// Holding the election.
    Elected,
    /// Resigned or lost its session. Terminal.
    Resigned,
}

/// Value written under a lock holder key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    /// Holder id of the coordinator that wrote it.
    pub owner: String,
    /// Lock name.
    pub lock: String,
}

impl LockRecord {
    pub(crate) fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).context(EncodeSnafu)
    }

    pub(crate) fn decode(key: &str, value: &str) -> Result<Self, SyncError> {
        serde_json::from_str(value).context(DecodeSnafu { key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_json_shape() {
        let member = Member::new("svc", "node-1").with_role(Role::Primary);
        let json = member.encode().unwrap();
        assert_eq!(json, r#"{"namespace":"svc","id":"node-1","role":"primary"}"#);
        assert_eq!(Member::decode("k", &json).unwrap(), member);
    }

    #[test]
    fn member_without_role_decodes_as_follower() {
        let member = Member::decode("k", r#"{"namespace":"svc","id":"a"}"#).unwrap();
        assert_eq!(member.role, Role::Follower);
        assert!(!member.is_primary());
    }

    #[test]
    fn garbage_record_reports_key() {
        let err = Member::decode("/p/leaders/svc/x", "not json").unwrap_err();
        match err {
            SyncError::Decode { key, .. } => assert_eq!(key, "/p/leaders/svc/x"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lock_record_round_trips() {
        let record = LockRecord {
            owner: "holder-1".to_string(),
            lock: "jobs".to_string(),
        };
        let json = record.encode().unwrap();
        assert_eq!(LockRecord::decode("k", &json).unwrap(), record);
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Primary.to_string(), "primary");
        assert_eq!(Role::default().to_string(), "follower");
    }
}
