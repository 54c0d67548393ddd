use std::{fmt, fmt::Debug, time::Duration};

use chrono::{DateTime, Utc};
use realmload_macros::metric;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A `Metric` is a single observed measurement produced while a run is in progress.
///
/// Metrics are the most granular level of data the engine produces. They are collected
/// into an [`crate::Aggregate`], summarised by a [`crate::Report`] and persisted by a
/// [`crate::Reporter`].
///
/// Metrics must be serializable (they end up as artifact rows), comparable and cheap
/// to clone, since they cross task boundaries over a channel.
///
/// Use the [`realmload_macros::metric`] attribute to derive everything at once:
///
/// ```rust
/// use realmload::{Metric, macros::metric};
///
/// #[metric]
/// struct Probe {
///     latency_ms: u64,
/// }
/// ```
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
}

/// The operation class of a task. Selection weights are assigned per kind group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Create,
    Read,
    Update,
    Delete,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Create,
        TaskKind::Read,
        TaskKind::Update,
        TaskKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Create => "create",
            TaskKind::Read => "read",
            TaskKind::Update => "update",
            TaskKind::Delete => "delete",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity types exposed by the admin API.
///
/// `Realm` is the realm under test itself. It is read and updated but never
/// tracked by the resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    User,
    Client,
    RealmRole,
    Group,
    ClientScope,
    Realm,
}

impl ResourceType {
    /// Types whose instances are created during a run and tracked in the pool.
    pub const TRACKED: [ResourceType; 5] = [
        ResourceType::User,
        ResourceType::Client,
        ResourceType::RealmRole,
        ResourceType::Group,
        ResourceType::ClientScope,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::User => "user",
            ResourceType::Client => "client",
            ResourceType::RealmRole => "realm_role",
            ResourceType::Group => "group",
            ResourceType::ClientScope => "client_scope",
            ResourceType::Realm => "realm",
        }
    }

    /// Update and delete tasks on this type address a single tracked instance.
    pub fn requires_identifier(&self) -> bool {
        !matches!(self, ResourceType::Realm)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// One executed request. Immutable once recorded.
#[metric]
pub struct RequestOutcome {
    pub timestamp: DateTime<Utc>,
    pub virtual_user_id: usize,
    /// Catalog name of the executed task, e.g. `create/user`.
    pub task: String,
    pub task_kind: TaskKind,
    pub resource_type: ResourceType,
    pub latency: Duration,
    pub status: OutcomeStatus,
    pub http_status: Option<u16>,
    pub error_detail: Option<String>,
    /// The selector replaced an update/delete with a read of the same type.
    pub redirected: bool,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realm_is_the_only_untracked_type() {
        assert!(!ResourceType::TRACKED.contains(&ResourceType::Realm));
        assert!(!ResourceType::Realm.requires_identifier());
        assert!(
            ResourceType::TRACKED
                .iter()
                .all(ResourceType::requires_identifier)
        );
    }

    #[test]
    fn outcome_serializes_enums_in_snake_case() {
        let outcome = RequestOutcome {
            timestamp: Utc::now(),
            virtual_user_id: 3,
            task: "read/realm_roles".into(),
            task_kind: TaskKind::Read,
            resource_type: ResourceType::RealmRole,
            latency: Duration::from_millis(12),
            status: OutcomeStatus::Success,
            http_status: Some(200),
            error_detail: None,
            redirected: false,
        };

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["task_kind"], "read");
        assert_eq!(value["resource_type"], "realm_role");
        assert_eq!(value["status"], "success");
        assert!(outcome.is_success());
    }
}
