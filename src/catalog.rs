//! The weighted task catalog.
//!
//! Selection is two-stage: a kind group is sampled first (read, create,
//! update, delete), then a task inside that group by its own weight. Both
//! distributions are built once when the catalog is constructed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::{
    Rng,
    distr::{Distribution, weighted::WeightedIndex},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    api::ApiResponse,
    error::CatalogError,
    metric::{ResourceType, TaskKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Where a create task finds the identifier of what it created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierSource {
    /// Last path segment of the `Location` response header.
    Location,
    /// A string field of the submitted payload.
    PayloadField(&'static str),
    /// Not applicable (reads, updates, deletes).
    None,
}

/// Values a payload builder may draw on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadContext {
    /// Eight hex digits, unique enough to avoid name collisions within a run.
    pub unique: String,
    pub epoch_seconds: i64,
    /// Identifier of the addressed resource for updates.
    pub target: Option<String>,
}

impl PayloadContext {
    pub fn generate<R: Rng + ?Sized>(
        rng: &mut R,
        now: DateTime<Utc>,
        target: Option<String>,
    ) -> Self {
        Self {
            unique: format!("{:08x}", rng.random::<u32>()),
            epoch_seconds: now.timestamp(),
            target,
        }
    }
}

pub type PayloadBuilder = fn(&PayloadContext) -> Value;

#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Stable name used in logs and artifacts, e.g. `create/user`.
    pub name: &'static str,
    pub kind: TaskKind,
    pub resource_type: ResourceType,
    /// Weight relative to the other tasks of the same kind.
    pub weight: f64,
    pub method: HttpMethod,
    /// Path with `{realm}` and `{id}` placeholders.
    pub endpoint_template: &'static str,
    pub query: &'static [(&'static str, &'static str)],
    pub payload_builder: Option<PayloadBuilder>,
    pub identifier_source: IdentifierSource,
    /// Fetch the current representation and merge the payload into it before
    /// sending, so fields the payload leaves out are preserved.
    pub prefetch: bool,
}

impl TaskDefinition {
    pub fn render_path(&self, realm: &str, identifier: Option<&str>) -> String {
        let path = self.endpoint_template.replace("{realm}", realm);
        match identifier {
            Some(id) => path.replace("{id}", id),
            None => path,
        }
    }

    /// Whether this task addresses one tracked instance of its type.
    pub fn needs_target(&self) -> bool {
        matches!(self.kind, TaskKind::Update | TaskKind::Delete)
            && self.resource_type.requires_identifier()
    }

    pub fn build_payload(&self, ctx: &PayloadContext) -> Option<Value> {
        self.payload_builder.map(|build| build(ctx))
    }

    /// Identifier of the entity a successful create produced.
    pub fn created_identifier(
        &self,
        response: &ApiResponse,
        payload: Option<&Value>,
    ) -> Option<String> {
        match self.identifier_source {
            IdentifierSource::Location => response.created_identifier(),
            IdentifierSource::PayloadField(field) => payload?
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_owned),
            IdentifierSource::None => None,
        }
    }
}

/// Selection weights of the four kind groups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KindWeights {
    pub read: f64,
    pub create: f64,
    pub update: f64,
    pub delete: f64,
}

impl KindWeights {
    pub fn of(&self, kind: TaskKind) -> f64 {
        match kind {
            TaskKind::Create => self.create,
            TaskKind::Read => self.read,
            TaskKind::Update => self.update,
            TaskKind::Delete => self.delete,
        }
    }

    pub fn total(&self) -> f64 {
        TaskKind::ALL.iter().map(|k| self.of(*k)).sum()
    }
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            read: 70.0,
            create: 20.0,
            update: 7.0,
            delete: 3.0,
        }
    }
}

#[derive(Debug, Clone)]
struct KindGroup {
    members: Vec<usize>,
    index: WeightedIndex<f64>,
}

#[derive(Debug, Clone)]
pub struct TaskCatalog {
    definitions: Vec<TaskDefinition>,
    kind_weights: KindWeights,
    kinds: Vec<TaskKind>,
    kind_index: WeightedIndex<f64>,
    groups: HashMap<TaskKind, KindGroup>,
    reads: HashMap<ResourceType, usize>,
}

impl TaskCatalog {
    pub fn new(
        kind_weights: KindWeights,
        definitions: Vec<TaskDefinition>,
    ) -> Result<Self, CatalogError> {
        for kind in TaskKind::ALL {
            let w = kind_weights.of(kind);
            if !w.is_finite() || w < 0.0 {
                return Err(CatalogError::InvalidKindWeight(kind));
            }
        }
        for def in &definitions {
            if !def.weight.is_finite() || def.weight <= 0.0 {
                return Err(CatalogError::InvalidWeight {
                    task: def.name,
                    weight: def.weight,
                });
            }
        }

        let mut reads = HashMap::new();
        for (i, def) in definitions.iter().enumerate() {
            if def.kind == TaskKind::Read {
                reads.entry(def.resource_type).or_insert(i);
            }
        }
        if let Some(missing) = definitions
            .iter()
            .filter(|d| d.needs_target())
            .map(|d| d.resource_type)
            .find(|t| !reads.contains_key(t))
        {
            return Err(CatalogError::MissingReadFallback(missing));
        }

        let mut kinds = Vec::new();
        let mut groups = HashMap::new();
        for kind in TaskKind::ALL.into_iter().filter(|k| kind_weights.of(*k) > 0.0) {
            let members: Vec<usize> = definitions
                .iter()
                .enumerate()
                .filter(|(_, d)| d.kind == kind)
                .map(|(i, _)| i)
                .collect();
            if members.is_empty() {
                return Err(CatalogError::EmptyKindGroup(kind));
            }
            let index = WeightedIndex::new(members.iter().map(|i| definitions[*i].weight))
                .map_err(|_| CatalogError::EmptyKindGroup(kind))?;
            kinds.push(kind);
            groups.insert(kind, KindGroup { members, index });
        }

        let kind_index = WeightedIndex::new(kinds.iter().map(|k| kind_weights.of(*k)))
            .map_err(|_| CatalogError::NothingSelectable)?;

        Ok(Self {
            definitions,
            kind_weights,
            kinds,
            kind_index,
            groups,
            reads,
        })
    }

    /// The built-in admin API catalog.
    pub fn standard() -> Self {
        Self::new(KindWeights::default(), standard_definitions())
            .expect("built-in task catalog is valid")
    }

    pub fn definitions(&self) -> &[TaskDefinition] {
        &self.definitions
    }

    pub fn kind_weights(&self) -> KindWeights {
        self.kind_weights
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn sample_kind<R: Rng + ?Sized>(&self, rng: &mut R) -> TaskKind {
        self.kinds[self.kind_index.sample(rng)]
    }

    /// Samples a task from a kind group. `None` if the group has zero weight.
    pub fn sample_in_kind<R: Rng + ?Sized>(
        &self,
        kind: TaskKind,
        rng: &mut R,
    ) -> Option<&TaskDefinition> {
        let group = self.groups.get(&kind)?;
        let member = group.members[group.index.sample(rng)];
        Some(&self.definitions[member])
    }

    /// Two-stage weighted sample: kind group first, then a task inside it.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> &TaskDefinition {
        // every kind in `kinds` has a non-empty group
        let group = &self.groups[&self.sample_kind(rng)];
        &self.definitions[group.members[group.index.sample(rng)]]
    }

    /// The read task used as fallback for `resource_type`.
    pub fn read_for(&self, resource_type: ResourceType) -> Option<&TaskDefinition> {
        self.reads.get(&resource_type).map(|i| &self.definitions[*i])
    }

    pub fn create_for(&self, resource_type: ResourceType) -> Option<&TaskDefinition> {
        self.definitions
            .iter()
            .find(|d| d.kind == TaskKind::Create && d.resource_type == resource_type)
    }
}

impl Default for TaskCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// Deep-merges `patch` into `base`. Objects merge key by key, anything else
/// replaces.
pub fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

const NO_QUERY: &[(&str, &str)] = &[];

fn task(
    name: &'static str,
    kind: TaskKind,
    resource_type: ResourceType,
    weight: f64,
    method: HttpMethod,
    endpoint_template: &'static str,
) -> TaskDefinition {
    TaskDefinition {
        name,
        kind,
        resource_type,
        weight,
        method,
        endpoint_template,
        query: NO_QUERY,
        payload_builder: None,
        identifier_source: IdentifierSource::None,
        prefetch: false,
    }
}

fn standard_definitions() -> Vec<TaskDefinition> {
    use HttpMethod::*;
    use ResourceType::*;
    use TaskKind::{Create, Read, Update};

    vec![
        // create
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "username": format!("testuser_{}", ctx.unique),
                    "enabled": true,
                    "firstName": format!("Test_{}", ctx.unique),
                    "lastName": "User",
                    "email": format!("testuser_{}@example.com", ctx.unique),
                    "credentials": [{
                        "type": "password",
                        "value": "password123",
                        "temporary": false
                    }]
                })
            }),
            identifier_source: IdentifierSource::Location,
            ..task("create/user", Create, User, 2.0, Post, "/admin/realms/{realm}/users")
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "clientId": format!("test-client-{}", ctx.unique),
                    "name": format!("Test Client {}", ctx.unique),
                    "description": "Load test client",
                    "enabled": true,
                    "protocol": "openid-connect",
                    "publicClient": false,
                    "standardFlowEnabled": true,
                    "directAccessGrantsEnabled": true
                })
            }),
            identifier_source: IdentifierSource::Location,
            ..task("create/client", Create, Client, 1.0, Post, "/admin/realms/{realm}/clients")
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "name": format!("test-role-{}", ctx.unique),
                    "description": format!("Test role for load testing - {}", ctx.unique),
                    "composite": false
                })
            }),
            identifier_source: IdentifierSource::PayloadField("name"),
            ..task("create/realm_role", Create, RealmRole, 1.0, Post, "/admin/realms/{realm}/roles")
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "name": format!("test-group-{}", ctx.unique),
                    "attributes": { "description": [format!("Load test group {}", ctx.unique)] }
                })
            }),
            identifier_source: IdentifierSource::Location,
            ..task("create/group", Create, Group, 1.0, Post, "/admin/realms/{realm}/groups")
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "name": format!("test-scope-{}", ctx.unique),
                    "description": format!("Test client scope {}", ctx.unique),
                    "protocol": "openid-connect",
                    "attributes": { "include.in.token.scope": "true" }
                })
            }),
            identifier_source: IdentifierSource::Location,
            ..task(
                "create/client_scope",
                Create,
                ClientScope,
                1.0,
                Post,
                "/admin/realms/{realm}/client-scopes",
            )
        },
        // read
        TaskDefinition {
            query: &[("max", "20"), ("first", "0")],
            ..task("read/users", Read, User, 5.0, Get, "/admin/realms/{realm}/users")
        },
        task("read/clients", Read, Client, 3.0, Get, "/admin/realms/{realm}/clients"),
        task("read/realm_roles", Read, RealmRole, 2.0, Get, "/admin/realms/{realm}/roles"),
        task("read/groups", Read, Group, 2.0, Get, "/admin/realms/{realm}/groups"),
        task("read/realm_info", Read, Realm, 4.0, Get, "/admin/realms/{realm}"),
        task(
            "read/client_scopes",
            Read,
            ClientScope,
            1.0,
            Get,
            "/admin/realms/{realm}/client-scopes",
        ),
        // update
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "firstName": format!("Updated_{}", ctx.unique.get(..4).unwrap_or(&ctx.unique)),
                    "attributes": { "lastUpdated": [ctx.epoch_seconds.to_string()] }
                })
            }),
            ..task("update/user", Update, User, 2.0, Put, "/admin/realms/{realm}/users/{id}")
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "description": format!("Updated client description - {}", ctx.epoch_seconds),
                    "attributes": { "lastModified": ctx.epoch_seconds.to_string() }
                })
            }),
            ..task("update/client", Update, Client, 1.0, Put, "/admin/realms/{realm}/clients/{id}")
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "name": ctx.target,
                    "description": format!("Updated role description - {}", ctx.epoch_seconds)
                })
            }),
            prefetch: true,
            ..task(
                "update/realm_role",
                Update,
                RealmRole,
                1.0,
                Put,
                "/admin/realms/{realm}/roles/{id}",
            )
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "attributes": {
                        "description": [format!("Updated group - {}", ctx.epoch_seconds)],
                        "lastModified": [ctx.epoch_seconds.to_string()]
                    }
                })
            }),
            prefetch: true,
            ..task("update/group", Update, Group, 1.0, Put, "/admin/realms/{realm}/groups/{id}")
        },
        TaskDefinition {
            payload_builder: Some(|ctx: &PayloadContext| {
                json!({
                    "displayName": format!("Updated Test Realm - {}", ctx.epoch_seconds),
                    "attributes": { "lastUpdated": ctx.epoch_seconds.to_string() }
                })
            }),
            ..task("update/realm_settings", Update, Realm, 1.0, Put, "/admin/realms/{realm}")
        },
        // delete
        task(
            "delete/user",
            TaskKind::Delete,
            User,
            1.0,
            Delete,
            "/admin/realms/{realm}/users/{id}",
        ),
        task(
            "delete/client",
            TaskKind::Delete,
            Client,
            1.0,
            Delete,
            "/admin/realms/{realm}/clients/{id}",
        ),
        task(
            "delete/realm_role",
            TaskKind::Delete,
            RealmRole,
            1.0,
            Delete,
            "/admin/realms/{realm}/roles/{id}",
        ),
        task(
            "delete/group",
            TaskKind::Delete,
            Group,
            1.0,
            Delete,
            "/admin/realms/{realm}/groups/{id}",
        ),
        task(
            "delete/client_scope",
            TaskKind::Delete,
            ClientScope,
            1.0,
            Delete,
            "/admin/realms/{realm}/client-scopes/{id}",
        ),
    ]
}
