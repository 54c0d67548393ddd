//! Picks the next task for a virtual user.
//!
//! [`plan`] is a pure function of the catalog, a pool snapshot and a random
//! source. [`TaskSelector::next`] runs it against the live pool and then binds
//! a concrete target, claiming the record atomically for deletes.

use rand::Rng;

use crate::{
    catalog::{TaskCatalog, TaskDefinition},
    metric::TaskKind,
    pool::{PoolSnapshot, ResourcePool, ResourceRecord},
};

/// Outcome of the pure selection step.
#[derive(Debug, Clone, Copy)]
pub struct Plan<'a> {
    pub definition: &'a TaskDefinition,
    /// An update or delete was replaced by a read of the same resource type.
    pub redirected: bool,
}

/// Resource addressed by a planned update or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Identifier picked for an update. The record stays in the pool.
    Update(String),
    /// Record claimed (removed from the pool) for a delete.
    Delete(ResourceRecord),
}

impl Target {
    pub fn identifier(&self) -> &str {
        match self {
            Target::Update(id) => id,
            Target::Delete(record) => &record.identifier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedTask<'a> {
    pub definition: &'a TaskDefinition,
    pub target: Option<Target>,
    pub redirected: bool,
}

fn viable(definition: &TaskDefinition, snapshot: &PoolSnapshot) -> bool {
    if !definition.needs_target() {
        return true;
    }
    match definition.kind {
        TaskKind::Update => snapshot.has_any(definition.resource_type),
        TaskKind::Delete => snapshot.can_delete(definition.resource_type),
        TaskKind::Create | TaskKind::Read => true,
    }
}

/// Samples a task and applies the read fallback for updates without a target
/// and deletes that would breach the floor. Deterministic for equal inputs.
pub fn plan<'a, R: Rng + ?Sized>(
    catalog: &'a TaskCatalog,
    snapshot: &PoolSnapshot,
    rng: &mut R,
) -> Plan<'a> {
    let chosen = catalog.sample(rng);
    if viable(chosen, snapshot) {
        return Plan {
            definition: chosen,
            redirected: false,
        };
    }
    match catalog.read_for(chosen.resource_type) {
        Some(read) => Plan {
            definition: read,
            redirected: true,
        },
        None => Plan {
            definition: chosen,
            redirected: false,
        },
    }
}

/// Stateless between calls; holds no session affinity.
#[derive(Debug, Clone, Copy)]
pub struct TaskSelector<'a> {
    catalog: &'a TaskCatalog,
}

impl<'a> TaskSelector<'a> {
    pub fn new(catalog: &'a TaskCatalog) -> Self {
        Self { catalog }
    }

    pub fn next<R: Rng + ?Sized>(&self, pool: &ResourcePool, rng: &mut R) -> PlannedTask<'a> {
        let Plan {
            definition,
            redirected,
        } = plan(self.catalog, &pool.snapshot(), rng);

        if !definition.needs_target() {
            return PlannedTask {
                definition,
                target: None,
                redirected,
            };
        }

        let resource_type = definition.resource_type;
        let target = match definition.kind {
            TaskKind::Update => pool.pick(resource_type, rng).map(Target::Update),
            TaskKind::Delete => pool
                .claim_for_delete(resource_type, rng)
                .map(Target::Delete),
            TaskKind::Create | TaskKind::Read => None,
        };

        match (target, self.catalog.read_for(resource_type)) {
            (Some(target), _) => PlannedTask {
                definition,
                target: Some(target),
                redirected,
            },
            // the pool changed between snapshot and binding
            (None, Some(read)) => {
                tracing::debug!(task = definition.name, "Target vanished, reading instead");
                PlannedTask {
                    definition: read,
                    target: None,
                    redirected: true,
                }
            }
            (None, None) => PlannedTask {
                definition,
                target: None,
                redirected,
            },
        }
    }
}
