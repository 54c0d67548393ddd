//! Shared record of the entities created during a run.
//!
//! Every virtual user registers what it creates and claims what it deletes
//! here. Each tracked type has its own lock, so users working on different
//! types never contend. A per-type floor keeps a minimum number of instances
//! alive so that the realm under test stays usable for the whole run.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::metric::ResourceType;

/// A live entity known to exist on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_type: ResourceType,
    pub identifier: String,
    /// Session label of the creator, `setup` for seeded records.
    pub created_by: String,
}

impl ResourceRecord {
    pub fn new(
        resource_type: ResourceType,
        identifier: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            identifier: identifier.into(),
            created_by: created_by.into(),
        }
    }
}

/// Minimum retained count per resource type. Fixed for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Floors {
    pub user: usize,
    pub client: usize,
    pub realm_role: usize,
    pub group: usize,
    pub client_scope: usize,
}

impl Floors {
    pub fn of(&self, resource_type: ResourceType) -> usize {
        match resource_type {
            ResourceType::User => self.user,
            ResourceType::Client => self.client,
            ResourceType::RealmRole => self.realm_role,
            ResourceType::Group => self.group,
            ResourceType::ClientScope => self.client_scope,
            ResourceType::Realm => 0,
        }
    }
}

impl Default for Floors {
    fn default() -> Self {
        Self {
            user: 1,
            client: 1,
            realm_role: 1,
            group: 0,
            client_scope: 0,
        }
    }
}

/// Point-in-time counts, used by the pure selection function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    counts: HashMap<ResourceType, usize>,
    floors: Floors,
}

impl PoolSnapshot {
    pub fn new(counts: HashMap<ResourceType, usize>, floors: Floors) -> Self {
        Self { counts, floors }
    }

    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.counts.get(&resource_type).copied().unwrap_or(0)
    }

    pub fn has_any(&self, resource_type: ResourceType) -> bool {
        self.count(resource_type) > 0
    }

    pub fn can_delete(&self, resource_type: ResourceType) -> bool {
        self.count(resource_type) > self.floors.of(resource_type)
    }
}

/// Records of one type. `index` maps identifiers to positions in `records`,
/// which stays dense so a random record is one index away.
#[derive(Debug, Default)]
struct Slot {
    records: Vec<ResourceRecord>,
    index: HashMap<String, usize>,
}

impl Slot {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn insert(&mut self, record: ResourceRecord) -> bool {
        if self.index.contains_key(&record.identifier) {
            return false;
        }
        self.index.insert(record.identifier.clone(), self.records.len());
        self.records.push(record);
        true
    }

    fn remove_at(&mut self, position: usize) -> ResourceRecord {
        let record = self.records.swap_remove(position);
        self.index.remove(&record.identifier);
        if let Some(moved) = self.records.get(position) {
            self.index.insert(moved.identifier.clone(), position);
        }
        record
    }

    fn remove(&mut self, identifier: &str) -> Option<ResourceRecord> {
        let position = *self.index.get(identifier)?;
        Some(self.remove_at(position))
    }
}

#[derive(Debug)]
pub struct ResourcePool {
    floors: Floors,
    slots: HashMap<ResourceType, Mutex<Slot>>,
}

impl ResourcePool {
    pub fn new(floors: Floors) -> Self {
        let slots = ResourceType::TRACKED
            .into_iter()
            .map(|t| (t, Mutex::new(Slot::default())))
            .collect();
        Self { floors, slots }
    }

    pub fn floors(&self) -> Floors {
        self.floors
    }

    pub fn floor(&self, resource_type: ResourceType) -> usize {
        self.floors.of(resource_type)
    }

    /// Adds a record. Returns `false` for untracked types and for identifiers
    /// that are already registered.
    pub fn register(&self, record: ResourceRecord) -> bool {
        match self.slots.get(&record.resource_type) {
            Some(slot) => slot.lock().insert(record),
            None => false,
        }
    }

    /// Forgets a record. Releasing an identifier that is not present is a no-op
    /// and returns `false`.
    pub fn release(&self, resource_type: ResourceType, identifier: &str) -> bool {
        self.slots
            .get(&resource_type)
            .is_some_and(|slot| slot.lock().remove(identifier).is_some())
    }

    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.slots
            .get(&resource_type)
            .map(|slot| slot.lock().len())
            .unwrap_or(0)
    }

    /// True iff one more delete would leave the type at or above its floor.
    pub fn can_delete(&self, resource_type: ResourceType) -> bool {
        self.count(resource_type) > self.floor(resource_type)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let counts = self
            .slots
            .iter()
            .map(|(t, slot)| (*t, slot.lock().len()))
            .collect();
        PoolSnapshot::new(counts, self.floors)
    }

    /// A random live identifier of the given type, left in the pool.
    pub fn pick<R: Rng + ?Sized>(&self, resource_type: ResourceType, rng: &mut R) -> Option<String> {
        let slot = self.slots.get(&resource_type)?.lock();
        if slot.records.is_empty() {
            return None;
        }
        let position = rng.random_range(0..slot.len());
        Some(slot.records[position].identifier.clone())
    }

    /// Removes and returns a random record if doing so keeps the type at or
    /// above its floor. The check and the removal happen under one lock, so
    /// concurrent deleters can never take the count below the floor.
    pub fn claim_for_delete<R: Rng + ?Sized>(
        &self,
        resource_type: ResourceType,
        rng: &mut R,
    ) -> Option<ResourceRecord> {
        let floor = self.floor(resource_type);
        let mut slot = self.slots.get(&resource_type)?.lock();
        if slot.len() <= floor {
            return None;
        }
        let position = rng.random_range(0..slot.len());
        Some(slot.remove_at(position))
    }

    /// Puts back a record whose delete did not go through.
    pub fn restore(&self, record: ResourceRecord) {
        if !self.register(record) {
            tracing::debug!("Restored record was already present");
        }
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(Floors::default())
    }
}
