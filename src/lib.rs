//! realmload: a virtual-user load generator for identity-management admin APIs.
//!
//! A run starts a population of virtual users against a Keycloak-style admin
//! API. Each user holds its own authenticated session, picks weighted
//! create/read/update/delete tasks over realms, users, clients, roles, groups
//! and client scopes, pauses between tasks, and records one outcome per
//! request. A shared resource pool keeps a floor of entities of every type
//! alive so that reads, updates and deletes always have something to work on.
//!
//! # Architecture
//!
//! - [`ScenarioProfile`]: how many users, how fast to start them, for how long.
//! - [`Executor`]: runs one profile. The built-in [`Scheduler`] prepares an
//!   isolated realm, ramps [`VirtualUser`]s at the spawn rate, drains them at
//!   the deadline and tears the realm down again.
//! - [`Metric`]: one observed sample. Every request yields a [`RequestOutcome`].
//! - [`Aggregate`]: collects metrics from all users into one log.
//! - [`Report`]: derived statistics, see [`report::RunSummary`].
//! - [`Reporter`]: sends a finished [`report::RunResult`] somewhere (stdout,
//!   CSV and summary files).
//! - [`campaign::Campaign`]: several profiles in sequence with a cooldown.
//!
//! The target itself sits behind the [`api::IdentityApi`] trait, implemented
//! over HTTP by [`api::HttpIdentityApi`].

/// Metric aggregators
pub mod aggregate;
/// The target API boundary
pub mod api;
/// Scenario sequencing
pub mod campaign;
/// Task definitions and payload generation
pub mod catalog;
/// Command line arguments of the binary
pub mod cli;
pub mod clock;
/// Engine configuration
pub mod config;
pub mod error;
/// Orchestration of virtual users
pub mod executor;
/// Single metrics
pub mod metric;
/// Shared registry of live entities
pub mod pool;
/// Reports and Reporters
pub mod report;
/// Load profiles
pub mod scenario;
/// Task selection
pub mod selector;
/// Per-user authenticated sessions
pub mod session;

#[cfg(test)]
mod mock;

/// Attribute macros deriving [`Metric`] and [`Aggregate`] boilerplate.
pub mod macros {
    pub use realmload_macros::*;
}

pub use aggregate::Aggregate;
pub use executor::{Executor, Scheduler, VirtualUser};
pub use metric::{Metric, RequestOutcome};
pub use report::{Report, Reporter};
pub use scenario::ScenarioProfile;
