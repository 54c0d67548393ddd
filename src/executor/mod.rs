//! Executor: running a scenario profile against the target.
//!
//! The [`Executor`] trait is the seam between the campaign and the strategy
//! that actually generates load. The built-in [`Scheduler`] ramps a population
//! of [`VirtualUser`]s at the profile's spawn rate, holds it until the
//! deadline and drains it.
pub mod scheduler;
pub mod user;

pub use scheduler::Scheduler;
pub use user::{UserState, VirtualUser, VirtualUserReport};

use std::{future::Future, sync::Arc};

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    api::Credentials, clock::WallClock, config::EngineConfig, metric::RequestOutcome,
    pool::ResourcePool, report::RunResult, scenario::ScenarioProfile,
};

/// Runs one scenario profile to completion.
///
/// `exec` resolves only once every virtual user has finished and the result
/// is final.
pub trait Executor
where
    Self: Send + Sync,
{
    type Error;

    fn exec(
        &self,
        profile: &ScenarioProfile,
    ) -> impl Future<Output = Result<RunResult, Self::Error>> + Send;
}

/// External request to end the current run early and skip what remains.
///
/// Cloning yields another handle to the same signal. Stopping is permanent.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`StopSignal::stop`] has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so this cannot fail
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every virtual user of one run.
pub struct ExecutionContext<A> {
    pub api: Arc<A>,
    pub config: Arc<EngineConfig>,
    pub credentials: Arc<Credentials>,
    pub pool: Arc<ResourcePool>,
    /// Realm the users work in.
    pub realm: Arc<str>,
    pub clock: WallClock,
    pub outcomes: mpsc::Sender<RequestOutcome>,
    /// Flips to `true` when users must drain.
    pub shutdown: watch::Receiver<bool>,
    /// End of the load phase.
    pub deadline: Instant,
}

impl<A> Clone for ExecutionContext<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            config: Arc::clone(&self.config),
            credentials: Arc::clone(&self.credentials),
            pool: Arc::clone(&self.pool),
            realm: Arc::clone(&self.realm),
            clock: self.clock,
            outcomes: self.outcomes.clone(),
            shutdown: self.shutdown.clone(),
            deadline: self.deadline,
        }
    }
}
