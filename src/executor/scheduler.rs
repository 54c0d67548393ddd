//! The virtual-user scheduler.
//!
//! A run goes through these phases:
//! 1. Readiness: the target is probed until it answers or the attempts run out.
//! 2. Setup: a setup token is obtained, the isolated realm is created and the
//!    resource pool is seeded up to its floors.
//! 3. Spawn: every `spawn_tick` a batch of users is started. The batch size is
//!    `spawn_rate * tick`, with the fractional part carried to the next tick so
//!    the long-term rate is exact.
//! 4. Hold and drain: at the deadline (or on stop) shutdown is broadcast and
//!    every user finishes its in-flight request.
//! 5. Teardown: the isolated realm is deleted. Failures here are only logged.
//!
//! The load phase starts when spawning begins. Users that were not spawned
//! before the deadline are never created.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::{ExecutionContext, Executor, StopSignal, VirtualUser, VirtualUserReport};
use crate::{
    aggregate::{OutcomeLog, aggregator_task},
    api::{ApiRequest, IdentityApi},
    catalog::{HttpMethod, PayloadContext},
    clock::WallClock,
    config::{EngineConfig, RealmStrategy},
    error::{ApiError, RunError},
    metric::ResourceType,
    pool::{ResourcePool, ResourceRecord},
    report::RunResult,
    scenario::ScenarioProfile,
};

/// Largest batch started in one tick.
const MAX_BATCH: usize = 1 << 20;

/// Extra create attempts per floored type when the target reports a name
/// conflict.
const SEED_RETRIES: usize = 3;

/// Pure function computing how many users to start this tick.
///
/// Returns `(users_to_start, next_fractional_part)`.
pub fn calc_spawn_batch(spawn_rate: f64, tick: Duration, fractional: f64) -> (usize, f64) {
    let add_f = spawn_rate * tick.as_secs_f64() + fractional;
    let whole = add_f.floor();
    let fractional = add_f - whole;

    let batch = if whole >= MAX_BATCH as f64 {
        MAX_BATCH
    } else if whole < 0.0 || whole.is_nan() {
        0
    } else {
        whole as usize
    };
    (batch, fractional)
}

/// Runs scenario profiles with a ramped population of [`VirtualUser`]s.
#[derive(TypedBuilder)]
pub struct Scheduler<A> {
    api: Arc<A>,
    #[builder(default = Arc::new(EngineConfig::default()))]
    config: Arc<EngineConfig>,
    /// Ends the current run early when triggered.
    #[builder(default)]
    stop: StopSignal,
    #[builder(default = Duration::from_secs(1))]
    spawn_tick: Duration,
    /// Timestamps of every run come from this clock. Share it with the
    /// campaign so that results of consecutive runs line up.
    #[builder(default)]
    clock: WallClock,
    /// Runs started so far. Each run draws from its own random streams.
    #[builder(default, setter(skip))]
    runs: AtomicU64,
}

/// Realm prepared for one run.
struct Setup {
    realm: String,
    isolated: bool,
}

impl<A: IdentityApi> Scheduler<A> {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    async fn wait_until_ready(&self) -> Result<(), RunError> {
        let attempts = self.config.readiness_attempts.max(1);
        let mut last = ApiError::Transport("not probed".into());

        for attempt in 1..=attempts {
            match self.api.probe(&self.config.credentials).await {
                Ok(()) => {
                    tracing::info!("Target ready after {attempt} attempt(s)");
                    return Ok(());
                }
                Err(e) => {
                    tracing::info!("Target not ready ({attempt}/{attempts}): {e}");
                    last = e;
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.readiness_interval) => {}
                    _ = self.stop.stopped() => break,
                }
            }
        }
        Err(RunError::Unreachable {
            attempts,
            source: last,
        })
    }

    async fn setup_token(&self) -> Result<String, ApiError> {
        Ok(self
            .api
            .authenticate(&self.config.credentials)
            .await?
            .access_token)
    }

    async fn setup(&self, run: u64, pool: &ResourcePool) -> Result<Setup, RunError> {
        let token = self
            .setup_token()
            .await
            .map_err(|e| RunError::Setup(format!("setup authentication failed: {e}")))?;
        let mut rng = self.config.rng(run, u64::MAX);

        let setup = match &self.config.realm {
            RealmStrategy::Fixed(realm) => Setup {
                realm: realm.clone(),
                isolated: false,
            },
            RealmStrategy::Isolated => {
                let realm = RealmStrategy::isolated_name(&mut rng);
                let request = ApiRequest::new(HttpMethod::Post, "/admin/realms").with_body(Some(
                    json!({
                        "realm": realm,
                        "displayName": format!("Test Realm {realm}"),
                        "enabled": true
                    }),
                ));
                let response = self
                    .api
                    .execute(&token, &request)
                    .await
                    .map_err(|e| RunError::Setup(format!("creating realm {realm}: {e}")))?;
                if !response.is_success() {
                    return Err(RunError::Setup(format!(
                        "creating realm {realm}: HTTP {}",
                        response.status
                    )));
                }
                tracing::info!(realm, "Created isolated realm");
                Setup {
                    realm,
                    isolated: true,
                }
            }
        };

        if let Err(e) = self.seed(&token, &setup.realm, pool, &mut rng).await {
            self.teardown(&setup).await;
            return Err(e);
        }
        Ok(setup)
    }

    /// Creates `floor(t)` entities of every floored type. A name conflict is
    /// retried with a fresh payload a few times.
    async fn seed(
        &self,
        token: &str,
        realm: &str,
        pool: &ResourcePool,
        rng: &mut rand::rngs::StdRng,
    ) -> Result<(), RunError> {
        for resource_type in ResourceType::TRACKED {
            let floor = pool.floor(resource_type);
            if floor == 0 {
                continue;
            }
            let definition = self.config.catalog.create_for(resource_type).ok_or_else(|| {
                RunError::Setup(format!("no create task to seed {resource_type}"))
            })?;

            let mut attempts = 0;
            while pool.count(resource_type) < floor {
                if attempts == floor + SEED_RETRIES {
                    return Err(RunError::Setup(format!(
                        "seeding {resource_type}: gave up after {attempts} attempts"
                    )));
                }
                attempts += 1;

                let payload =
                    definition.build_payload(&PayloadContext::generate(rng, self.clock.now(), None));
                let request = ApiRequest::new(definition.method, definition.render_path(realm, None))
                    .with_body(payload.clone());
                let response = self
                    .api
                    .execute(token, &request)
                    .await
                    .map_err(|e| RunError::Setup(format!("seeding {resource_type}: {e}")))?;
                if response.status == 409 {
                    tracing::debug!(realm, "Seeded {resource_type} name is taken, retrying");
                    continue;
                }
                if !response.is_success() {
                    return Err(RunError::Setup(format!(
                        "seeding {resource_type}: HTTP {}",
                        response.status
                    )));
                }
                let identifier = definition
                    .created_identifier(&response, payload.as_ref())
                    .ok_or_else(|| {
                        RunError::Setup(format!("seeded {resource_type} has no identifier"))
                    })?;
                if !pool.register(ResourceRecord::new(resource_type, identifier.clone(), "setup")) {
                    return Err(RunError::Setup(format!(
                        "seeding {resource_type}: target returned known identifier {identifier}"
                    )));
                }
            }
        }
        tracing::info!(realm, "Seeded resource pool to its floors");
        Ok(())
    }

    async fn teardown(&self, setup: &Setup) {
        if !setup.isolated {
            return;
        }
        let result = async {
            let token = self.setup_token().await?;
            let request =
                ApiRequest::new(HttpMethod::Delete, format!("/admin/realms/{}", setup.realm));
            self.api.execute(&token, &request).await
        }
        .await;

        match result {
            Ok(response) if response.is_success() => {
                tracing::info!(realm = setup.realm, "Deleted isolated realm");
            }
            Ok(response) => tracing::warn!(
                realm = setup.realm,
                "Failed to delete isolated realm: HTTP {}",
                response.status
            ),
            Err(e) => tracing::warn!(realm = setup.realm, "Failed to delete isolated realm: {e}"),
        }
    }

    async fn run(&self, profile: &ScenarioProfile) -> Result<RunResult, RunError> {
        let clock = self.clock;
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            scenario = profile.name(),
            users = profile.virtual_user_count(),
            spawn_rate = profile.spawn_rate(),
            duration = ?profile.duration(),
            "Starting scenario"
        );

        self.wait_until_ready().await?;
        let pool = Arc::new(ResourcePool::new(self.config.floors));
        let setup = self.setup(run, &pool).await?;

        let (outcomes_tx, outcomes_rx) = mpsc::channel(self.config.outcome_channel_capacity.max(1));
        let aggregator = tokio::spawn(aggregator_task::<OutcomeLog>(
            outcomes_rx,
            self.config.outcome_channel_capacity.max(1),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let start = Instant::now();
        let deadline = start + profile.duration();
        let ctx = ExecutionContext {
            api: Arc::clone(&self.api),
            config: Arc::clone(&self.config),
            credentials: Arc::new(self.config.credentials.clone()),
            pool,
            realm: Arc::from(setup.realm.as_str()),
            clock,
            outcomes: outcomes_tx,
            shutdown: shutdown_rx,
            deadline,
        };

        let handles = self.spawn_users(&ctx, profile, run, deadline).await;
        tracing::info!("Spawned {} of {} users", handles.len(), profile.virtual_user_count());

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!("Deadline reached, draining users...");
            }
            _ = self.stop.stopped() => {
                tracing::info!("Stop requested, draining users...");
            }
        }
        shutdown_tx.send_replace(true);

        let users: Vec<VirtualUserReport> = join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(id, res)| match res {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!("Virtual user {id} panicked: {e}");
                    VirtualUserReport::new(id)
                }
            })
            .collect();

        // the aggregator stops once the last sender is gone
        drop(ctx);
        let log = match aggregator.await {
            Ok(log) => log,
            Err(e) => {
                tracing::error!("Aggregator task failed: {e}");
                OutcomeLog::default()
            }
        };
        let end = clock.now();

        self.teardown(&setup).await;

        let result = RunResult::completed(profile.clone(), clock.at(start), end, log, users);
        tracing::info!(
            scenario = profile.name(),
            requests = result.summary.overall.count,
            failures = result.summary.overall.failures,
            "Scenario finished"
        );
        Ok(result)
    }

    async fn spawn_users(
        &self,
        ctx: &ExecutionContext<A>,
        profile: &ScenarioProfile,
        run: u64,
        deadline: Instant,
    ) -> Vec<tokio::task::JoinHandle<VirtualUserReport>> {
        let total = profile.virtual_user_count();
        let mut handles = Vec::with_capacity(total);
        let mut fractional = 0.0;
        let mut next_tick = Instant::now();

        while handles.len() < total && Instant::now() < deadline {
            let (batch, f) = calc_spawn_batch(profile.spawn_rate(), self.spawn_tick, fractional);
            fractional = f;

            for _ in 0..batch.min(total - handles.len()) {
                let id = handles.len();
                let user = VirtualUser::new(id, ctx.clone(), self.config.rng(run, id as u64));
                handles.push(tokio::spawn(user.run()));
            }
            if batch > 0 {
                tracing::debug!("Spawned {}/{total} users", handles.len());
            }

            next_tick += self.spawn_tick;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick.min(deadline)) => {}
                _ = self.stop.stopped() => break,
            }
        }
        handles
    }
}

impl<A: IdentityApi> Executor for Scheduler<A> {
    type Error = RunError;

    async fn exec(&self, profile: &ScenarioProfile) -> Result<RunResult, RunError> {
        self.run(profile).await.inspect_err(|e| {
            tracing::error!(scenario = profile.name(), "Scenario failed to start: {e}");
        })
    }
}
