use std::{sync::Arc, time::Duration};

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::ExecutionContext;
use crate::{
    api::{ApiRequest, ApiResponse, IdentityApi},
    catalog::{HttpMethod, PayloadContext, TaskDefinition, merge_json},
    error::ApiError,
    metric::{OutcomeStatus, RequestOutcome, TaskKind},
    pool::ResourceRecord,
    selector::{PlannedTask, Target, TaskSelector},
    session::{Session, TokenGuard},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Spawning,
    Active,
    Draining,
    Done,
}

/// What happened to one virtual user during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualUserReport {
    pub virtual_user_id: usize,
    pub state: UserState,
    /// Why the session could not be established. The user never ran.
    pub startup_failure: Option<String>,
    pub session_expired: bool,
    /// Time between session loss and the run deadline.
    pub downtime: Duration,
    pub requests: usize,
}

impl VirtualUserReport {
    pub fn new(virtual_user_id: usize) -> Self {
        Self {
            virtual_user_id,
            state: UserState::Spawning,
            startup_failure: None,
            session_expired: false,
            downtime: Duration::ZERO,
            requests: 0,
        }
    }
}

/// One simulated admin client.
///
/// Owns its session and random source. Shutdown is only honoured during the
/// think pause, so a request that has started is always completed and
/// recorded.
pub struct VirtualUser<A> {
    id: usize,
    ctx: ExecutionContext<A>,
    rng: StdRng,
    report: VirtualUserReport,
}

impl<A: IdentityApi> VirtualUser<A> {
    pub fn new(id: usize, ctx: ExecutionContext<A>, rng: StdRng) -> Self {
        Self {
            id,
            ctx,
            rng,
            report: VirtualUserReport::new(id),
        }
    }

    fn label(&self) -> String {
        format!("vu-{}", self.id)
    }

    fn transition(&mut self, state: UserState) {
        tracing::debug!(user = self.id, from = ?self.report.state, to = ?state, "State change");
        self.report.state = state;
    }

    pub async fn run(mut self) -> VirtualUserReport {
        let session = Arc::new(Session::new(
            self.id,
            Arc::clone(&self.ctx.api),
            Arc::clone(&self.ctx.credentials),
            self.ctx.config.refresh_interval,
        ));
        if let Err(e) = session.establish().await {
            tracing::warn!(user = self.id, "Virtual user failed to start: {e}");
            self.report.startup_failure = Some(e.to_string());
            self.transition(UserState::Done);
            return self.report;
        }
        let refresher = session.spawn_refresher(self.ctx.shutdown.clone());
        self.transition(UserState::Active);

        let mut shutdown = self.ctx.shutdown.clone();
        loop {
            let think = self.ctx.config.think_time.sample(&mut self.rng);
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    self.transition(UserState::Draining);
                    break;
                }
                _ = tokio::time::sleep(think) => {}
            }

            if session.is_terminated() {
                let lost_at = session.terminated_at().await.unwrap_or_else(Instant::now);
                self.report.session_expired = true;
                self.report.downtime = self.ctx.deadline.saturating_duration_since(lost_at);
                tracing::warn!(
                    user = self.id,
                    downtime = ?self.report.downtime,
                    "Session expired, virtual user stops"
                );
                break;
            }

            let outcome = self.step(&session).await;
            self.report.requests += 1;
            if self.ctx.outcomes.send(outcome).await.is_err() {
                tracing::debug!(user = self.id, "Outcome channel closed");
                break;
            }
        }

        refresher.abort();
        self.transition(UserState::Done);
        self.report
    }

    /// Selects, executes and records one task.
    async fn step(&mut self, session: &Session<A>) -> RequestOutcome {
        let selector = TaskSelector::new(&self.ctx.config.catalog);
        let PlannedTask {
            definition,
            target,
            redirected,
        } = selector.next(&self.ctx.pool, &mut self.rng);
        tracing::debug!(user = self.id, task = definition.name, redirected, "Executing task");

        let payload_ctx = PayloadContext::generate(
            &mut self.rng,
            self.ctx.clock.now(),
            target.as_ref().map(|t| t.identifier().to_owned()),
        );
        let payload = definition.build_payload(&payload_ctx);
        let path = definition.render_path(
            &self.ctx.realm,
            target.as_ref().map(Target::identifier),
        );

        let started = Instant::now();
        let result = match session.authorize().await {
            Ok(guard) => execute(&*self.ctx.api, &guard, definition, path, payload.clone()).await,
            Err(e) => Err(ApiError::Transport(e.to_string())),
        };
        let latency = started.elapsed();

        let (status, http_status, error_detail) = match &result {
            Ok(response) if response.is_success() => (OutcomeStatus::Success, Some(response.status), None),
            Ok(response) => (
                OutcomeStatus::Failure,
                Some(response.status),
                Some(format!("HTTP {}", response.status)),
            ),
            Err(e) => (OutcomeStatus::Failure, None, Some(e.to_string())),
        };

        self.settle(definition, target, payload.as_ref(), &result);

        RequestOutcome {
            timestamp: self.ctx.clock.now(),
            virtual_user_id: self.id,
            task: definition.name.to_owned(),
            task_kind: definition.kind,
            resource_type: definition.resource_type,
            latency,
            status,
            http_status,
            error_detail,
            redirected,
        }
    }

    /// Keeps the pool in line with what the target now holds.
    fn settle(
        &self,
        definition: &TaskDefinition,
        target: Option<Target>,
        payload: Option<&Value>,
        result: &Result<ApiResponse, ApiError>,
    ) {
        let response = result.as_ref().ok();
        let succeeded = response.is_some_and(ApiResponse::is_success);

        match (definition.kind, target) {
            (TaskKind::Create, _) if succeeded => {
                let identifier =
                    response.and_then(|r| definition.created_identifier(r, payload));
                match identifier {
                    Some(id) => {
                        self.ctx.pool.register(ResourceRecord::new(
                            definition.resource_type,
                            id,
                            self.label(),
                        ));
                    }
                    None => tracing::debug!(
                        user = self.id,
                        task = definition.name,
                        "Created entity has no identifier, not tracked"
                    ),
                }
            }
            // the record was already taken out of the pool when it was claimed
            (TaskKind::Delete, Some(Target::Delete(_))) if succeeded => {}
            (TaskKind::Delete, Some(Target::Delete(record))) => {
                if response.is_some_and(|r| r.status == 404) {
                    tracing::debug!(user = self.id, id = record.identifier, "Entity already gone");
                } else {
                    self.ctx.pool.restore(record);
                }
            }
            _ => {}
        }
    }
}

/// Sends the request for `definition`. Tasks with `prefetch` read the current
/// representation first and send it back with the payload merged in; both
/// requests count toward the latency.
async fn execute<A: IdentityApi>(
    api: &A,
    guard: &TokenGuard<'_>,
    definition: &TaskDefinition,
    path: String,
    payload: Option<Value>,
) -> Result<ApiResponse, ApiError> {
    if !definition.prefetch {
        let request = ApiRequest::new(definition.method, path)
            .with_query(definition.query)
            .with_body(payload);
        return api.execute(guard.token(), &request).await;
    }

    let current = api
        .execute(
            guard.token(),
            &ApiRequest::new(HttpMethod::Get, path.clone()).expecting_body(),
        )
        .await?;
    if !current.is_success() {
        return Ok(current);
    }
    let mut body = current.body.unwrap_or(Value::Object(Default::default()));
    if let Some(patch) = payload {
        merge_json(&mut body, patch);
    }
    let request = ApiRequest::new(definition.method, path).with_body(Some(body));
    api.execute(guard.token(), &request).await
}
