//! In-memory stand-in for the admin API, used by unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

use crate::{
    api::{ApiRequest, ApiResponse, Credentials, IdentityApi, TokenGrant},
    catalog::HttpMethod,
    error::ApiError,
};

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Applied to every call.
    pub latency: Duration,
    /// Number of probes that fail before the target counts as reachable.
    pub unready_probes: u32,
    pub reachable: bool,
    pub fail_auth: bool,
    pub fail_refresh: bool,
    /// Every n-th executed request answers 500.
    pub error_every: Option<u64>,
    /// Deletes answer 404, as if the entity were already gone.
    pub deletes_missing: bool,
    /// Creates reusing a name seen before on the same path answer 409, the
    /// way a persistent realm does.
    pub unique_names: bool,
    /// Every create answers with this identifier in `Location`.
    pub fixed_identifier: Option<String>,
    pub token_ttl: u64,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            unready_probes: 0,
            reachable: true,
            fail_auth: false,
            fail_refresh: false,
            error_every: None,
            deletes_missing: false,
            unique_names: false,
            fixed_identifier: None,
            token_ttl: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub method: HttpMethod,
    pub path: String,
    pub status: u16,
}

#[derive(Debug, Default)]
pub struct MockIdentityApi {
    behavior: Mutex<MockBehavior>,
    issued: Mutex<HashMap<String, Instant>>,
    calls: Mutex<Vec<RecordedCall>>,
    names: Mutex<HashSet<String>>,
    max_token_age: Mutex<Duration>,
    probes: AtomicU32,
    tokens: AtomicU64,
    refreshes: AtomicU64,
    executed: AtomicU64,
    ids: AtomicU64,
}

impl MockIdentityApi {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Default::default()
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn tokens_issued(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Oldest token age seen when a request was issued.
    pub fn max_token_age(&self) -> Duration {
        *self.max_token_age.lock()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// False if the create reuses a name already taken on its path.
    fn claim_name(&self, request: &ApiRequest) -> bool {
        let name = request.body.as_ref().and_then(|body| {
            ["username", "clientId", "name", "realm"]
                .iter()
                .find_map(|field| body.get(*field).and_then(|v| v.as_str()))
        });
        match name {
            Some(name) => self.names.lock().insert(format!("{}#{name}", request.path)),
            None => true,
        }
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior.lock().clone()
    }

    fn issue(&self, ttl: u64) -> TokenGrant {
        let n = self.tokens.fetch_add(1, Ordering::SeqCst);
        let access_token = format!("token-{n}");
        self.issued.lock().insert(access_token.clone(), Instant::now());
        TokenGrant {
            access_token,
            expires_in: ttl,
            refresh_token: Some(format!("refresh-{n}")),
        }
    }
}

impl IdentityApi for MockIdentityApi {
    async fn probe(&self, _: &Credentials) -> Result<(), ApiError> {
        let behavior = self.behavior();
        let attempt = self.probes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(behavior.latency).await;
        if !behavior.reachable || attempt < behavior.unready_probes {
            return Err(ApiError::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn authenticate(&self, _: &Credentials) -> Result<TokenGrant, ApiError> {
        let behavior = self.behavior();
        tokio::time::sleep(behavior.latency).await;
        if behavior.fail_auth {
            return Err(ApiError::Status {
                status: 401,
                body: "invalid_grant".into(),
            });
        }
        Ok(self.issue(behavior.token_ttl))
    }

    async fn refresh(&self, _: &Credentials, _: &TokenGrant) -> Result<TokenGrant, ApiError> {
        let behavior = self.behavior();
        tokio::time::sleep(behavior.latency).await;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if behavior.fail_refresh {
            return Err(ApiError::Status {
                status: 400,
                body: "refresh rejected".into(),
            });
        }
        Ok(self.issue(behavior.token_ttl))
    }

    async fn execute(&self, token: &str, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let behavior = self.behavior();
        let issued_at = self.issued.lock().get(token).copied();
        let Some(issued_at) = issued_at else {
            return Ok(ApiResponse {
                status: 401,
                location: None,
                body: None,
            });
        };
        {
            let age = Instant::now().duration_since(issued_at);
            let mut max = self.max_token_age.lock();
            *max = (*max).max(age);
        }

        let n = self.executed.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(behavior.latency).await;

        let failing = behavior.error_every.is_some_and(|every| n % every == 0);
        let response = match request.method {
            _ if failing => ApiResponse {
                status: 500,
                location: None,
                body: None,
            },
            HttpMethod::Post if behavior.unique_names && !self.claim_name(request) => ApiResponse {
                status: 409,
                location: None,
                body: None,
            },
            HttpMethod::Post => {
                let id = match &behavior.fixed_identifier {
                    Some(id) => id.clone(),
                    None => format!("id-{}", self.ids.fetch_add(1, Ordering::SeqCst)),
                };
                ApiResponse {
                    status: 201,
                    location: Some(format!("http://mock{}/{id}", request.path)),
                    body: None,
                }
            }
            HttpMethod::Get => ApiResponse {
                status: 200,
                location: None,
                body: request
                    .want_body
                    .then(|| json!({ "id": "mock", "name": "mock", "attributes": {} })),
            },
            HttpMethod::Put => ApiResponse {
                status: 204,
                location: None,
                body: None,
            },
            HttpMethod::Delete if behavior.deletes_missing => ApiResponse {
                status: 404,
                location: None,
                body: None,
            },
            HttpMethod::Delete => ApiResponse {
                status: 204,
                location: None,
                body: None,
            },
        };

        self.calls.lock().push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            status: response.status,
        });
        Ok(response)
    }
}
