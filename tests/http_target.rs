//! Drives the scheduler over real HTTP against a small in-process admin API.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::Mutex;
use realmload::{
    Executor, Scheduler, ScenarioProfile,
    api::{Credentials, HttpIdentityApi, IdentityApi},
    config::{EngineConfig, ThinkTime},
    executor::UserState,
    metric::OutcomeStatus,
};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Default)]
struct Target {
    tokens: AtomicU64,
    next_id: AtomicU64,
    realms_created: Mutex<Vec<String>>,
    realms_deleted: Mutex<Vec<String>>,
    unauthorized: AtomicU64,
}

async fn token(State(target): State<Arc<Target>>, body: Bytes) -> Response {
    let form = String::from_utf8_lossy(&body);
    if form.contains("password=wrong") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let n = target.tokens.fetch_add(1, Ordering::Relaxed);
    Json(json!({
        "access_token": format!("token-{n}"),
        "expires_in": 300,
        "refresh_token": format!("refresh-{n}"),
    }))
    .into_response()
}

async fn realm_info(Path(realm): Path<String>) -> Json<serde_json::Value> {
    Json(json!({ "realm": realm }))
}

async fn admin(
    State(target): State<Arc<Target>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer token-"));
    if !authorized {
        target.unauthorized.fetch_add(1, Ordering::Relaxed);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let path = uri.path().to_owned();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match method {
        Method::POST if path == "/admin/realms" => {
            let payload: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let realm = payload["realm"].as_str().unwrap_or_default().to_owned();
            target.realms_created.lock().push(realm.clone());
            (
                StatusCode::CREATED,
                [(header::LOCATION, format!("http://target/admin/realms/{realm}"))],
            )
                .into_response()
        }
        Method::POST => {
            let id = target.next_id.fetch_add(1, Ordering::Relaxed);
            (
                StatusCode::CREATED,
                [(header::LOCATION, format!("http://target{path}/id-{id}"))],
            )
                .into_response()
        }
        Method::GET => {
            let id = segments.last().copied().unwrap_or_default();
            Json(json!({ "id": id, "name": id, "attributes": {} })).into_response()
        }
        Method::PUT => StatusCode::NO_CONTENT.into_response(),
        Method::DELETE => {
            if let ["admin", "realms", realm] = segments.as_slice() {
                target.realms_deleted.lock().push((*realm).to_owned());
            }
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn serve() -> (SocketAddr, Arc<Target>) {
    let target = Arc::new(Target::default());
    let router = Router::new()
        .route("/realms/{realm}/protocol/openid-connect/token", post(token))
        .route("/realms/{realm}", get(realm_info))
        .fallback(admin)
        .with_state(target.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, target)
}

fn config(addr: SocketAddr) -> EngineConfig {
    EngineConfig::builder()
        .base_url(format!("http://{addr}"))
        .think_time(ThinkTime::new(Duration::from_millis(50), Duration::from_millis(100)).unwrap())
        .request_timeout(Duration::from_secs(5))
        .readiness_attempts(3)
        .readiness_interval(Duration::from_millis(100))
        .seed(11)
        .build()
}

#[tokio::test]
async fn http_api_speaks_the_token_protocol() {
    let (addr, target) = serve().await;
    let api = HttpIdentityApi::new(format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
    let credentials = Credentials::default();

    api.probe(&credentials).await.unwrap();
    let grant = api.authenticate(&credentials).await.unwrap();
    assert_eq!(grant.access_token, "token-0");
    assert_eq!(grant.ttl(), Duration::from_secs(300));

    let refreshed = api.refresh(&credentials, &grant).await.unwrap();
    assert_eq!(refreshed.access_token, "token-1");
    assert_eq!(target.tokens.load(Ordering::Relaxed), 2);

    let wrong = Credentials {
        password: "wrong".into(),
        ..Credentials::default()
    };
    assert!(api.authenticate(&wrong).await.is_err());
}

#[tokio::test]
async fn short_run_over_http() {
    let (addr, target) = serve().await;
    let api = HttpIdentityApi::new(format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    let scheduler = Scheduler::builder()
        .api(Arc::new(api))
        .config(Arc::new(config(addr)))
        .spawn_tick(Duration::from_millis(100))
        .build();
    let profile = ScenarioProfile::new("smoke", 4, 20.0, Duration::from_secs(2)).unwrap();

    let result = scheduler.exec(&profile).await.unwrap();

    assert!(result.is_completed());
    assert_eq!(result.users.len(), 4);
    assert!(result.users.iter().all(|u| u.state == UserState::Done));
    assert!(result.outcomes.len() >= 20, "{} outcomes", result.outcomes.len());
    assert!(
        result
            .outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::Success),
        "{:?}",
        result.outcomes.iter().find(|o| !o.is_success())
    );
    assert_eq!(target.unauthorized.load(Ordering::Relaxed), 0);

    let created = target.realms_created.lock().clone();
    assert_eq!(created.len(), 1);
    assert!(created[0].starts_with("loadtest-"));
    assert_eq!(*target.realms_deleted.lock(), created);
}

#[tokio::test]
async fn bad_credentials_fail_setup() {
    let (addr, _target) = serve().await;
    let mut config = config(addr);
    config.credentials.password = "wrong".into();
    let scheduler = Scheduler::builder()
        .api(Arc::new(
            HttpIdentityApi::new(format!("http://{addr}"), Duration::from_secs(5)).unwrap(),
        ))
        .config(Arc::new(config))
        .build();
    let profile = ScenarioProfile::new("smoke", 1, 1.0, Duration::from_secs(1)).unwrap();

    let err = scheduler.exec(&profile).await.unwrap_err();
    assert!(err.to_string().contains("setup"), "{err}");
}
