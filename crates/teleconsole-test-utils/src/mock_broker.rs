//! In-process mock of the broker's HTTP surface.
//!
//! Implements the control protocol the client speaks, backed by a hash map
//! instead of a proxy fleet. Tests mutate [`MockBroker::state`] to stage
//! redirects, warnings, and party counts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use teleconsole_core::constants::CLIENT_VERSION_HEADER;
use teleconsole_core::session::{Session, SessionStats, ServerVersion};

/// Mutable broker-side state, shared with the test body.
#[derive(Default)]
pub struct BrokerState {
    /// Sessions by web session id.
    pub sessions: HashMap<String, Session>,
    /// Proxy address stamped into every created session.
    pub proxy_host_port: String,
    /// Stats returned for any known session.
    pub stats: SessionStats,
    /// Warning banner attached to the version response.
    pub warning: String,
    /// Redirect targets still to serve from `/api/version`, in order.
    pub redirects: Vec<String>,
    /// Client version header observed on the last request.
    pub last_client_version: Option<String>,
    /// Number of times the internal session id was published, per session.
    pub publishes: HashMap<String, usize>,
}

/// A running mock broker bound to an ephemeral localhost port.
pub struct MockBroker {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<BrokerState>>,
}

type Shared = Arc<Mutex<BrokerState>>;

impl MockBroker {
    /// Start the mock with a default state.
    pub async fn start() -> Self {
        Self::with_state(BrokerState {
            proxy_host_port: "proxy.invalid:3023".into(),
            ..Default::default()
        })
        .await
    }

    pub async fn with_state(state: BrokerState) -> Self {
        let state = Arc::new(Mutex::new(state));
        let app = Router::new()
            .route("/ping", get(|| async { StatusCode::OK }))
            .route("/api/version", get(version))
            .route("/api/sessions", post(create_session))
            .route("/api/sessions/{id}", get(get_session))
            .route("/api/sessions/{id}/stats", get(get_stats))
            .route("/api/session/{id}", post(publish))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let addr = listener.local_addr().expect("mock broker addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock broker serve");
        });
        MockBroker { addr, state }
    }

    /// `host:port` of this mock.
    pub fn host_port(&self) -> String {
        self.addr.to_string()
    }
}

fn record_version(state: &Shared, headers: &HeaderMap) {
    let version = headers
        .get(CLIENT_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.lock().unwrap().last_client_version = version;
}

async fn version(State(state): State<Shared>, headers: HeaderMap) -> Response {
    record_version(&state, &headers);
    let mut guard = state.lock().unwrap();
    if !guard.redirects.is_empty() {
        let location = guard.redirects.remove(0);
        return (
            StatusCode::TEMPORARY_REDIRECT,
            [("Location", location)],
        )
            .into_response();
    }
    Json(ServerVersion {
        server_version: "mock".into(),
        warning: guard.warning.clone(),
    })
    .into_response()
}

async fn create_session(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(mut session): Json<Session>,
) -> Response {
    record_version(&state, &headers);
    let mut guard = state.lock().unwrap();
    session.proxy_host_port = guard.proxy_host_port.clone();
    guard.sessions.insert(session.id.clone(), session.clone());
    Json(session).into_response()
}

async fn get_session(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let guard = state.lock().unwrap();
    match guard.sessions.get(&id) {
        Some(session) => Json(session.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"message": format!("session {id} not found")})),
        )
            .into_response(),
    }
}

async fn get_stats(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let guard = state.lock().unwrap();
    if !guard.sessions.contains_key(&id) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"message": format!("session {id} not found")})),
        )
            .into_response();
    }
    Json(guard.stats.clone()).into_response()
}

async fn publish(
    State(state): State<Shared>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    let mut guard = state.lock().unwrap();
    *guard.publishes.entry(id.clone()).or_insert(0) += 1;
    match guard.sessions.get_mut(&id) {
        Some(session) => {
            session.tsid = body;
            StatusCode::OK.into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"message": format!("session {id} not found")})),
        )
            .into_response(),
    }
}
