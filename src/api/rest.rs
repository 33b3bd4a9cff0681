//! REST API Handlers
//!
//! Open Service Broker v2 endpoints on top of the lifecycle controller:
//! catalog, instances, bindings and last-operation polling, plus health
//! and readiness probes.

use crate::broker::Broker;
use crate::domain::records::{
    BindDetails, DeprovisionDetails, ProvisionDetails, UnbindDetails, UpdateDetails,
};
use crate::error::{Error, ErrorKind};
use crate::metrics::BrokerMetrics;
use axum::{
    extract::{rejection::JsonRejection, Json, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Query of instance create/update requests
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AsyncQuery {
    #[serde(default)]
    pub accepts_incomplete: bool,
}

/// Query of instance/binding delete requests
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

/// Query of last-operation polls
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastOperationQuery {
    #[serde(default)]
    pub operation: Option<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub description: String,
}

/// Basic-auth credentials guarding the `/v2` routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

impl BrokerCredentials {
    /// Whether an `Authorization` header value carries these credentials
    fn accepts(&self, header_value: &str) -> bool {
        let Some(encoded) = header_value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };

        match decoded.split_once(':') {
            Some((username, password)) => username == self.username && password == self.password,
            None => false,
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Broker error rendered as an OSB error response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self.0.kind() {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "NotFound"),
            ErrorKind::Conflict => (StatusCode::CONFLICT, "Conflict"),
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "BadRequest"),
            ErrorKind::Unsupported => (StatusCode::UNPROCESSABLE_ENTITY, "UnsupportedOperation"),
            ErrorKind::Configuration
            | ErrorKind::Backend
            | ErrorKind::Persistence
            | ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }

        (
            status,
            Json(ApiErrorResponse {
                error: code.to_string(),
                description: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn malformed_body(rejection: JsonRejection) -> ApiError {
    ApiError(Error::InvalidRequest(rejection.body_text()))
}

type ApiResult = std::result::Result<Response, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    broker: Arc<Broker>,
    metrics: Arc<BrokerMetrics>,
    credentials: Option<BrokerCredentials>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(broker: Arc<Broker>, metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            broker,
            metrics,
            credentials: None,
        }
    }

    /// Require basic auth on the `/v2` routes
    pub fn with_credentials(mut self, credentials: Option<BrokerCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            broker: self.broker,
            metrics: self.metrics,
            credentials: self.credentials.map(Arc::new),
        };

        let osb = Router::new()
            .route("/v2/catalog", get(catalog))
            .route(
                "/v2/service_instances/:instance_id",
                put(provision).delete(deprovision).patch(update),
            )
            .route(
                "/v2/service_instances/:instance_id/last_operation",
                get(last_operation),
            )
            .route(
                "/v2/service_instances/:instance_id/service_bindings/:binding_id",
                put(bind).delete(unbind),
            )
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_basic_auth,
            ));

        Router::new()
            .merge(osb)
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
    metrics: Arc<BrokerMetrics>,
    credentials: Option<Arc<BrokerCredentials>>,
}

impl AppState {
    fn record<T>(&self, operation: &str, started: Instant, result: &std::result::Result<T, ApiError>) {
        self.metrics
            .observe(operation, result.is_ok(), started.elapsed());
    }
}

async fn require_basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(credentials) = &state.credentials else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| credentials.accepts(value))
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejecting unauthenticated request");
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"broker\"")],
            Json(ApiErrorResponse {
                error: "Unauthorized".into(),
                description: "valid basic auth credentials are required".into(),
            }),
        )
            .into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Marketplace catalog
async fn catalog(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let services = state.broker.services();
    state.metrics.observe("catalog", true, started.elapsed());

    (StatusCode::OK, Json(json!({ "services": services })))
}

/// Provision a service instance
async fn provision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    body: std::result::Result<Json<ProvisionDetails>, JsonRejection>,
) -> ApiResult {
    let started = Instant::now();
    let result: ApiResult = async {
        let Json(details) = body.map_err(malformed_body)?;
        let spec = state
            .broker
            .provision(&instance_id, details, query.accepts_incomplete)
            .await?;
        Ok((StatusCode::CREATED, Json(spec)).into_response())
    }
    .await;

    state.record("provision", started, &result);
    result
}

/// Deprovision a service instance
async fn deprovision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult {
    let started = Instant::now();
    let details = DeprovisionDetails {
        service_id: query.service_id,
        plan_id: query.plan_id,
    };

    let result = match state
        .broker
        .deprovision(&instance_id, details, query.accepts_incomplete)
        .await
    {
        Ok(spec) => Ok((StatusCode::OK, Json(spec)).into_response()),
        Err(Error::InstanceDoesNotExist { .. }) => {
            Ok((StatusCode::GONE, Json(json!({}))).into_response())
        }
        Err(e) => Err(ApiError(e)),
    };

    state.record("deprovision", started, &result);
    result
}

/// Update a service instance
async fn update(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    body: std::result::Result<Json<UpdateDetails>, JsonRejection>,
) -> ApiResult {
    let started = Instant::now();
    let result: ApiResult = async {
        let Json(details) = body.map_err(malformed_body)?;
        let spec = state
            .broker
            .update(&instance_id, details, query.accepts_incomplete)
            .await?;
        Ok((StatusCode::OK, Json(spec)).into_response())
    }
    .await;

    state.record("update", started, &result);
    result
}

/// Poll the last operation of an instance
async fn last_operation(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<LastOperationQuery>,
) -> ApiResult {
    let started = Instant::now();
    let result = state
        .broker
        .last_operation(&instance_id, query.operation.as_deref())
        .await
        .map(|op| (StatusCode::OK, Json(op)).into_response())
        .map_err(ApiError);

    state.record("last_operation", started, &result);
    result
}

/// Bind a service instance
async fn bind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    body: std::result::Result<Json<BindDetails>, JsonRejection>,
) -> ApiResult {
    let started = Instant::now();
    let result: ApiResult = async {
        let Json(details) = body.map_err(malformed_body)?;
        let binding = state.broker.bind(&instance_id, &binding_id, details).await?;
        Ok((StatusCode::CREATED, Json(binding)).into_response())
    }
    .await;

    state.record("bind", started, &result);
    result
}

/// Unbind a service instance
async fn unbind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult {
    let started = Instant::now();
    let details = UnbindDetails {
        service_id: query.service_id,
        plan_id: query.plan_id,
    };

    let result = match state.broker.unbind(&instance_id, &binding_id, details).await {
        Ok(()) => Ok((StatusCode::OK, Json(json!({}))).into_response()),
        Err(Error::BindingDoesNotExist { .. }) => {
            Ok((StatusCode::GONE, Json(json!({}))).into_response())
        }
        Err(e) => Err(ApiError(e)),
    };

    state.record("unbind", started, &result);
    result
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: every configured driver answers its probe
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.broker.drivers_health().await;
    let ready = health.values().all(|healthy| *healthy);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(json!({ "ready": ready, "drivers": health })))
}
