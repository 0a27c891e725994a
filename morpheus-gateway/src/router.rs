use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::ExtensionRejection, ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use morpheus::{Envelope, Mesh, MeshError, Service};

/// Default RPC deadline when the request carries no `timeout` parameter.
const DEFAULT_TIMEOUT_SECS: u64 = 1;

/// Shared gateway state: one mesh handle serving every request.
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub mesh: Arc<Mesh>,
}

/// Build the gateway router.
///
/// | method/path | behavior |
/// |---|---|
/// | GET `/health` | liveness no-op, 200 |
/// | GET `/services` | current live-service snapshot as JSON |
/// | GET `/favicon.ico` | 404 without further processing |
/// | ANY `/svc/{*rest}` | resolve + RPC proxy |
///
/// Under `/svc/` the first path segment is the logical service name and the
/// whole trailing path is the route, so `/svc/test` resolves
/// `("test", "/test")` and `/svc/test/sub` resolves `("test", "/test/sub")`
/// by prefix; the optional `timeout` query parameter is the RPC deadline in
/// whole seconds, default 1.
pub fn create_router(mesh: Arc<Mesh>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/services", get(list_services))
        .route("/favicon.ico", get(favicon))
        .route("/svc/{*rest}", any(handle_rpc))
        .with_state(GatewayState { mesh })
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn favicon() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn list_services(
    State(state): State<GatewayState>,
) -> Result<Json<Vec<Service>>, GatewayError> {
    Ok(Json(state.mesh.list_services().await?))
}

#[derive(Debug, Deserialize)]
struct RpcParams {
    timeout: Option<u64>,
}

/// Split `/svc/{*rest}` into the service name and its route.
///
/// The service name is the first path segment; the route is the whole
/// trailing path including that segment, matching how services register
/// their routes.
fn split_target(rest: &str) -> (&str, String) {
    let name = match rest.split_once('/') {
        Some((name, _)) => name,
        None => rest,
    };
    (name, format!("/{rest}"))
}

/// Translate one HTTP request into a resolve-then-RPC cycle.
///
/// Outcomes map to distinct statuses: no live match is 404, a reply is 200
/// carrying the reply envelope as JSON, and the deadline elapsing without a
/// reply is 504.
async fn handle_rpc(
    State(state): State<GatewayState>,
    Path(rest): Path<String>,
    Query(params): Query<RpcParams>,
    connect_info: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    body: Option<Json<Value>>,
) -> Result<Json<Envelope>, GatewayError> {
    let (service_name, route) = split_target(&rest);
    let timeout = Duration::from_secs(params.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));

    let target = state.mesh.resolver().resolve(service_name, &route).await?;

    // Peer address is only present when served through
    // `into_make_service_with_connect_info`.
    let from = match connect_info {
        Ok(ConnectInfo(addr)) => format!("client:{}", addr.ip()),
        Err(_) => "client:unknown".to_string(),
    };
    let payload = body.map(|Json(value)| value).unwrap_or(Value::Null);
    let request = Envelope::request(from, &target, &route, payload);

    debug!(
        service = %target.key(),
        route,
        timeout_secs = timeout.as_secs(),
        "proxying rpc"
    );
    match state.mesh.rpc().rpc_with_timeout(&request, timeout).await? {
        Some(reply) => Ok(Json(reply)),
        None => Err(GatewayError::Timeout {
            service: service_name.to_string(),
            route,
            timeout,
        }),
    }
}

/// Gateway-level failures, each mapped to a distinct HTTP status.
#[derive(Debug)]
pub enum GatewayError {
    /// No reply arrived within the RPC deadline
    Timeout {
        service: String,
        route: String,
        timeout: Duration,
    },
    /// Mesh-level failure (resolution, broker, serialization)
    Mesh(MeshError),
}

impl From<MeshError> for GatewayError {
    fn from(err: MeshError) -> Self {
        Self::Mesh(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            GatewayError::Timeout {
                service,
                route,
                timeout,
            } => (
                StatusCode::GATEWAY_TIMEOUT,
                serde_json::json!({
                    "error": format!(
                        "no reply from '{service}' for '{route}' within {}s",
                        timeout.as_secs()
                    ),
                    "code": "GATEWAY_TIMEOUT",
                }),
            ),
            GatewayError::Mesh(MeshError::NotFound { service, route }) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({
                    "error": format!("no live instance of '{service}' matching '{route}'"),
                    "code": "SERVICE_NOT_FOUND",
                }),
            ),
            GatewayError::Mesh(err) => {
                warn!(error = %err, "gateway error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({
                        "error": "internal gateway error",
                        "code": "GATEWAY_ERROR",
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use morpheus::{MeshConfig, Route};
    use tower::ServiceExt;

    async fn test_mesh() -> Arc<Mesh> {
        let config = MeshConfig {
            mock: true,
            ..Default::default()
        };
        let mesh = Arc::new(Mesh::connect(config).await.unwrap());
        mesh.register(
            "test",
            0,
            vec![Route::with_handler("/test", |envelope| async move {
                Ok(Some(envelope.payload))
            })],
        )
        .await
        .unwrap();
        mesh.register(
            "slow",
            0,
            vec![Route::with_handler("/slow", |_| async { Ok(None) })],
        )
        .await
        .unwrap();
        mesh
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[test]
    fn test_split_target() {
        assert_eq!(
            split_target("echo/job/1"),
            ("echo", "/echo/job/1".to_string())
        );
        assert_eq!(split_target("echo"), ("echo", "/echo".to_string()));
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let router = create_router(test_mesh().await);
        let request = Request::builder()
            .method("POST")
            .uri("/svc/test?timeout=2")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"hello":"world"}"#))
            .unwrap();

        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"], serde_json::json!({"hello": "world"}));
        assert_eq!(body["route"], "/test");
        assert_eq!(body["to"], "client:unknown");
        assert!(body["response_channel"].is_null());
    }

    #[tokio::test]
    async fn test_nested_path_matches_route_prefix() {
        let router = create_router(test_mesh().await);
        let request = Request::builder()
            .method("POST")
            .uri("/svc/test/sub/1?timeout=2")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"n":1}"#))
            .unwrap();

        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"], serde_json::json!({"n": 1}));
        assert_eq!(body["route"], "/test/sub/1");
    }

    #[tokio::test]
    async fn test_unknown_service_is_404() {
        let router = create_router(test_mesh().await);
        let request = Request::builder()
            .uri("/svc/unknown?timeout=1")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "SERVICE_NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_service_is_gateway_timeout() {
        let router = create_router(test_mesh().await);
        let started = tokio::time::Instant::now();
        let request = Request::builder()
            .uri("/svc/slow?timeout=1")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "GATEWAY_TIMEOUT");
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_services_listing() {
        let router = create_router(test_mesh().await);
        let request = Request::builder()
            .uri("/services")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|svc| svc["name"].as_str().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"test"));
        assert!(names.contains(&"slow"));
    }

    #[tokio::test]
    async fn test_favicon_and_health() {
        let router = create_router(test_mesh().await);
        let request = Request::builder()
            .uri("/favicon.ico")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router.clone(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
    }
}
