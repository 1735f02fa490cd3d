use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use clawhub_reconciler::{DriftDetector, Reconciler};
use clawhub_store::StateStore;
use tower_http::trace::TraceLayer;

use crate::auth::require_auth_token;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(
    store: Arc<dyn StateStore>,
    reconciler: Arc<Reconciler>,
    drift: Arc<DriftDetector>,
    auth_token: Arc<String>,
) -> Router {
    let state = AppState {
        store,
        reconciler,
        drift,
        auth_token,
    };

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // Instances
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/:id",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/:id/manifest", put(handlers::put_manifest))
        .route("/instances/:id/reconcile", post(handlers::post_reconcile))
        .route("/instances/:id/stop", post(handlers::post_stop))
        .route("/instances/:id/restart", post(handlers::post_restart))
        .route("/instances/:id/resources", put(handlers::put_resources))
        .route("/instances/:id/logs", get(handlers::get_logs))
        .route("/instances/:id/doctor", get(handlers::get_doctor))
        .route("/instances/:id/drift", get(handlers::get_instance_drift))
        // Drift
        .route("/drift/scan", post(handlers::post_drift_scan))
        // Events
        .route("/events", get(handlers::list_events))
        // Status
        .route("/status", get(handlers::status))
        // Auth middleware applies to all routes above
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use base64::Engine as _;
    use clawhub_gateway::GatewayPool;
    use clawhub_reconciler::{BroadcastEvents, LifecycleManager, PolicyAudit, PreprocessorChain};
    use clawhub_store::InMemoryStore;
    use clawhub_target::TargetRegistry;
    use tower::util::ServiceExt;

    const TEST_TOKEN: &str = "test-token";

    fn test_app() -> Router {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let registry = Arc::new(TargetRegistry::new());
        let gateway = Arc::new(GatewayPool::new());
        let events = Arc::new(BroadcastEvents::default());
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            registry,
            gateway.clone(),
            events,
        ));
        let chain = Arc::new(PreprocessorChain::with_builtins());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            lifecycle,
            chain.clone(),
            Arc::new(PolicyAudit),
            None,
        ));
        let drift = Arc::new(DriftDetector::new(store.clone(), gateway, chain, None));
        build_app(store, reconciler, drift, Arc::new(TEST_TOKEN.to_string()))
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {}", TEST_TOKEN))
    }

    #[tokio::test]
    async fn unauthenticated_request_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("Authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn basic_auth_with_correct_token_returns_200() {
        let app = test_app();
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("clawhub:{}", TEST_TOKEN));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("Authorization", format!("Basic {}", credentials))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/health")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_returns_200_with_empty_store() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/ready")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn instances_empty_list() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/instances")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn instance_not_found_returns_404() {
        let app = test_app();
        let resp = app
            .oneshot(
                authed(Request::builder().uri("/instances/nonexistent"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_then_get_instance() {
        let app = test_app();
        let body = serde_json::json!({
            "name": "alpha",
            "deploymentType": "local_docker",
            "manifest": {
                "apiVersion": "v2",
                "metadata": { "name": "alpha", "environment": "dev" },
                "spec": { "openclawConfig": {} }
            }
        });
        let resp = app
            .clone()
            .oneshot(
                authed(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/instances")
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body.to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .oneshot(authed(Request::builder().uri("/instances")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/status")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn events_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/events")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reconcile_unknown_instance_returns_404() {
        let app = test_app();
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/instances/ghost/reconcile"),
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
