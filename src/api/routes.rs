use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{dataset, ingest, source, AppState};
use crate::services::EngineContext;

/// Largest accepted upload body
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Create router with application state
pub fn create_router_with_state(engine: Arc<EngineContext>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/ingest",
            post(ingest::ingest_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/datasets/preview", post(dataset::preview_dataset))
        .route("/api/datasets/query", post(dataset::query_dataset))
        .route("/api/sources/test", post(source::test_source))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let mut config = Config::default();
        config.inference.seed = Some(1);
        create_router_with_state(Arc::new(EngineContext::new(config)))
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_endpoint() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/ingest?filename=contacts.csv")
            .body(Body::from("id,email\n1,a@example.com\n2,b@example.com\n"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["row_count"], json!(2));
        assert_eq!(body["pii_columns"], json!(["email"]));
        assert_eq!(body["schema"][0]["inferred_semantic_type"], json!("integer"));
        assert!(body.get("table").is_none());
    }

    #[tokio::test]
    async fn test_ingest_then_query_saved_table() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/ingest?filename=sales.csv&save_as=sales")
            .body(Body::from("region,amount\nnorth,10\nsouth,4\nnorth,2\n"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["table"]["table_name"], json!("sales"));

        let response = app
            .oneshot(post_json(
                "/api/datasets/query",
                json!({
                    "source": {"kind": "embedded"},
                    "dataset": {"table_name": "sales"},
                    "filters": [{"column": "region", "operator": "=", "value": "north"}],
                    "aggregation": {"dimensions": ["region"], "metrics": {"amount": "sum"}}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["columns"], json!(["region", "amount_sum"]));
        assert_eq!(body["rows"], json!([["north", 12]]));
        assert_eq!(body["total_rows"], json!(1));
    }

    #[tokio::test]
    async fn test_unsupported_upload_format() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/ingest?filename=notes.txt")
            .body(Body::from("hello"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(json_body(response).await["error"]["code"], json!("UNSUPPORTED_FORMAT"));
    }

    #[tokio::test]
    async fn test_preview_rejects_non_select() {
        let response = app()
            .oneshot(post_json(
                "/api/datasets/preview",
                json!({
                    "source": {"kind": "embedded"},
                    "dataset": {"query": "DELETE FROM x"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], json!("NON_SELECT_QUERY"));
    }

    #[tokio::test]
    async fn test_source_test_endpoint() {
        let response = app()
            .oneshot(post_json("/api/sources/test", json!({"kind": "embedded"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["pool"]["live_handles"], json!(0));
    }
}
