use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_sdk::{
    JobBackend, JobId, JobRoutes, JobStatus, MetricsClient, MetricsError, PageRequest,
    PagedBackend, QueryParameters,
};
use serde_json::{json, Value};

const TOKEN: &str = "secret-token";

#[derive(Clone, Default)]
struct ServerState {
    result_hits: Arc<AtomicUsize>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TOKEN}"))
        .unwrap_or(false)
}

async fn submit(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "bad token"})));
    }
    assert_eq!(body["table_name"], "acme");
    (StatusCode::OK, Json(json!({"job_id": "job-42"})))
}

async fn status(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "status": "processing",
        "progress": format!("crunching {id}"),
        "elapsed_seconds": 4.6
    }))
}

async fn result(
    State(state): State<ServerState>,
    Path(_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if state.result_hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "not ready"})));
    }
    (
        StatusCode::OK,
        Json(json!({"data": [{"city": "Recife", "orders": 2}], "count": 1})),
    )
}

async fn orders(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["offset"] == 500 {
        return (StatusCode::BAD_REQUEST, Json(json!({"detail": "offset too large"})));
    }
    let offset = body["offset"].as_u64().unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({"data": [{"order_id": offset}], "total_rows": 1})),
    )
}

async fn spawn_server() -> String {
    let app = Router::new()
        .route("/overview/jobs", post(submit))
        .route("/overview/jobs/:id/status", get(status))
        .route("/overview/jobs/:id/result", get(result))
        .route("/metrics/orders", post(orders))
        .with_state(ServerState::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn job_endpoints_round_trip() {
    let base = spawn_server().await;
    let client = MetricsClient::new(base, TOKEN);
    let jobs = client.jobs(JobRoutes::new("/overview"));
    let params = QueryParameters::new("acme").unwrap();

    let job_id = jobs.submit_job(&params).await.unwrap().into_job_id().unwrap();
    assert_eq!(job_id, JobId::new("job-42"));

    let report = jobs.job_status(&job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Processing);
    assert_eq!(report.progress.as_deref(), Some("crunching job-42"));
    assert_eq!(report.elapsed_seconds, Some(4.6));

    let first = jobs.job_result(&job_id).await.unwrap_err();
    assert!(first.is_not_ready());
    let second = jobs.job_result(&job_id).await.unwrap();
    assert_eq!(second.count, Some(1));
    assert_eq!(second.data[0].dimension_value("city"), "Recife");
}

#[tokio::test]
async fn rejected_token_is_not_retryable() {
    let base = spawn_server().await;
    let client = MetricsClient::new(base, "wrong");
    let err = client
        .jobs(JobRoutes::new("/overview"))
        .submit_job(&QueryParameters::new("acme").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, MetricsError::Unauthorized));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn paged_endpoint_posts_window() {
    let base = spawn_server().await;
    let client = MetricsClient::new(base, TOKEN);
    let orders_endpoint = client.paged("metrics/orders");
    let mut request = PageRequest {
        parameters: QueryParameters::new("acme").unwrap(),
        limit: 100,
        offset: 300,
    };
    let page = orders_endpoint.fetch_page(&request).await.unwrap();
    assert_eq!(page.total_rows, Some(1));
    assert_eq!(page.data[0].number("order_id"), 300.0);

    request.offset = 500;
    let err = orders_endpoint.fetch_page(&request).await.unwrap_err();
    match err {
        MetricsError::UnexpectedStatus { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert!(body.contains("offset too large"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}
