use crate::app_state::VtnState;
use crate::config::ManagementConfig;
use crate::domain::duration_secs;
use crate::error::{Context, Result};
use crate::metrics::{metrics as metrics_collector, render_prometheus};
use crate::transport::ApiError;
use axum::body::Body;
use axum::extract::Path;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Operator command surface plus the metrics endpoint.
pub struct ManagementServer {
    addr: SocketAddr,
    metrics_path: String,
}

impl ManagementServer {
    pub fn build(config: &ManagementConfig) -> Result<Self> {
        Ok(Self {
            addr: config
                .socket_addr()
                .context("invalid management listener address")?,
            metrics_path: config.metrics_path.clone(),
        })
    }

    pub fn router(&self, state: Arc<VtnState>) -> Router {
        Router::new()
            .route("/live", get(live))
            .route("/tasks", get(list_tasks).post(create_task))
            .route("/tasks/:task_id", delete(cancel_task))
            .route(self.metrics_path.as_str(), get(metrics))
            .layer(Extension(state))
    }

    pub async fn serve(self, state: Arc<VtnState>, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind management listener on {}", self.addr))?;

        let router = self.router(state);

        tracing::info!(target: "vtn::management", "management server listening on {}", self.addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await
            .context("management server exited abnormally")?;

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub ven_id: String,
    /// Absent or zero schedules a single round.
    #[serde(default, deserialize_with = "optional_period")]
    pub period: Option<Duration>,
    #[serde(default)]
    pub value: Option<f64>,
}

fn optional_period<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Period(#[serde(with = "duration_secs")] Duration);

    Ok(Option::<Period>::deserialize(deserializer)?
        .map(|Period(period)| period)
        .filter(|period| !period.is_zero()))
}

async fn live(Extension(state): Extension<Arc<VtnState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "vtn_id": state.vtn_id,
            "vens": state.registry.len(),
            "tasks": state.list_tasks().len(),
        })),
    )
}

async fn list_tasks(Extension(state): Extension<Arc<VtnState>>) -> impl IntoResponse {
    Json(state.list_tasks())
}

async fn create_task(
    Extension(state): Extension<Arc<VtnState>>,
    Json(request): Json<CreateTaskRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let task_id = state.create_event(&request.ven_id, request.period, request.value)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "task_id": task_id,
            "ven_id": request.ven_id,
        })),
    ))
}

async fn cancel_task(
    Extension(state): Extension<Arc<VtnState>>,
    Path(task_id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let cancelled = state.cancel_task(&task_id)?;
    Ok(Json(cancelled))
}

async fn metrics(Extension(state): Extension<Arc<VtnState>>) -> Response {
    let body = render_prometheus(&metrics_collector().snapshot(), &state.sink.snapshot());

    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
