#![forbid(unsafe_code)]

//! JSON-over-HTTP rendition of the decoded OpenADR capability set, driven by a protocol gateway.

use crate::app_state::VtnState;
use crate::error::{Context, Error, Result};
use crate::protocol::{
    CreatedReport, EventResponse, PollRequest, RegistrationInfo, ReportOffer, UpdateReport,
};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Maps the error taxonomy onto HTTP status codes.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.root() {
            Error::RegistrationRejected { .. } => StatusCode::FORBIDDEN,
            Error::UnknownVen { .. } | Error::UnknownTask { .. } => StatusCode::NOT_FOUND,
            Error::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::DeliveryFailure(_) => StatusCode::BAD_GATEWAY,
            Error::Message(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(target: "vtn::http", status = status.as_u16(), error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn protocol_router(state: Arc<VtnState>) -> Router {
    Router::new()
        .route("/party/register", post(register_party))
        .route("/party/:ven_id", get(lookup_ven))
        .route("/report/register", post(register_report))
        .route("/report/created", post(created_report))
        .route("/report/update", post(update_report))
        .route("/poll", post(poll))
        .route("/event/response", post(event_response))
        .layer(Extension(state))
}

pub struct ProtocolServer {
    addr: SocketAddr,
}

impl ProtocolServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn serve(self, state: Arc<VtnState>, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind protocol listener on {}", self.addr))?;

        info!(target: "vtn::http", "protocol adapter listening on {}", self.addr);

        axum::serve(listener, protocol_router(state))
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await
            .context("protocol adapter exited abnormally")?;

        Ok(())
    }
}

async fn register_party(
    Extension(state): Extension<Arc<VtnState>>,
    Json(info): Json<RegistrationInfo>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.on_create_party_registration(&info).await?;
    Ok(Json(outcome))
}

async fn lookup_ven(
    Extension(state): Extension<Arc<VtnState>>,
    Path(ven_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let registration_id = state
        .ven_lookup(&ven_id)
        .ok_or_else(|| Error::UnknownVen {
            ven_id: ven_id.clone(),
        })?;
    Ok(Json(json!({
        "ven_id": ven_id,
        "registration_id": registration_id,
    })))
}

async fn register_report(
    Extension(state): Extension<Arc<VtnState>>,
    Json(offer): Json<ReportOffer>,
) -> ApiResult<impl IntoResponse> {
    let request = state.on_register_report(&offer).await?;
    Ok(Json(request))
}

async fn created_report(
    Extension(state): Extension<Arc<VtnState>>,
    Json(created): Json<CreatedReport>,
) -> ApiResult<impl IntoResponse> {
    let routes = state.on_created_report(&created).await?;
    Ok(Json(json!({ "routes": routes })))
}

async fn update_report(
    Extension(state): Extension<Arc<VtnState>>,
    Json(update): Json<UpdateReport>,
) -> impl IntoResponse {
    Json(state.on_update_report(&update).await)
}

async fn poll(
    Extension(state): Extension<Arc<VtnState>>,
    Json(request): Json<PollRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state.on_poll(&request.ven_id)?;
    Ok(Json(response))
}

async fn event_response(
    Extension(state): Extension<Arc<VtnState>>,
    Json(response): Json<EventResponse>,
) -> impl IntoResponse {
    state.on_event_response(&response);
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
