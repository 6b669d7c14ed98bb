//! REST endpoints for the registration workflow.
//!
//! Thin translation layer: handlers deserialize the request, call one
//! engine operation, and map the outcome. Workflow errors carry a stable
//! machine-readable `reason` next to the human-readable `error` text.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::error::RegistrationError;

use super::engine::{PaymentRequest, RegistrationEngine, StartRegistration};
use super::model::{BillingCycle, ClinicData, PaymentMethod};

/// Shared state for registration routes.
#[derive(Clone)]
pub struct RegistrationRouteState {
    pub engine: Arc<RegistrationEngine>,
}

// ── Request bodies ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StartBody {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub registration_id: Uuid,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ClinicBody {
    pub registration_id: Uuid,
    #[serde(flatten)]
    pub clinic: ClinicData,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionBody {
    pub registration_id: Uuid,
    pub tier_code: String,
    pub billing_cycle: BillingCycle,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentBody {
    pub registration_id: Uuid,
    pub method: PaymentMethod,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: rust_decimal::Decimal,
    pub currency: String,
    #[serde(default)]
    pub provider_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentBody {
    pub registration_id: Uuid,
    #[serde(default)]
    pub provider_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub registration_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ResendBody {
    pub email: String,
}

// ── Error mapping ───────────────────────────────────────────────────

/// Wrapper giving [`RegistrationError`] an HTTP shape.
pub struct ApiError(RegistrationError);

impl From<RegistrationError> for ApiError {
    fn from(e: RegistrationError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use RegistrationError as E;
        let status = match &self.0 {
            E::AccountExists(_) | E::ClinicExists(_) => StatusCode::CONFLICT,
            E::NotFound(_) | E::NoActiveRegistration(_) => StatusCode::NOT_FOUND,
            E::Database(e) => {
                // Storage details stay out of the response body.
                error!(error = %e, "Storage failure while handling registration request");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "Internal storage error",
                        "reason": self.0.reason(),
                    })),
                )
                    .into_response();
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "reason": self.0.reason(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Handlers ────────────────────────────────────────────────────────

/// POST /api/registration/start
async fn start(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<StartBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state
        .engine
        .start(StartRegistration {
            email: body.email,
            name: body.name,
            password: body.password,
            source: body.source,
            referrer: body.referrer,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(snap)))
}

/// POST /api/registration/verify
async fn verify(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<VerifyBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state
        .engine
        .verify_email(body.registration_id, &body.code)
        .await?;
    Ok(Json(snap))
}

/// POST /api/registration/clinic-data
async fn clinic_data(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<ClinicBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state
        .engine
        .submit_clinic_data(body.registration_id, body.clinic)
        .await?;
    Ok(Json(snap))
}

/// POST /api/registration/subscription
async fn subscription(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<SubscriptionBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state
        .engine
        .select_subscription(
            body.registration_id,
            &body.tier_code,
            body.billing_cycle,
            &body.currency,
        )
        .await?;
    Ok(Json(snap))
}

/// POST /api/registration/payment
async fn payment(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<PaymentBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state
        .engine
        .process_payment(
            body.registration_id,
            PaymentRequest {
                method: body.method,
                amount: body.amount,
                currency: body.currency,
                provider_ref: body.provider_ref,
            },
        )
        .await?;
    Ok(Json(snap))
}

/// POST /api/registration/payment/confirm
async fn confirm_payment(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<ConfirmPaymentBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state
        .engine
        .confirm_payment(body.registration_id, body.provider_ref)
        .await?;
    Ok(Json(snap))
}

/// POST /api/registration/complete
async fn complete(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<CompleteBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state.engine.complete_registration(body.registration_id).await?;
    Ok(Json(snap))
}

/// GET /api/registration/status/{id}
async fn status(
    State(state): State<RegistrationRouteState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let snap = state.engine.status(id).await?;
    Ok(Json(snap))
}

/// POST /api/registration/cancel/{id}
async fn cancel(
    State(state): State<RegistrationRouteState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.engine.cancel(id).await?;
    Ok(Json(serde_json::json!({"cancelled": true})))
}

/// POST /api/registration/resend
async fn resend(
    State(state): State<RegistrationRouteState>,
    Json(body): Json<ResendBody>,
) -> ApiResult<impl IntoResponse> {
    let snap = state.engine.resend_code(&body.email).await?;
    Ok(Json(snap))
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the registration REST routes.
pub fn registration_routes(state: RegistrationRouteState) -> Router {
    Router::new()
        .route("/api/registration/start", post(start))
        .route("/api/registration/verify", post(verify))
        .route("/api/registration/clinic-data", post(clinic_data))
        .route("/api/registration/subscription", post(subscription))
        .route("/api/registration/payment", post(payment))
        .route("/api/registration/payment/confirm", post(confirm_payment))
        .route("/api/registration/complete", post(complete))
        .route("/api/registration/status/{id}", get(status))
        .route("/api/registration/cancel/{id}", post(cancel))
        .route("/api/registration/resend", post(resend))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
