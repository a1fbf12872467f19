//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::auth::{require_admin, AuthUser};
use crate::donations::{self, DonationCheckout, StartDonation};
use crate::errors::{ErrorClass, LedgerError};
use crate::ledger::{self, BalanceSummary};
use crate::models::{ProviderKind, Withdrawal, WithdrawalStatus};
use crate::money::{amount_from_f64, amount_from_str};
use crate::notify::Notifier;
use crate::providers::Providers;
use crate::reconciliation::{PaymentStatusView, Reconciler};
use crate::withdrawals::{self, PayoutNotices, WithdrawalRequest};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub providers: Providers,
    pub notifier: Arc<dyn Notifier>,
    pub reconciler: Arc<Reconciler>,
    pub admin_email: String,
    pub admin_api_key: Option<String>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/withdrawals", post(create_withdrawal).get(get_withdrawals))
        .route("/ecopoints/:id/balance", get(get_balance))
        .route("/donations", post(create_donation))
        .route("/webhooks/:provider", post(receive_webhook))
        .route("/payments/:payment_id/status", get(get_payment_status))
        .route("/admin/withdrawals/:id/status", post(set_withdrawal_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl LedgerError {
    fn status_code(&self) -> StatusCode {
        match (self.class(), self) {
            (ErrorClass::Authorization, LedgerError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            (ErrorClass::Authorization, _) => StatusCode::FORBIDDEN,
            (ErrorClass::NotFound, _) => StatusCode::NOT_FOUND,
            (ErrorClass::Validation | ErrorClass::Conflict | ErrorClass::Permanent, _) => {
                StatusCode::BAD_REQUEST
            }
            (ErrorClass::Transient, _) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {self}");
        } else {
            debug!("Request rejected: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                success: false,
                message: self.user_message(),
            }),
        )
            .into_response()
    }
}

impl From<JsonRejection> for LedgerError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => LedgerError::MissingFields(e.body_text()),
            other => LedgerError::BadRequest(other.body_text()),
        }
    }
}

type ApiResult<T> = Result<Json<T>, LedgerError>;

/// `Json` whose rejections go through [`LedgerError`], so malformed bodies
/// get the same `{success, message}` shape as every other error.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = LedgerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(JsonBody(value))
    }
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Amounts arrive as JSON numbers from most clients and as strings from
/// form-driven ones.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum AmountField {
    Number(f64),
    Text(String),
}

impl AmountField {
    fn to_decimal(&self) -> Result<rust_decimal::Decimal, LedgerError> {
        match self {
            AmountField::Number(n) => amount_from_f64(*n),
            AmountField::Text(s) => amount_from_str(s),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateWithdrawalBody {
    pub ecopoint_id: String,
    pub amount_gross: AmountField,
    pub pix_key: String,
    pub pix_key_type: String,
}

#[derive(Serialize)]
pub struct WithdrawalCreated {
    pub success: bool,
    pub withdrawal_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_gross: rust_decimal::Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub platform_fee: rust_decimal::Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_net: rust_decimal::Decimal,
    pub status: WithdrawalStatus,
}

#[derive(Deserialize)]
pub struct WithdrawalFilter {
    pub ecopoint_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateDonationBody {
    pub ecopoint_id: String,
    pub amount_cents: i64,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusChangeBody {
    pub status: WithdrawalStatus,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /withdrawals`
pub async fn create_withdrawal(
    State(state): State<Arc<ApiState>>,
    AuthUser(user_id): AuthUser,
    JsonBody(body): JsonBody<CreateWithdrawalBody>,
) -> ApiResult<WithdrawalCreated> {
    let request = WithdrawalRequest {
        ecopoint_id: body.ecopoint_id,
        amount_gross: body.amount_gross.to_decimal()?,
        pix_key: body.pix_key.trim().to_string(),
        pix_key_type: body.pix_key_type,
    };
    let notices = PayoutNotices {
        notifier: state.notifier.as_ref(),
        admin_email: &state.admin_email,
    };
    let w = withdrawals::request_withdrawal(&state.pool, &notices, &user_id, &request).await?;

    Ok(Json(WithdrawalCreated {
        success: true,
        withdrawal_id: w.id,
        amount_gross: w.amount_gross,
        platform_fee: w.platform_fee,
        amount_net: w.amount_net,
        status: w.status,
    }))
}

/// `GET /withdrawals?ecopoint_id=`
pub async fn get_withdrawals(
    State(state): State<Arc<ApiState>>,
    AuthUser(user_id): AuthUser,
    Query(filter): Query<WithdrawalFilter>,
) -> ApiResult<Vec<Withdrawal>> {
    let records =
        withdrawals::list_withdrawals(&state.pool, &user_id, filter.ecopoint_id.as_deref()).await?;
    Ok(Json(records))
}

/// `GET /ecopoints/:id/balance`
pub async fn get_balance(
    State(state): State<Arc<ApiState>>,
    AuthUser(user_id): AuthUser,
    Path(ecopoint_id): Path<String>,
) -> ApiResult<BalanceSummary> {
    Ok(Json(
        ledger::get_balance_summary(&state.pool, &user_id, &ecopoint_id).await?,
    ))
}

/// `POST /donations`
pub async fn create_donation(
    State(state): State<Arc<ApiState>>,
    AuthUser(user_id): AuthUser,
    JsonBody(body): JsonBody<CreateDonationBody>,
) -> ApiResult<DonationCheckout> {
    let provider = match body.provider.as_deref() {
        None => ProviderKind::MercadoPago,
        Some(name) => name
            .parse()
            .map_err(|_| LedgerError::BadRequest(format!("unknown provider {name}")))?,
    };
    let request = StartDonation {
        ecopoint_id: body.ecopoint_id,
        amount_cents: body.amount_cents,
        provider,
    };
    Ok(Json(
        donations::start_donation(&state.pool, &state.providers, &user_id, &request).await?,
    ))
}

/// `POST /webhooks/:provider`
///
/// Acknowledges every authenticated delivery, including no-ops, so the
/// provider stops redelivering.
pub async fn receive_webhook(
    State(state): State<Arc<ApiState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, LedgerError> {
    let kind: ProviderKind = provider.parse()?;
    let outcome = state
        .reconciler
        .handle_provider_event(kind, &body, &headers)
        .await?;
    debug!(provider = kind.as_str(), ?outcome, "Webhook processed");
    Ok(Json(json!({ "received": true })))
}

/// `GET /payments/:payment_id/status`
pub async fn get_payment_status(
    State(state): State<Arc<ApiState>>,
    AuthUser(user_id): AuthUser,
    Path(payment_id): Path<String>,
) -> ApiResult<PaymentStatusView> {
    Ok(Json(
        state.reconciler.get_status(&payment_id, &user_id).await?,
    ))
}

/// `POST /admin/withdrawals/:id/status`
pub async fn set_withdrawal_status(
    State(state): State<Arc<ApiState>>,
    Path(withdrawal_id): Path<String>,
    headers: HeaderMap,
    JsonBody(body): JsonBody<StatusChangeBody>,
) -> ApiResult<Withdrawal> {
    require_admin(&headers, state.admin_api_key.as_deref())?;
    Ok(Json(
        withdrawals::transition_withdrawal(&state.pool, &withdrawal_id, body.status).await?,
    ))
}
