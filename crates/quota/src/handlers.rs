//! HTTP+JSON handlers for quota and order operations

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{FromRequest, FromRequestParts, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::allocator::{AllocationRequest, ProductUsage, QuotaQuery};
use crate::error::{ErrorCategory, QuotaError};
use crate::ledger::{QuotaKey, QuotaRecord};
use crate::orders::{
    CreateOrderRequest, CreatedOrder, DeletedOrder, OrderFilter, OrderSummary, OrderView,
};
use crate::service::AppState;

/// JSON body extractor whose rejections use the service error format
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

/// Transport wrapper turning a [`QuotaError`] into a JSON error response
#[derive(Debug)]
pub struct ApiError(pub QuotaError);

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!("Rejected request body: {}", rejection.body_text());
        Self(QuotaError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        debug!("Rejected query string: {}", rejection.body_text());
        Self(QuotaError::InvalidRequest(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        debug!("Rejected path: {}", rejection.body_text());
        Self(QuotaError::InvalidRequest(rejection.body_text()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ErrorBody {
    fn from_error(err: &QuotaError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: error_details(err),
        }
    }
}

pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::Conflict | ErrorCategory::Integrity => StatusCode::CONFLICT,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_details(err: &QuotaError) -> Value {
    match err {
        QuotaError::InsufficientQuota {
            key,
            requested,
            remaining,
        } => json!({ "quota": key, "requested": requested, "remaining": remaining }),
        QuotaError::QuotaBelowConsumed {
            key,
            requested_max,
            sold,
        } => json!({ "quota": key, "requested_max": requested_max, "sold": sold }),
        QuotaError::QuotaInUse { key, sold } => json!({ "quota": key, "sold": sold }),
        QuotaError::QuotaNotFound(key) => json!({ "quota": key }),
        QuotaError::OrderNotFound(order_id) => json!({ "order_id": order_id }),
        QuotaError::UnknownProduct(product_id) => json!({ "product_id": product_id }),
        QuotaError::UnknownDealer(dealer_id) => json!({ "dealer_id": dealer_id }),
        QuotaError::UnknownTerritory(territory) => json!({ "territory": territory }),
        QuotaError::TerritoryMismatch {
            dealer_id,
            dealer_territory,
            territory,
        } => json!({
            "dealer_id": dealer_id,
            "dealer_territory": dealer_territory,
            "territory": territory
        }),
        QuotaError::DuplicateRequestKey(request_key) => json!({ "request_key": request_key }),
        _ => Value::Null,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.category());
        match self.0.category() {
            ErrorCategory::Internal => error!("Request failed: {}", self.0),
            ErrorCategory::Integrity | ErrorCategory::Transient => {
                warn!("Request failed: {}", self.0)
            }
            _ => {}
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the service router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .route("/health", get(health))
        .route("/quotas", put(allocate_quota).get(list_quotas))
        .route("/quotas/bulk", post(allocate_bulk))
        .route("/quotas/summary", get(quota_summary))
        .route("/quotas/:date/:product_id/:territory", delete(remove_quota))
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:order_id", get(get_order).delete(delete_order))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.db.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AllocateQuotaBody {
    pub date: NaiveDate,
    pub product_id: i64,
    pub territory: String,
    pub max_quantity: i64,
}

async fn allocate_quota(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<AllocateQuotaBody>,
) -> ApiResult<Json<QuotaRecord>> {
    let request = AllocationRequest {
        product_id: body.product_id,
        territory: body.territory,
        max_quantity: body.max_quantity,
    };
    let record = state.allocator.allocate_or_update(body.date, &request).await?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct BulkAllocateBody {
    pub date: NaiveDate,
    pub allocations: Vec<AllocationRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub product_id: i64,
    pub territory: String,
    pub max_quantity: i64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkAllocateResponse {
    pub date: NaiveDate,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BulkItemResult>,
}

async fn allocate_bulk(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<BulkAllocateBody>,
) -> Json<BulkAllocateResponse> {
    let outcomes = state.allocator.allocate_bulk(body.date, body.allocations).await;

    let results: Vec<BulkItemResult> = outcomes
        .into_iter()
        .map(|outcome| {
            let (quota, error) = match outcome.result {
                Ok(record) => (Some(record), None),
                Err(e) => (None, Some(ErrorBody::from_error(&e))),
            };
            BulkItemResult {
                product_id: outcome.request.product_id,
                territory: outcome.request.territory,
                max_quantity: outcome.request.max_quantity,
                ok: error.is_none(),
                quota,
                error,
            }
        })
        .collect();

    let failed = results.iter().filter(|r| !r.ok).count();
    Json(BulkAllocateResponse {
        date: body.date,
        succeeded: results.len() - failed,
        failed,
        results,
    })
}

async fn remove_quota(
    State(state): State<AppState>,
    ApiPath((date, product_id, territory)): ApiPath<(NaiveDate, i64, String)>,
) -> ApiResult<Json<QuotaRecord>> {
    let key = QuotaKey::new(date, product_id, territory);
    Ok(Json(state.allocator.remove(&key).await?))
}

async fn list_quotas(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<QuotaQuery>,
) -> ApiResult<Json<Vec<QuotaRecord>>> {
    Ok(Json(state.allocator.query(&query).await?))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub date: NaiveDate,
}

async fn quota_summary(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<SummaryQuery>,
) -> ApiResult<Json<Vec<ProductUsage>>> {
    Ok(Json(state.allocator.usage_summary(query.date).await?))
}

async fn create_order(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateOrderRequest>,
) -> ApiResult<(StatusCode, Json<CreatedOrder>)> {
    let created = state.orders.create(request).await?;
    let status = if created.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(created)))
}

async fn list_orders(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<OrderFilter>,
) -> ApiResult<Json<Vec<OrderSummary>>> {
    Ok(Json(state.orders.list(&filter).await?))
}

async fn get_order(
    State(state): State<AppState>,
    ApiPath(order_id): ApiPath<String>,
) -> ApiResult<Json<OrderView>> {
    Ok(Json(state.orders.get(&order_id).await?))
}

async fn delete_order(
    State(state): State<AppState>,
    ApiPath(order_id): ApiPath<String>,
) -> ApiResult<Json<DeletedOrder>> {
    Ok(Json(state.orders.delete(&order_id).await?))
}
