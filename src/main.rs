mod errors;
mod http;
mod idempotency;
mod media;
mod metrics;
mod models;
mod order;
mod payments;
mod pricing;
mod product;
mod security;
mod settlement;
mod signals;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use chrono::Utc;
use errors::CoreError;
use media::MediaStore;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    AcceptOfferRequest, ApiError, CheckoutRequest, CheckoutResponse, EditPriceRequest,
    ListingView, ProfileResponse, RejectOfferRequest, ReviewRequest, SetDefaultAddressRequest,
    SubmitRequest, SubmitResponse, VerifyPaymentRequest,
};
use order::{Address, Order};
use payments::{GatewayClient, GatewayError};
use pricing::PricingPipeline;
use product::{Product, ProductStatus};
use security::{AdminPolicy, AuthContext, AuthState, require_api_auth};
use serde_json::json;
use settlement::{Settlement, SettlementReport};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use store::Store;
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "restitch.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let auth_state = AuthState::from_env();
    let store = Store::new();
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        store: store.clone(),
        pipeline: Arc::new(PricingPipeline::from_env()),
        settlement: Arc::new(Settlement::from_env(store)),
        gateway: Arc::new(GatewayClient::from_env()),
        media: MediaStore::new(),
        admin: AdminPolicy::from_env(),
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
        convenience_fee: convenience_fee_from_env(),
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/products", post(submit_product))
        .route("/products/listed", get(list_listed))
        .route("/products/queue", get(review_queue))
        .route("/products/sold", get(sold_audit))
        .route("/products/{id}", get(get_product))
        .route("/products/{id}/accept-offer", post(accept_offer))
        .route("/products/{id}/reject-offer", post(reject_offer))
        .route("/products/{id}/review", post(review_product))
        .route("/products/{id}/price", patch(edit_price))
        .route("/orders", post(checkout).get(list_orders))
        .route("/orders/{id}/force-settle", post(force_settle))
        .route("/payments/verify", post(verify_payment))
        .route("/users/profile", get(profile))
        .route("/users/addresses", post(add_address))
        .route("/users/addresses/default", put(set_default_address))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "restitch.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Store,
    pipeline: Arc<PricingPipeline>,
    settlement: Arc<Settlement>,
    gateway: Arc<GatewayClient>,
    media: MediaStore,
    admin: AdminPolicy,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, SubmitResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
    convenience_fee: f64,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "restitch-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Core(CoreError::forbidden("docs key required")));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Restitch API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4 * 1024 * 1024)
}

fn convenience_fee_from_env() -> f64 {
    std::env::var("CONVENIENCE_FEE")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .unwrap_or(49.0)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

// -------- products --------

/// Submit a used item for sale: runs the pricing pipeline and creates a
/// pending product.
///
/// - Method: `POST`
/// - Path: `/products`
/// - Auth: `Authorization: Bearer <key>` or `X-Restitch-Key: <key>`
/// - Body: `SubmitRequest`; honors an `Idempotency-Key` header
async fn submit_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    crate::metrics::inc_requests("/products");
    info!(
        target = "restitch.api",
        user = %context.user_id,
        brand = %payload.attributes.brand,
        "product submission received",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        let key = format!("{}:{key}", context.user_id);
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = run_submission(&state, &context, payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = run_submission(&state, &context, payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = run_submission(&state, &context, payload).await?;
    Ok(Json(response))
}

async fn run_submission(
    state: &AppState,
    context: &AuthContext,
    payload: SubmitRequest,
) -> Result<SubmitResponse, AppError> {
    let resolved = state.media.resolve(&payload.images).await?;
    let analysis = state
        .pipeline
        .analyze(resolved.primary.as_deref(), &payload.attributes)
        .await;
    let product = Product::submit(
        &context.user_id,
        payload.attributes,
        resolved.refs,
        analysis,
        Utc::now(),
    )?;
    let seller_report = pricing::seller_report(&product.ai_analysis);
    state.store.insert_product(product.clone()).await;
    Ok(SubmitResponse {
        product,
        seller_report,
    })
}

/// Buyer-facing listings, newest first.
async fn list_listed(State(state): State<AppState>) -> Json<Vec<ListingView>> {
    crate::metrics::inc_requests("/products/listed");
    let products = state
        .store
        .products_with_status(&[ProductStatus::Listed])
        .await;
    let views = products
        .iter()
        .filter_map(ListingView::from_product)
        .collect();
    Json(views)
}

/// Admin review queue: pending submissions plus approved products waiting
/// for a pricing decision.
async fn review_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<Product>>, AppError> {
    crate::metrics::inc_requests("/products/queue");
    state.admin.authorize(&context)?;
    let products = state
        .store
        .products_with_status(&[ProductStatus::Pending, ProductStatus::Approved])
        .await;
    Ok(Json(products))
}

/// Admin audit of sold inventory, most recently settled first.
async fn sold_audit(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<Product>>, AppError> {
    crate::metrics::inc_requests("/products/sold");
    state.admin.authorize(&context)?;
    Ok(Json(state.store.sold_products().await))
}

async fn get_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Product>, AppError> {
    let id = parse_id(&id)?;
    let product = state
        .store
        .get_product(id)
        .await
        .ok_or(CoreError::NotFound("product"))?;
    if product.seller != context.user_id && !state.admin.is_admin(&context.email) {
        return Err(CoreError::forbidden("only the owning seller or an admin may view this").into());
    }
    Ok(Json(product))
}

async fn accept_offer(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(payload): Json<AcceptOfferRequest>,
) -> Result<Json<Product>, AppError> {
    crate::metrics::inc_requests("/products/accept-offer");
    let id = parse_id(&id)?;
    let update = state
        .store
        .update_product(id, |p| {
            p.accept_offer(&context.user_id, payload.pickup, payload.payout, Utc::now())
        })
        .await?;
    Ok(Json(update.product))
}

async fn reject_offer(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(payload): Json<RejectOfferRequest>,
) -> Result<Json<Product>, AppError> {
    crate::metrics::inc_requests("/products/reject-offer");
    let id = parse_id(&id)?;
    let update = state
        .store
        .update_product(id, |p| {
            p.reject_offer(&context.user_id, payload.reason, Utc::now())
        })
        .await?;
    Ok(Json(update.product))
}

/// Admin decision on an approved product: approve with a final price (which
/// builds the public listing) or reject.
async fn review_product(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(payload): Json<ReviewRequest>,
) -> Result<Json<Product>, AppError> {
    crate::metrics::inc_requests("/products/review");
    state.admin.authorize(&context)?;
    let id = parse_id(&id)?;
    let decision = payload.into_decision()?;
    let reviewer = context.email.clone();
    let update = state
        .store
        .update_product(id, move |p| p.admin_review(decision, &reviewer, Utc::now()))
        .await?;
    info!(
        target = "restitch.api",
        product = %id,
        status = %update.product.status,
        reviewed_by = %context.email,
        "admin review applied",
    );
    Ok(Json(update.product))
}

async fn edit_price(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(payload): Json<EditPriceRequest>,
) -> Result<Json<Product>, AppError> {
    crate::metrics::inc_requests("/products/price");
    state.admin.authorize(&context)?;
    let id = parse_id(&id)?;
    let update = state
        .store
        .update_product(id, |p| p.edit_price(payload.price, payload.mrp, Utc::now()))
        .await?;
    Ok(Json(update.product))
}

// -------- orders & payments --------

/// Creates an order and a gateway payment session. The server recomputes the
/// total from the cart; a client amount that disagrees beyond a rounding
/// tolerance is rejected, never silently replaced.
async fn checkout(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    crate::metrics::inc_requests("/orders");
    let address = match payload.address {
        Some(address) => address,
        None => state
            .store
            .default_address(&context.user_id)
            .await
            .ok_or_else(|| CoreError::validation("no delivery address on file"))?,
    };
    let expected = order::expected_amount(&payload.cart, state.convenience_fee)?;
    if (payload.amount - expected).abs() > 1.0 {
        return Err(CoreError::validation(format!(
            "amount mismatch: cart totals {expected}, request carries {}",
            payload.amount
        ))
        .into());
    }

    let receipt = format!("rcpt_{}", Uuid::new_v4().simple());
    let session = state.gateway.create_order_session(expected, &receipt).await?;
    let order = Order::create(
        &context.user_id,
        address,
        payload.cart,
        expected,
        session.gateway_order_id.clone(),
        Utc::now(),
    )?;
    state.store.insert_order(order.clone()).await?;
    info!(
        target = "restitch.api",
        order = %order.id,
        gateway_ref = %session.gateway_order_id,
        amount = expected,
        "order created",
    );
    Ok(Json(CheckoutResponse {
        order_id: order.id,
        gateway_order_id: session.gateway_order_id,
        amount: session.amount,
        currency: session.currency,
        key_id: session.key_id,
    }))
}

async fn list_orders(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<Vec<Order>> {
    crate::metrics::inc_requests("/orders:list");
    Json(state.store.orders_for_user(&context.user_id).await)
}

/// Gateway payment confirmation. Verifies the HMAC signature, marks the
/// order paid, and transitions the purchased products to sold.
async fn verify_payment(
    State(state): State<AppState>,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Json<SettlementReport>, AppError> {
    crate::metrics::inc_requests("/payments/verify");
    let report = state
        .settlement
        .verify_payment(
            &payload.razorpay_order_id,
            &payload.razorpay_payment_id,
            &payload.razorpay_signature,
        )
        .await?;
    Ok(Json(report))
}

async fn force_settle(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<SettlementReport>, AppError> {
    crate::metrics::inc_requests("/orders/force-settle");
    state.admin.authorize(&context)?;
    let id = parse_id(&id)?;
    let report = state.settlement.force_settle(id, &context.email).await?;
    Ok(Json(report))
}

// -------- users --------

async fn profile(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<ProfileResponse> {
    let profile = state
        .store
        .ensure_user(&context.user_id, &context.email)
        .await;
    Json(ProfileResponse {
        user_id: profile.user_id,
        email: profile.email,
        addresses: profile.addresses,
    })
}

async fn add_address(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(address): Json<Address>,
) -> Result<Json<ProfileResponse>, AppError> {
    let profile = state
        .store
        .add_address(&context.user_id, &context.email, address)
        .await?;
    Ok(Json(ProfileResponse {
        user_id: profile.user_id,
        email: profile.email,
        addresses: profile.addresses,
    }))
}

async fn set_default_address(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<SetDefaultAddressRequest>,
) -> Result<Json<ProfileResponse>, AppError> {
    let profile = state
        .store
        .set_default_address(&context.user_id, payload.index)
        .await?;
    Ok(Json(ProfileResponse {
        user_id: profile.user_id,
        email: profile.email,
        addresses: profile.addresses,
    }))
}

// -------- error mapping --------

#[derive(Debug)]
enum AppError {
    Core(CoreError),
    Gateway(GatewayError),
}

impl From<CoreError> for AppError {
    fn from(value: CoreError) -> Self {
        Self::Core(value)
    }
}

impl From<GatewayError> for AppError {
    fn from(value: GatewayError) -> Self {
        Self::Gateway(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Core(err) => {
                let status = match &err {
                    CoreError::Validation(_) => StatusCode::BAD_REQUEST,
                    CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
                    CoreError::InvalidState { .. } => StatusCode::CONFLICT,
                    CoreError::SignatureInvalid => StatusCode::BAD_REQUEST,
                };
                let payload = ApiError {
                    error: err.code().to_string(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Gateway(err) => {
                let payload = ApiError {
                    error: "gateway_error".to_string(),
                    detail: Some(err.to_string()),
                };
                (StatusCode::BAD_GATEWAY, Json(payload)).into_response()
            }
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| CoreError::validation(format!("`{raw}` is not a valid id")).into())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
