use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::{StatusCode, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use clap::Parser;
use common::config::{BackendConfig, Config};
use futures::{Stream, StreamExt, stream};
use http::header;
use serde::Deserialize;
use std::{error::Error, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
    changes::ChangeHub,
    error::MarketError,
    image::{ImageFile, MAX_IMAGE_BYTES},
    model::{Actor, ModelId, OrderScope, Role, UserId},
    order_service::OrderService,
    projection::{ProjectionSync, ProjectionUpdate},
    replacement::{ReplacementService, SubmitReplacement},
    reviews::{ReviewService, SubmitReview},
    storage::OrderStorage,
};

/// Header carrying the user id authenticated by the gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Room for the multipart framing and text fields around the image.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "market/config/dev.yaml")]
    pub config: String,
}

pub fn initialize_executable() -> Result<Config, Box<dyn Error + Send + Sync>> {
    if let Err(e) = dotenvy::dotenv() {
        // A missing .env is the normal case outside development
        eprintln!("No .env loaded: {}", e);
    }

    let args = Args::parse();
    println!("Loading config from: {}", args.config);
    let config = Config::load(&args.config)?;
    Ok(config)
}

pub fn initialize_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Clone)]
pub struct AppState {
    pub orders: OrderService,
    pub replacements: ReplacementService,
    pub reviews: ReviewService,
    pub storage: Arc<dyn OrderStorage>,
    pub changes: ChangeHub,
    pub upload_limit: usize,
}

impl AppState {
    pub fn new(
        orders: OrderService,
        replacements: ReplacementService,
        reviews: ReviewService,
        storage: Arc<dyn OrderStorage>,
        changes: ChangeHub,
    ) -> Self {
        Self {
            orders,
            replacements,
            reviews,
            storage,
            changes,
            upload_limit: MAX_IMAGE_BYTES,
        }
    }

    /// Capped at [`MAX_IMAGE_BYTES`].
    pub fn with_upload_limit(mut self, upload_limit: usize) -> Self {
        self.upload_limit = upload_limit.min(MAX_IMAGE_BYTES);
        self
    }
}

/// Caller identity taken from [`USER_ID_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

impl AuthUser {
    pub fn as_actor(&self, role: Role) -> Actor {
        Actor {
            user_id: self.0,
            role,
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("Missing user id".to_string()))?;
        let user_id = value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| ApiError::Unauthorized("Invalid user id".to_string()))?;
        Ok(AuthUser(user_id))
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    /// Path or body the extractors could not parse.
    Rejected(StatusCode, String),
    Market(MarketError),
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        ApiError::Market(err)
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

/// [`axum::extract::Path`] that rejects with an [`ApiError`] body.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

/// [`axum::Json`] that rejects with an [`ApiError`] body.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

pub fn status_code(err: &MarketError) -> StatusCode {
    match err {
        MarketError::Validation(_) => StatusCode::BAD_REQUEST,
        MarketError::Forbidden(_) => StatusCode::FORBIDDEN,
        MarketError::NotFound { .. } => StatusCode::NOT_FOUND,
        MarketError::Conflict(_)
        | MarketError::InvalidTransition { .. }
        | MarketError::StaleStatus { .. } => StatusCode::CONFLICT,
        MarketError::ObjectStore(_) | MarketError::Database(_) | MarketError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            ApiError::Rejected(status, message) => {
                warn!(error = %message, status = status.as_u16(), "Malformed request");
                (status, message)
            }
            ApiError::Market(err) => {
                let status = status_code(&err);
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                } else {
                    warn!(error = %err, status = status.as_u16(), "Request rejected");
                }
                (status, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub rating: i16,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub reason: String,
}

pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK").into_response()
}

pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(role): ApiPath<Role>,
) -> Result<Response, ApiError> {
    let scope = OrderScope::for_actor(&user.as_actor(role));
    let views = state.storage.list_order_views(scope).await?;
    Ok(Json(views).into_response())
}

fn event_name(update: &ProjectionUpdate) -> &'static str {
    match update {
        ProjectionUpdate::Upserted { .. } => "upserted",
        ProjectionUpdate::Removed { .. } => "removed",
        ProjectionUpdate::Reloaded { .. } => "reloaded",
        ProjectionUpdate::Ignored => "ignored",
    }
}

fn to_event(update: &ProjectionUpdate) -> Result<Event, axum::Error> {
    Event::default().event(event_name(update)).json_data(update)
}

/// Server-sent projection updates, starting with the full list.
pub async fn stream_orders(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(role): ApiPath<Role>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let scope = OrderScope::for_actor(&user.as_actor(role));
    // Subscribe before loading so nothing between the two is missed
    let subscription = state.changes.subscribe(scope);
    let sync = ProjectionSync::load(state.storage.clone(), scope).await?;
    info!(scope = ?scope, "Opened order stream");

    let snapshot = ProjectionUpdate::Reloaded {
        orders: sync.projection().views().to_vec(),
    };
    let updates = stream::unfold((sync, subscription), |(mut sync, mut subscription)| async move {
        let update = sync.next_update(&mut subscription).await?;
        Some((update, (sync, subscription)))
    });
    let events = stream::once(async move { snapshot })
        .chain(updates)
        .map(|update| to_event(&update));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn set_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath((role, order_id)): ApiPath<(Role, ModelId)>,
    ApiJson(request): ApiJson<StatusRequest>,
) -> Result<Response, ApiError> {
    let outcome = state
        .orders
        .set_status(&user.as_actor(role), order_id, &request.status)
        .await?;
    Ok(Json(outcome).into_response())
}

pub async fn order_actions(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath((role, order_id)): ApiPath<(Role, ModelId)>,
) -> Result<Response, ApiError> {
    let actions = state.orders.next_actions(&user.as_actor(role), order_id).await?;
    Ok(Json(actions).into_response())
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> MarketError {
    MarketError::Validation(format!("Malformed multipart body: {}", err.body_text()))
}

async fn read_replacement_form(mut multipart: Multipart) -> Result<SubmitReplacement, MarketError> {
    let mut submission = SubmitReplacement::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "reason" => submission.reason = field.text().await.map_err(multipart_error)?,
            "other_text" => {
                submission.other_text = Some(field.text().await.map_err(multipart_error)?)
            }
            "image" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                submission.image = Some(ImageFile::new(file_name, content_type, bytes.to_vec()));
            }
            other => warn!(field = other, "Ignoring unknown multipart field"),
        }
    }
    Ok(submission)
}

pub async fn submit_replacement(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(item_id): ApiPath<ModelId>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let submission = read_replacement_form(multipart).await?;
    let item = state
        .replacements
        .submit(&user.as_actor(Role::Consumer), item_id, submission)
        .await?;
    Ok((StatusCode::CREATED, Json(item)).into_response())
}

pub async fn resolve_replacement(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(item_id): ApiPath<ModelId>,
) -> Result<Response, ApiError> {
    let resolution = state
        .replacements
        .resolve(&user.as_actor(Role::Producer), item_id)
        .await?;
    Ok(Json(resolution).into_response())
}

pub async fn submit_review(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(product_id): ApiPath<ModelId>,
    ApiJson(request): ApiJson<ReviewRequest>,
) -> Result<Response, ApiError> {
    let review = state
        .reviews
        .submit_review(
            &user.as_actor(Role::Consumer),
            product_id,
            SubmitReview {
                rating: request.rating,
                comment: request.comment,
                image_url: request.image_url,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(review)).into_response())
}

pub async fn product_rating(
    State(state): State<AppState>,
    ApiPath(product_id): ApiPath<ModelId>,
) -> Result<Response, ApiError> {
    let summary = state.reviews.product_rating(product_id).await?;
    Ok(Json(summary).into_response())
}

pub async fn mark_helpful(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(review_id): ApiPath<ModelId>,
) -> Result<Response, ApiError> {
    let vote = state
        .reviews
        .mark_helpful(&user.as_actor(Role::Consumer), review_id)
        .await?;
    Ok(Json(vote).into_response())
}

pub async fn report_review(
    State(state): State<AppState>,
    user: AuthUser,
    ApiPath(review_id): ApiPath<ModelId>,
    ApiJson(request): ApiJson<ReportRequest>,
) -> Result<Response, ApiError> {
    state
        .reviews
        .report_review(&user.as_actor(Role::Consumer), review_id, &request.reason)
        .await?;
    Ok(StatusCode::CREATED.into_response())
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.upload_limit + MULTIPART_OVERHEAD;
    Router::new()
        .route("/health", get(health_check))
        .route("/api/{role}/orders", get(list_orders))
        .route("/api/{role}/orders/stream", get(stream_orders))
        .route("/api/{role}/orders/{id}/status", post(set_order_status))
        .route("/api/{role}/orders/{id}/actions", get(order_actions))
        .route(
            "/api/consumer/order-items/{id}/replacement",
            post(submit_replacement).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/producer/order-items/{id}/replacement/resolve", post(resolve_replacement))
        .route("/api/products/{id}/reviews", post(submit_review))
        .route("/api/products/{id}/rating", get(product_rating))
        .route("/api/reviews/{id}/helpful", post(mark_helpful))
        .route("/api/reviews/{id}/report", post(report_review))
        .with_state(state)
}

/// Serves the API, merged with `extra` (e.g. the metrics endpoint).
pub async fn run_backend(
    config: BackendConfig,
    state: AppState,
    extra: Router,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let origin = config.allowed_origin.parse::<header::HeaderValue>()?;
    let app = build_router(state)
        .merge(extra)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting backend service at {}", config.server_address);
    let listener = tokio::net::TcpListener::bind(&config.server_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
