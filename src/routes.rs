use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use mongodb::bson::doc;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{event, Level};

use crate::{
    auth::{authentication_middleware, AuthenticatedUser},
    cqrs::{
        AddAddressCommand, CommandHandler, ConfirmPasswordResetCommand, GetProfileQuery, ListAddressesQuery,
        LoginCommand, LogoutCommand, NearbyUsersQuery, QueryHandler, RefreshTokenCommand, RegisterUserCommand,
        RequestPasswordResetCommand, UpdateProfileCommand, VerifyEmailCommand,
    },
    dtos::{
        AddAddressRequest, LoginRequest, LogoutRequest, NearbyUsersParams, PasswordResetConfirmRequest, PasswordResetRequest,
        RefreshTokenRequest, RegisterRequest, UpdateProfileRequest, VerifyEmailRequest,
    },
    error::AppError,
    state::AppState,
};

type ApiResult = Result<(StatusCode, Json<Value>), AppError>;

pub async fn index() -> &'static str {
    "Multiservice accounts API"
}

pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let Some(database) = &state.database else {
        return (StatusCode::OK, Json(json!({"status": "healthy", "database": "in-memory"})));
    };

    match database.run_command(doc! {"ping": 1}).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "healthy", "database": "connected"}))),
        Err(e) => {
            event!(Level::ERROR, "Health check could not reach MongoDB: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy", "database": "unreachable"})),
            )
        }
    }
}

pub async fn auth_metrics(State(state): State<Arc<AppState>>) -> String {
    state.auth_metrics.render()
}

/// First `X-Forwarded-For` hop, or `unknown` when the header is absent.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
        .unwrap_or_else(|| String::from("unknown"))
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

pub async fn register(State(state): State<Arc<AppState>>, Json(request): Json<RegisterRequest>) -> ApiResult {
    let response = state
        .register_user_command_handler
        .handle(&RegisterUserCommand { request })
        .await?;
    Ok((StatusCode::CREATED, Json(json!(response))))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> ApiResult {
    let command = LoginCommand {
        request,
        ip_address: client_ip(&headers),
        user_agent: user_agent(&headers),
    };

    let response = state.login_command_handler.handle(&command).await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn refresh_token(State(state): State<Arc<AppState>>, Json(request): Json<RefreshTokenRequest>) -> ApiResult {
    let response = state
        .refresh_token_command_handler
        .handle(&RefreshTokenCommand {
            refresh: request.refresh,
        })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn logout(State(state): State<Arc<AppState>>, Json(request): Json<LogoutRequest>) -> ApiResult {
    let response = state
        .logout_command_handler
        .handle(&LogoutCommand { request })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult {
    let response = state
        .get_profile_query_handler
        .handle(&GetProfileQuery { user_id: user.user_id })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<UpdateProfileRequest>,
) -> ApiResult {
    let response = state
        .update_profile_command_handler
        .handle(&UpdateProfileCommand {
            user_id: user.user_id,
            request,
        })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn add_address(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<AddAddressRequest>,
) -> ApiResult {
    let response = state
        .add_address_command_handler
        .handle(&AddAddressCommand {
            user_id: user.user_id,
            request,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!(response))))
}

pub async fn list_addresses(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult {
    let response = state
        .list_addresses_query_handler
        .handle(&ListAddressesQuery { user_id: user.user_id })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn nearby_users(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<NearbyUsersParams>,
) -> ApiResult {
    let response = state
        .nearby_users_query_handler
        .handle(&NearbyUsersQuery {
            user_id: user.user_id,
            params,
        })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn verify_email(State(state): State<Arc<AppState>>, Json(request): Json<VerifyEmailRequest>) -> ApiResult {
    let response = state
        .verify_email_command_handler
        .handle(&VerifyEmailCommand { request })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn request_password_reset(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PasswordResetRequest>,
) -> ApiResult {
    let response = state
        .request_password_reset_command_handler
        .handle(&RequestPasswordResetCommand { request })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

pub async fn confirm_password_reset(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PasswordResetConfirmRequest>,
) -> ApiResult {
    let response = state
        .confirm_password_reset_command_handler
        .handle(&ConfirmPasswordResetCommand { request })
        .await?;
    Ok((StatusCode::OK, Json(json!(response))))
}

/// Allows every origin when none are configured. Configured origins may send
/// credentials, so methods and headers are listed explicitly.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                event!(Level::WARN, "Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ACCEPT,
            header::ACCEPT_ENCODING,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ORIGIN,
            header::USER_AGENT,
            HeaderName::from_static("x-csrftoken"),
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Application routes. HTTP metrics and tracing are layered on by `main`.
pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let authenticated = Router::new()
        .route("/profile/", get(get_profile).put(update_profile))
        .route("/addresses/", post(add_address).get(list_addresses))
        .route("/nearby-users/", get(nearby_users))
        .route_layer(from_fn_with_state(state.clone(), authentication_middleware));

    let public = Router::new()
        .route("/register/", post(register))
        .route("/login/", post(login))
        .route("/token/refresh/", post(refresh_token))
        .route("/logout/", post(logout))
        .route("/verify-email/", post(verify_email))
        .route("/password-reset/", post(request_password_reset))
        .route("/password-reset/confirm/", post(confirm_password_reset));

    Router::new()
        .route("/", get(index))
        .route("/health/", get(health))
        .route("/metrics/auth", get(auth_metrics))
        .nest("/api/v1/auth", public.merge(authenticated))
        .with_state(state)
        .layer(cors)
}
