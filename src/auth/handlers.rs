use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Form, Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{LoginRequest, PublicUser, RegisterRequest, TokenForm, TokenResponse},
        extractors::CurrentUser,
    },
    error::AuthError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/token", post(token))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/users/me", get(get_me))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    let registration = payload.validate().map_err(|e| {
        warn!(error = %e, "invalid registration");
        e
    })?;
    let user = state.auth.register(registration).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    issue_for(&state, &payload.username, &payload.password).await
}

/// OAuth2 password grant, form-encoded.
#[instrument(skip(state, form))]
pub async fn token(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, AuthError> {
    if let Some(grant) = form.grant_type.as_deref() {
        if grant != "password" {
            return Err(AuthError::validation("Unsupported grant_type"));
        }
    }
    issue_for(&state, &form.username, &form.password).await
}

async fn issue_for(
    state: &AppState,
    identifier: &str,
    password: &str,
) -> Result<Json<TokenResponse>, AuthError> {
    let access_token = state.auth.login(identifier, password).await?;
    let expires_in = state.auth.tokens().access_ttl.as_secs();
    Ok(Json(TokenResponse::bearer(access_token, expires_in)))
}

#[instrument(skip_all)]
pub async fn get_me(CurrentUser(user): CurrentUser) -> Json<PublicUser> {
    Json(user.into())
}
