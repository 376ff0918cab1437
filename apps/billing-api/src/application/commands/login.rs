use crate::{
    AppState,
    application::{
        ApplicationError, blocking,
        middleware::{AuthenticatedUser, bearer_token, session_key},
    },
};
use axum::{Json, extract::State, http::{HeaderMap, StatusCode}};
use billing_core::{
    Cache, Command, CommandHandler, CoreError, UserRepository,
    domain::user::{Role, verify_password},
};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const TOKEN_LENGTH: usize = 48;

#[derive(Debug, Clone, Deserialize)]
pub struct LoginUser {
    pub username: String,
    pub password: String,
}

impl Command for LoginUser {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
    pub role: Role,
    pub flat_id: Option<String>,
    pub expires_in: u64,
}

pub struct LoginHandler {
    user_repository: Arc<dyn UserRepository>,
    cache: Arc<dyn Cache>,
    session_ttl_seconds: u64,
}

impl LoginHandler {
    pub fn new(
        user_repository: Arc<dyn UserRepository>,
        cache: Arc<dyn Cache>,
        session_ttl_seconds: u64,
    ) -> Self {
        Self {
            user_repository,
            cache,
            session_ttl_seconds,
        }
    }
}

impl CommandHandler<LoginUser> for LoginHandler {
    type Output = LoginResponse;

    async fn handle(&self, command: LoginUser) -> Result<LoginResponse, CoreError> {
        // Same error for unknown users and wrong passwords.
        let invalid = || CoreError::Unauthorized("Invalid credentials".into());

        let user = self
            .user_repository
            .find_by_username(command.username.trim())
            .await?
            .ok_or_else(invalid)?;

        let stored_hash = user.password_hash.clone();
        let password = command.password;
        blocking(move || verify_password(&password, &stored_hash).map_err(CoreError::from))
            .await?;

        let token = generate_token();
        let session = AuthenticatedUser {
            user_id: user.id.clone(),
            username: user.username.clone(),
            role: user.role,
            flat_id: user.flat_id.clone(),
        };
        self.cache
            .set(
                &session_key(&token),
                &serde_json::to_vec(&session)?,
                Some(self.session_ttl_seconds),
            )
            .await?;

        info!(user_id = %user.id, role = %user.role, "User logged in");
        Ok(LoginResponse {
            token,
            user_id: user.id,
            role: user.role,
            flat_id: user.flat_id,
            expires_in: self.session_ttl_seconds,
        })
    }
}

fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

// POST /api/auth/login
pub async fn handle_login_request(
    State(state): State<AppState>,
    Json(payload): Json<LoginUser>,
) -> Result<Json<LoginResponse>, ApplicationError> {
    if payload.username.trim().is_empty() || payload.password.is_empty() {
        return Err(ApplicationError::Validation(
            "Username and password are required".into(),
        ));
    }

    let handler = LoginHandler::new(
        state.users.clone(),
        state.cache.clone(),
        state.session_ttl_seconds,
    );
    match handler.handle(payload).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!("Login failed: {}", e);
            Err(e.into())
        }
    }
}

// POST /api/auth/logout
pub async fn handle_logout_request(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApplicationError> {
    if let Some(token) = bearer_token(&headers) {
        state.cache.delete(&session_key(&token)).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_long_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
