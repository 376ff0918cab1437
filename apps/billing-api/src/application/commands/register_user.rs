use crate::{
    AppState,
    application::{
        ApplicationError,
        authz::{Requirement, authorize},
        blocking,
        middleware::{authenticate, bearer_token},
    },
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use billing_core::{
    CommandHandler, CoreError, FlatRepository, UserRepository,
    domain::{
        flat::Flat,
        user::{RegisterUser, Role, User, hash_password, validate_password},
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Public view of an account; never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub flat_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            role: user.role,
            flat_id: user.flat_id,
            created_at: user.created_at,
        }
    }
}

pub struct RegisterUserHandler {
    user_repository: Arc<dyn UserRepository>,
    flat_repository: Arc<dyn FlatRepository>,
}

impl RegisterUserHandler {
    pub fn new(
        user_repository: Arc<dyn UserRepository>,
        flat_repository: Arc<dyn FlatRepository>,
    ) -> Self {
        Self {
            user_repository,
            flat_repository,
        }
    }
}

impl CommandHandler<RegisterUser> for RegisterUserHandler {
    type Output = User;

    async fn handle(&self, command: RegisterUser) -> Result<User, CoreError> {
        let flat = match &command.flat_id {
            Some(flat_id) => Some(
                self.flat_repository
                    .get_flat(flat_id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("Flat not found: {}", flat_id)))?,
            ),
            None => None,
        };
        if let Some(owner) = flat.as_ref().and_then(|f| f.user_id.as_deref()) {
            return Err(CoreError::Conflict(format!(
                "Flat is already linked to another account: {}",
                owner
            )));
        }

        validate_password(&command.password)?;
        let password = command.password.clone();
        let password_hash =
            blocking(move || hash_password(&password).map_err(CoreError::from)).await?;

        let user = User::register(&command, password_hash, Utc::now())?;
        let user = self.user_repository.create_user(user).await?;

        if let Some(flat) = flat {
            let linked = Flat {
                user_id: Some(user.id.clone()),
                ..flat
            };
            self.flat_repository.update_flat(linked).await?;
        }

        info!(user_id = %user.id, role = %user.role, "User registered");
        Ok(user)
    }
}

// POST /api/users
//
// Open while no account exists so the first admin can be created; admin-only afterwards.
pub async fn handle_register_user_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterUser>,
) -> Result<(StatusCode, Json<UserResponse>), ApplicationError> {
    if state.users.count_users().await? == 0 {
        if payload.role != Role::Admin {
            return Err(ApplicationError::Validation(
                "The first account must be an admin".into(),
            ));
        }
        info!(username = %payload.username, "Bootstrapping first admin account");
    } else {
        let token = bearer_token(&headers)
            .ok_or_else(|| ApplicationError::Unauthorized("Missing bearer token".into()))?;
        let ctx = authenticate(&state, &token).await?;
        authorize(&ctx, Requirement::AdminOnly)?;
    }

    let handler = RegisterUserHandler::new(state.users.clone(), state.flats.clone());
    let user = handler.handle(payload).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}
