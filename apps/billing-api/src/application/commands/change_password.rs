use crate::{
    AppState,
    application::{
        ApplicationError,
        authz::{Requirement, authorize},
        blocking,
        middleware::AuthenticatedUser,
    },
};
use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
};
use billing_core::{
    CommandHandler, CoreError, UserRepository,
    domain::user::{ChangePassword, UserError, hash_password, validate_password, verify_password},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub struct ChangePasswordHandler {
    user_repository: Arc<dyn UserRepository>,
}

impl ChangePasswordHandler {
    pub fn new(user_repository: Arc<dyn UserRepository>) -> Self {
        Self { user_repository }
    }
}

impl CommandHandler<ChangePassword> for ChangePasswordHandler {
    type Output = ();

    async fn handle(&self, command: ChangePassword) -> Result<(), CoreError> {
        let user = self
            .user_repository
            .get_user(&command.user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("User not found: {}", command.user_id)))?;
        validate_password(&command.new_password)?;

        let stored_hash = user.password_hash;
        let ChangePassword {
            current_password,
            new_password,
            ..
        } = command;
        let new_hash = blocking(move || {
            if let Some(current) = current_password {
                match verify_password(&current, &stored_hash) {
                    Err(UserError::InvalidPassword) => {
                        return Err(CoreError::Forbidden(
                            "Current password is incorrect".into(),
                        ));
                    }
                    other => other?,
                }
            }
            Ok(hash_password(&new_password)?)
        })
        .await?;

        self.user_repository
            .set_password_hash(&user.id, &new_hash)
            .await?;
        info!(user_id = %user.id, "Password changed");
        Ok(())
    }
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub new_password: String,
}

// PUT /api/users/me/password
pub async fn handle_change_password_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode, ApplicationError> {
    let handler = ChangePasswordHandler::new(state.users.clone());
    handler
        .handle(ChangePassword {
            user_id: ctx.user_id,
            current_password: Some(payload.current_password),
            new_password: payload.new_password,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// PUT /api/users/{user_id}/password
//
// Admin reset without the current password, for users locked out of their account.
pub async fn handle_reset_password_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(user_id): Path<String>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<StatusCode, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;

    let handler = ChangePasswordHandler::new(state.users.clone());
    handler
        .handle(ChangePassword {
            user_id: user_id.clone(),
            current_password: None,
            new_password: payload.new_password,
        })
        .await?;
    info!(admin_id = %ctx.user_id, target_user_id = %user_id, "Password reset by admin");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::{
        adapters::InMemoryStore,
        domain::user::{Role, User},
    };
    use chrono::Utc;

    async fn store_with_user(password: &str) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_user(User {
                id: "u1".into(),
                username: "ravi".into(),
                password_hash: hash_password(password).unwrap(),
                role: Role::Tenant,
                flat_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn change_requires_current_password() {
        let store = store_with_user("old").await;
        let handler = ChangePasswordHandler::new(store.clone());

        let wrong = handler
            .handle(ChangePassword {
                user_id: "u1".into(),
                current_password: Some("nope".into()),
                new_password: "new".into(),
            })
            .await;
        assert!(matches!(wrong, Err(CoreError::Forbidden(_))));

        handler
            .handle(ChangePassword {
                user_id: "u1".into(),
                current_password: Some("old".into()),
                new_password: "new".into(),
            })
            .await
            .unwrap();
        let stored = store.get_user("u1").await.unwrap().unwrap();
        assert!(verify_password("new", &stored.password_hash).is_ok());
    }

    #[tokio::test]
    async fn reset_skips_current_password_but_not_validation() {
        let store = store_with_user("old").await;
        let handler = ChangePasswordHandler::new(store.clone());

        let empty = handler
            .handle(ChangePassword {
                user_id: "u1".into(),
                current_password: None,
                new_password: " ".into(),
            })
            .await;
        assert!(matches!(empty, Err(CoreError::Validation(_))));

        handler
            .handle(ChangePassword {
                user_id: "u1".into(),
                current_password: None,
                new_password: "fresh".into(),
            })
            .await
            .unwrap();
        let stored = store.get_user("u1").await.unwrap().unwrap();
        assert!(verify_password("fresh", &stored.password_hash).is_ok());
    }
}
