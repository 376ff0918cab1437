use crate::{AppState, application::ApplicationError};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use billing_core::{Cache, UserRepository, domain::user::Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Session payload stored in the cache under [`session_key`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub flat_id: Option<String>,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn session_key(token: &str) -> String {
    format!("session:{}", token)
}

/// Token from an `Authorization: Bearer <token>` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Looks a session token up in the cache. Unknown, expired and unreadable
/// sessions all resolve to `None`.
pub async fn resolve_session(cache: &dyn Cache, token: &str) -> Option<AuthenticatedUser> {
    match cache.get(&session_key(token)).await {
        Ok(Some(bytes)) => match serde_json::from_slice::<AuthenticatedUser>(&bytes) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Failed to deserialize cached session: {}", e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("Cache error during session lookup: {}", e);
            None
        }
    }
}

/// Resolves `token` and reloads the role and flat link from the account, so
/// an admin relinking a flat takes effect on the tenant's next request.
pub async fn authenticate(
    state: &AppState,
    token: &str,
) -> Result<AuthenticatedUser, ApplicationError> {
    let mut session = resolve_session(state.cache.as_ref(), token)
        .await
        .ok_or_else(|| ApplicationError::Unauthorized("Invalid or expired session".into()))?;
    let account = state
        .users
        .get_user(&session.user_id)
        .await?
        .ok_or_else(|| ApplicationError::Unauthorized("Account no longer exists".into()))?;
    session.role = account.role;
    session.flat_id = account.flat_id;
    Ok(session)
}

/// Rejects requests without a live session and exposes the session as an
/// `Extension<AuthenticatedUser>` to the handlers behind it.
pub async fn session_auth(
    State(app_state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApplicationError> {
    let Some(token) = bearer_token(req.headers()) else {
        debug!("Missing or malformed Authorization header");
        return Err(ApplicationError::Unauthorized(
            "Missing bearer token".into(),
        ));
    };

    let user = authenticate(&app_state, &token).await?;

    debug!(user_id = %user.user_id, role = %user.role, "Session authenticated");
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
