use crate::{
    AppState,
    application::{
        ApplicationError,
        authz::{Requirement, authorize},
        middleware::AuthenticatedUser,
    },
};
use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
};
use billing_core::{
    Command, CommandHandler, CoreError, FlatRepository, UserRepository,
    domain::{
        flat::{Flat, FlatDetails},
        user::Role,
    },
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct UpdateFlat {
    pub flat_id: String,
    pub details: FlatDetails,
}

impl Command for UpdateFlat {}

/// The account in `details.user_id` must be a tenant that is unlinked or
/// already linked to `flat_id`.
async fn check_linked_user(
    users: &dyn UserRepository,
    flat_id: Option<&str>,
    details: &FlatDetails,
) -> Result<(), CoreError> {
    let Some(user_id) = &details.user_id else {
        return Ok(());
    };
    let user = users
        .get_user(user_id)
        .await?
        .ok_or_else(|| CoreError::Validation(format!("Linked user does not exist: {}", user_id)))?;
    if user.role != Role::Tenant {
        return Err(CoreError::Validation(
            "Only tenant accounts can be linked to a flat".into(),
        ));
    }
    match user.flat_id.as_deref() {
        Some(current) if Some(current) != flat_id => Err(CoreError::Conflict(format!(
            "User {} is already linked to flat {}",
            user.username, current
        ))),
        _ => Ok(()),
    }
}

/// Mirrors a flat's `user_id` change onto the accounts on both ends.
async fn sync_user_link(
    users: &dyn UserRepository,
    flat_id: &str,
    previous: Option<&str>,
    next: Option<&str>,
) -> Result<(), CoreError> {
    if previous == next {
        return Ok(());
    }
    if let Some(old) = previous
        && let Some(user) = users.get_user(old).await?
        && user.flat_id.as_deref() == Some(flat_id)
    {
        users.set_flat(old, None).await?;
        info!(user_id = %old, flat_id = %flat_id, "User unlinked from flat");
    }
    if let Some(new) = next {
        users.set_flat(new, Some(flat_id)).await?;
        info!(user_id = %new, flat_id = %flat_id, "User linked to flat");
    }
    Ok(())
}

pub struct CreateFlatHandler {
    flat_repository: Arc<dyn FlatRepository>,
    user_repository: Arc<dyn UserRepository>,
}

impl CreateFlatHandler {
    pub fn new(
        flat_repository: Arc<dyn FlatRepository>,
        user_repository: Arc<dyn UserRepository>,
    ) -> Self {
        Self {
            flat_repository,
            user_repository,
        }
    }
}

impl CommandHandler<FlatDetails> for CreateFlatHandler {
    type Output = Flat;

    async fn handle(&self, command: FlatDetails) -> Result<Flat, CoreError> {
        check_linked_user(self.user_repository.as_ref(), None, &command).await?;
        let flat = Flat::create(command, Utc::now())?;
        let flat = self.flat_repository.create_flat(flat).await?;
        sync_user_link(
            self.user_repository.as_ref(),
            &flat.id,
            None,
            flat.user_id.as_deref(),
        )
        .await?;
        info!(flat_id = %flat.id, flat_number = %flat.flat_number, "Flat created");
        Ok(flat)
    }
}

pub struct UpdateFlatHandler {
    flat_repository: Arc<dyn FlatRepository>,
    user_repository: Arc<dyn UserRepository>,
}

impl UpdateFlatHandler {
    pub fn new(
        flat_repository: Arc<dyn FlatRepository>,
        user_repository: Arc<dyn UserRepository>,
    ) -> Self {
        Self {
            flat_repository,
            user_repository,
        }
    }
}

impl CommandHandler<UpdateFlat> for UpdateFlatHandler {
    type Output = Flat;

    async fn handle(&self, command: UpdateFlat) -> Result<Flat, CoreError> {
        let current = self
            .flat_repository
            .get_flat(&command.flat_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Flat not found: {}", command.flat_id)))?;
        check_linked_user(
            self.user_repository.as_ref(),
            Some(&current.id),
            &command.details,
        )
        .await?;

        let previous_user = current.user_id.clone();
        let updated = current.with_details(command.details)?;
        let updated = self.flat_repository.update_flat(updated).await?;
        sync_user_link(
            self.user_repository.as_ref(),
            &updated.id,
            previous_user.as_deref(),
            updated.user_id.as_deref(),
        )
        .await?;
        info!(flat_id = %updated.id, "Flat updated");
        Ok(updated)
    }
}

// POST /api/flats
pub async fn handle_create_flat_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Json(payload): Json<FlatDetails>,
) -> Result<(StatusCode, Json<Flat>), ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let handler = CreateFlatHandler::new(state.flats.clone(), state.users.clone());
    let flat = handler.handle(payload).await?;
    Ok((StatusCode::CREATED, Json(flat)))
}

// PUT /api/flats/{flat_id}
pub async fn handle_update_flat_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Path(flat_id): Path<String>,
    Json(payload): Json<FlatDetails>,
) -> Result<Json<Flat>, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let handler = UpdateFlatHandler::new(state.flats.clone(), state.users.clone());
    let flat = handler
        .handle(UpdateFlat {
            flat_id,
            details: payload,
        })
        .await?;
    Ok(Json(flat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::{adapters::InMemoryStore, domain::user::User};
    use rust_decimal::Decimal;

    fn details(number: &str) -> FlatDetails {
        FlatDetails {
            flat_number: number.into(),
            tenant_name: Some("Asha".into()),
            tariff_override: None,
            user_id: None,
            initial_reading: Some(Decimal::new(1205, 1)),
        }
    }

    #[tokio::test]
    async fn create_then_update_flat() {
        let store = Arc::new(InMemoryStore::new());
        let created = CreateFlatHandler::new(store.clone(), store.clone())
            .handle(details("A-1"))
            .await
            .unwrap();
        assert_eq!(created.initial_reading, Some(Decimal::new(1205, 1)));

        let mut changes = details("A-1");
        changes.tenant_name = Some("Meera".into());
        let updated = UpdateFlatHandler::new(store.clone(), store.clone())
            .handle(UpdateFlat {
                flat_id: created.id.clone(),
                details: changes,
            })
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.tenant_name.as_deref(), Some("Meera"));
    }

    #[tokio::test]
    async fn update_missing_flat_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let result = UpdateFlatHandler::new(store.clone(), store.clone())
            .handle(UpdateFlat {
                flat_id: "nope".into(),
                details: details("A-1"),
            })
            .await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn linked_user_must_exist() {
        let store = Arc::new(InMemoryStore::new());
        let mut linked = details("A-1");
        linked.user_id = Some("ghost".into());
        let result = CreateFlatHandler::new(store.clone(), store.clone())
            .handle(linked)
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    async fn tenant(store: &InMemoryStore, id: &str) -> User {
        store
            .create_user(User {
                id: id.into(),
                username: format!("tenant-{}", id),
                password_hash: "hash".into(),
                role: Role::Tenant,
                flat_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn relinking_a_flat_updates_both_accounts() {
        let store = Arc::new(InMemoryStore::new());
        let first = tenant(&store, "t1").await;
        let second = tenant(&store, "t2").await;

        let mut linked = details("A-1");
        linked.user_id = Some(first.id.clone());
        let flat = CreateFlatHandler::new(store.clone(), store.clone())
            .handle(linked)
            .await
            .unwrap();
        let stored = store.get_user(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.flat_id.as_deref(), Some(flat.id.as_str()));

        let mut moved = details("A-1");
        moved.user_id = Some(second.id.clone());
        UpdateFlatHandler::new(store.clone(), store.clone())
            .handle(UpdateFlat {
                flat_id: flat.id.clone(),
                details: moved,
            })
            .await
            .unwrap();

        let first = store.get_user(&first.id).await.unwrap().unwrap();
        let second = store.get_user(&second.id).await.unwrap().unwrap();
        assert_eq!(first.flat_id, None);
        assert_eq!(second.flat_id.as_deref(), Some(flat.id.as_str()));
    }

    #[tokio::test]
    async fn tenant_cannot_be_linked_to_two_flats() {
        let store = Arc::new(InMemoryStore::new());
        let user = tenant(&store, "t1").await;

        let mut first = details("A-1");
        first.user_id = Some(user.id.clone());
        CreateFlatHandler::new(store.clone(), store.clone())
            .handle(first)
            .await
            .unwrap();

        let mut second = details("B-1");
        second.user_id = Some(user.id.clone());
        let result = CreateFlatHandler::new(store.clone(), store.clone())
            .handle(second)
            .await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }
}
