use crate::{
    AppState,
    application::{
        ApplicationError,
        authz::{Requirement, authorize},
        middleware::AuthenticatedUser,
        publish_event,
    },
};
use axum::{
    Json,
    extract::{Extension, State},
};
use billing_core::{
    CommandHandler, CoreError, EventPublisher, SettingsStore,
    domain::{
        events::BillingEvent,
        settings::{GlobalSettings, SettingsUpdate},
    },
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub struct UpdateSettingsHandler {
    settings_store: Arc<dyn SettingsStore>,
    event_publisher: Arc<dyn EventPublisher>,
}

impl UpdateSettingsHandler {
    pub fn new(
        settings_store: Arc<dyn SettingsStore>,
        event_publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            settings_store,
            event_publisher,
        }
    }
}

impl CommandHandler<SettingsUpdate> for UpdateSettingsHandler {
    type Output = GlobalSettings;

    async fn handle(&self, command: SettingsUpdate) -> Result<GlobalSettings, CoreError> {
        let settings = self
            .settings_store
            .update_settings(command, Utc::now())
            .await?;
        info!(
            version = settings.version,
            tariff_per_unit = %settings.tariff_per_unit,
            minimum_price = %settings.minimum_price,
            unit_factor = %settings.unit_factor,
            "Global settings updated"
        );
        publish_event(
            self.event_publisher.as_ref(),
            &BillingEvent::SettingsUpdated {
                version: settings.version,
            },
        )
        .await;
        Ok(settings)
    }
}

// PUT /api/settings
pub async fn handle_update_settings_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthenticatedUser>,
    Json(payload): Json<SettingsUpdate>,
) -> Result<Json<GlobalSettings>, ApplicationError> {
    authorize(&ctx, Requirement::AdminOnly)?;
    let handler = UpdateSettingsHandler::new(state.settings.clone(), state.event_publisher.clone());
    Ok(Json(handler.handle(payload).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::{
        EventSubscriber,
        adapters::{InMemoryEventBus, InMemoryStore},
        domain::events::SETTINGS_TOPIC,
    };
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn update_bumps_version_and_notifies() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryEventBus::default());
        let mut events = bus.subscribe(SETTINGS_TOPIC);

        let settings = UpdateSettingsHandler::new(store.clone(), bus.clone())
            .handle(SettingsUpdate {
                tariff_per_unit: Some(Decimal::new(75, 1)),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap();

        assert_eq!(settings.version, 2);
        assert_eq!(settings.tariff_per_unit, Decimal::new(75, 1));
        assert_eq!(
            events.try_recv().unwrap(),
            BillingEvent::SettingsUpdated { version: 2 }
        );
    }

    #[tokio::test]
    async fn negative_values_are_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryEventBus::default());
        let result = UpdateSettingsHandler::new(store.clone(), bus)
            .handle(SettingsUpdate {
                minimum_price: Some(Decimal::new(-1, 0)),
                ..SettingsUpdate::default()
            })
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(store.current_settings().await.unwrap().version, 1);
    }
}
