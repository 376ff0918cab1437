//! Whole-database snapshots for backup and migration between stores.

use crate::{
    BillingStore, CoreError,
    domain::{
        flat::Flat,
        reading::{Reading, ReadingFilter},
        settings::GlobalSettings,
        user::User,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDump {
    pub exported_at: DateTime<Utc>,
    pub settings: GlobalSettings,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub flats: Vec<Flat>,
    #[serde(default)]
    pub readings: Vec<Reading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub users: usize,
    pub flats: usize,
    pub readings: usize,
}

impl ImportSummary {
    pub fn of(dump: &DatabaseDump) -> Self {
        Self {
            users: dump.users.len(),
            flats: dump.flats.len(),
            readings: dump.readings.len(),
        }
    }
}

/// Loads a dump as a single unit: either every record is written or none is.
#[async_trait]
pub trait DumpImport: Send + Sync {
    async fn import_dump(&self, dump: DatabaseDump) -> Result<ImportSummary, CoreError>;
}

pub async fn export_all<S>(store: &S, now: DateTime<Utc>) -> Result<DatabaseDump, CoreError>
where
    S: BillingStore + ?Sized,
{
    let dump = DatabaseDump {
        exported_at: now,
        settings: store.current_settings().await?,
        users: store.list_users().await?,
        flats: store.list_flats().await?,
        readings: store.list_readings(&ReadingFilter::default()).await?,
    };
    info!(
        users = dump.users.len(),
        flats = dump.flats.len(),
        readings = dump.readings.len(),
        "Exported database"
    );
    Ok(dump)
}

/// Writes every record back as-is through the `put_*` port methods. Records
/// with an existing id are overwritten; nothing is deleted and the monthly
/// gate is not re-checked.
///
/// Records are written one by one, so a failure leaves the earlier ones in
/// place. Stores that can do better implement [`DumpImport`].
pub async fn import_all<S>(store: &S, dump: DatabaseDump) -> Result<ImportSummary, CoreError>
where
    S: BillingStore + ?Sized,
{
    let summary = ImportSummary::of(&dump);
    store.put_settings(dump.settings).await?;
    for flat in dump.flats {
        store.put_flat(flat).await?;
    }
    for user in dump.users {
        store.put_user(user).await?;
    }
    for reading in dump.readings {
        store.put_reading(reading).await?;
    }

    info!(
        users = summary.users,
        flats = summary.flats,
        readings = summary.readings,
        "Imported database"
    );
    Ok(summary)
}
