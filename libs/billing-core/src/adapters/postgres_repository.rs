use crate::{
    CoreError, FlatRepository, ReadingRepository, SettingsStore, UserRepository,
    domain::{
        billing::{self, TariffSnapshot},
        flat::Flat,
        reading::{self, Reading, ReadingFilter, ReadingStatus, YearMonth},
        settings::{GlobalSettings, SettingsUpdate},
        user::{Role, User},
    },
    transfer::{DatabaseDump, DumpImport, ImportSummary},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction, postgres::PgPoolOptions};
use tracing::info;

const USER_SELECT: &str =
    "SELECT id, username, password_hash, role, flat_id, created_at FROM users";

const FLAT_SELECT: &str = "SELECT id, flat_number, tenant_name, tariff_override, user_id, \
     initial_reading, created_at FROM flats";

const SETTINGS_SELECT: &str = "SELECT version, tariff_per_unit, minimum_price, unit_factor, \
     updated_at FROM global_settings WHERE id = 1";

const READING_SELECT: &str = "SELECT id, flat_id, image_ref, tenant_reading, ocr_reading, \
     corrected_reading, previous_reading, units_used, amount, status, created_at, approved_at, \
     month, tariff_at_approval, unit_factor_at_approval, minimum_price_at_approval, \
     settings_version_at_approval, rejection_reason, reopen_reason FROM readings";

#[derive(sqlx::FromRow, Debug)]
struct UserRow {
    id: String,
    username: String,
    password_hash: String,
    role: String,
    flat_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = CoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            role: row.role.parse::<Role>().map_err(corrupt)?,
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            flat_id: row.flat_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct FlatRow {
    id: String,
    flat_number: String,
    tenant_name: Option<String>,
    tariff_override: Option<Decimal>,
    user_id: Option<String>,
    initial_reading: Option<Decimal>,
    created_at: DateTime<Utc>,
}

impl From<FlatRow> for Flat {
    fn from(row: FlatRow) -> Self {
        Flat {
            id: row.id,
            flat_number: row.flat_number,
            tenant_name: row.tenant_name,
            tariff_override: row.tariff_override,
            user_id: row.user_id,
            initial_reading: row.initial_reading,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct SettingsRow {
    version: i64,
    tariff_per_unit: Decimal,
    minimum_price: Decimal,
    unit_factor: Decimal,
    updated_at: DateTime<Utc>,
}

impl From<SettingsRow> for GlobalSettings {
    fn from(row: SettingsRow) -> Self {
        GlobalSettings {
            version: row.version as u64,
            tariff_per_unit: row.tariff_per_unit,
            minimum_price: row.minimum_price,
            unit_factor: row.unit_factor,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct ReadingRow {
    id: String,
    flat_id: String,
    image_ref: String,
    tenant_reading: Option<Decimal>,
    ocr_reading: Option<Decimal>,
    corrected_reading: Option<Decimal>,
    previous_reading: Option<Decimal>,
    units_used: Option<Decimal>,
    amount: Option<Decimal>,
    status: String,
    created_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    month: Option<String>,
    tariff_at_approval: Option<Decimal>,
    unit_factor_at_approval: Option<Decimal>,
    minimum_price_at_approval: Option<Decimal>,
    settings_version_at_approval: Option<i64>,
    rejection_reason: Option<String>,
    reopen_reason: Option<String>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = CoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        let month = row
            .month
            .as_deref()
            .map(str::parse::<YearMonth>)
            .transpose()
            .map_err(corrupt)?;
        Ok(Reading {
            status: row.status.parse::<ReadingStatus>().map_err(corrupt)?,
            month,
            id: row.id,
            flat_id: row.flat_id,
            image_ref: row.image_ref,
            tenant_reading: row.tenant_reading,
            ocr_reading: row.ocr_reading,
            corrected_reading: row.corrected_reading,
            previous_reading: row.previous_reading,
            units_used: row.units_used,
            amount: row.amount,
            created_at: row.created_at,
            approved_at: row.approved_at,
            tariff_at_approval: row.tariff_at_approval,
            unit_factor_at_approval: row.unit_factor_at_approval,
            minimum_price_at_approval: row.minimum_price_at_approval,
            settings_version_at_approval: row.settings_version_at_approval.map(|v| v as u64),
            rejection_reason: row.rejection_reason,
            reopen_reason: row.reopen_reason,
        })
    }
}

fn corrupt(err: impl std::fmt::Display) -> CoreError {
    CoreError::Internal(format!("Corrupt row: {}", err))
}

/// Serializes writers of one flat until the surrounding transaction ends.
async fn lock_flat(conn: &mut PgConnection, flat_id: &str) -> Result<(), CoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(flat_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn fetch_reading(
    conn: &mut PgConnection,
    reading_id: &str,
) -> Result<Option<Reading>, CoreError> {
    let row: Option<ReadingRow> = sqlx::query_as(&format!("{} WHERE id = $1", READING_SELECT))
        .bind(reading_id)
        .fetch_optional(conn)
        .await?;
    row.map(Reading::try_from).transpose()
}

async fn fetch_flat_readings(
    conn: &mut PgConnection,
    flat_id: &str,
) -> Result<Vec<Reading>, CoreError> {
    let rows: Vec<ReadingRow> = sqlx::query_as(&format!("{} WHERE flat_id = $1", READING_SELECT))
        .bind(flat_id)
        .fetch_all(conn)
        .await?;
    rows.into_iter().map(Reading::try_from).collect()
}

async fn upsert_reading(conn: &mut PgConnection, r: &Reading) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO readings (id, flat_id, image_ref, tenant_reading, ocr_reading, \
         corrected_reading, previous_reading, units_used, amount, status, created_at, \
         approved_at, month, tariff_at_approval, unit_factor_at_approval, \
         minimum_price_at_approval, settings_version_at_approval, rejection_reason, reopen_reason) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
         ON CONFLICT (id) DO UPDATE SET \
         flat_id = EXCLUDED.flat_id, image_ref = EXCLUDED.image_ref, \
         tenant_reading = EXCLUDED.tenant_reading, ocr_reading = EXCLUDED.ocr_reading, \
         corrected_reading = EXCLUDED.corrected_reading, \
         previous_reading = EXCLUDED.previous_reading, units_used = EXCLUDED.units_used, \
         amount = EXCLUDED.amount, status = EXCLUDED.status, created_at = EXCLUDED.created_at, \
         approved_at = EXCLUDED.approved_at, month = EXCLUDED.month, \
         tariff_at_approval = EXCLUDED.tariff_at_approval, \
         unit_factor_at_approval = EXCLUDED.unit_factor_at_approval, \
         minimum_price_at_approval = EXCLUDED.minimum_price_at_approval, \
         settings_version_at_approval = EXCLUDED.settings_version_at_approval, \
         rejection_reason = EXCLUDED.rejection_reason, reopen_reason = EXCLUDED.reopen_reason",
    )
    .bind(&r.id)
    .bind(&r.flat_id)
    .bind(&r.image_ref)
    .bind(r.tenant_reading)
    .bind(r.ocr_reading)
    .bind(r.corrected_reading)
    .bind(r.previous_reading)
    .bind(r.units_used)
    .bind(r.amount)
    .bind(r.status.as_str())
    .bind(r.created_at)
    .bind(r.approved_at)
    // Always filled so month filters can use readings_month_idx.
    .bind(r.bucket().to_string())
    .bind(r.tariff_at_approval)
    .bind(r.unit_factor_at_approval)
    .bind(r.minimum_price_at_approval)
    .bind(r.settings_version_at_approval.map(|v| v as i64))
    .bind(&r.rejection_reason)
    .bind(&r.reopen_reason)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_user(conn: &mut PgConnection, user: &User) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO users (id, username, password_hash, role, flat_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username, \
         password_hash = EXCLUDED.password_hash, role = EXCLUDED.role, \
         flat_id = EXCLUDED.flat_id, created_at = EXCLUDED.created_at",
    )
    .bind(&user.id)
    .bind(&user.username)
    .bind(&user.password_hash)
    .bind(user.role.as_str())
    .bind(&user.flat_id)
    .bind(user.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_flat(conn: &mut PgConnection, flat: &Flat) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO flats (id, flat_number, tenant_name, tariff_override, user_id, \
         initial_reading, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (id) DO UPDATE SET flat_number = EXCLUDED.flat_number, \
         tenant_name = EXCLUDED.tenant_name, tariff_override = EXCLUDED.tariff_override, \
         user_id = EXCLUDED.user_id, initial_reading = EXCLUDED.initial_reading, \
         created_at = EXCLUDED.created_at",
    )
    .bind(&flat.id)
    .bind(&flat.flat_number)
    .bind(&flat.tenant_name)
    .bind(flat.tariff_override)
    .bind(&flat.user_id)
    .bind(flat.initial_reading)
    .bind(flat.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_settings(
    conn: &mut PgConnection,
    settings: &GlobalSettings,
) -> Result<(), CoreError> {
    sqlx::query(
        "INSERT INTO global_settings (id, version, tariff_per_unit, minimum_price, \
         unit_factor, updated_at) VALUES (1, $1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version, \
         tariff_per_unit = EXCLUDED.tariff_per_unit, \
         minimum_price = EXCLUDED.minimum_price, unit_factor = EXCLUDED.unit_factor, \
         updated_at = EXCLUDED.updated_at",
    )
    .bind(settings.version as i64)
    .bind(settings.tariff_per_unit)
    .bind(settings.minimum_price)
    .bind(settings.unit_factor)
    .bind(settings.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// PostgreSQL implementation of every storage port.
///
/// Reading writes run in a transaction holding a per-flat advisory lock, so
/// the monthly gate and the previous-reading lookup cannot race.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Infrastructure(Box::new(e)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a transaction holding the lock of the reading's flat and
    /// returns the reading as seen under that lock.
    async fn begin_on_reading(
        &self,
        reading_id: &str,
    ) -> Result<(Transaction<'static, Postgres>, Reading), CoreError> {
        let not_found = || CoreError::NotFound(format!("Reading not found: {}", reading_id));
        let flat_id: String = sqlx::query_scalar("SELECT flat_id FROM readings WHERE id = $1")
            .bind(reading_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(not_found)?;

        let mut tx = self.pool.begin().await?;
        lock_flat(&mut tx, &flat_id).await?;
        let current = fetch_reading(&mut tx, reading_id)
            .await?
            .ok_or_else(not_found)?;
        Ok((tx, current))
    }

    async fn save_transition(
        mut tx: Transaction<'static, Postgres>,
        next: Reading,
    ) -> Result<Reading, CoreError> {
        upsert_reading(&mut tx, &next).await?;
        tx.commit().await?;
        Ok(next)
    }
}

#[async_trait]
impl UserRepository for PostgresStore {
    async fn create_user(&self, user: User) -> Result<User, CoreError> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, role, flat_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(&user.flat_id)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match CoreError::from(e) {
            CoreError::AlreadyExists(_) => {
                CoreError::AlreadyExists(format!("Username already taken: {}", user.username))
            }
            other => other,
        })?;
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError> {
        let row: Option<UserRow> = sqlx::query_as(&format!("{} WHERE id = $1", USER_SELECT))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, CoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("{} WHERE username = $1", USER_SELECT))
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        row.map(User::try_from).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>, CoreError> {
        let rows: Vec<UserRow> = sqlx::query_as(&format!("{} ORDER BY username", USER_SELECT))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(User::try_from).collect()
    }

    async fn count_users(&self) -> Result<u64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn set_password_hash(
        &self,
        user_id: &str,
        password_hash: &str,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("User not found: {}", user_id)));
        }
        Ok(())
    }

    async fn set_flat(&self, user_id: &str, flat_id: Option<&str>) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE users SET flat_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(flat_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("User not found: {}", user_id)));
        }
        Ok(())
    }

    async fn put_user(&self, user: User) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_user(&mut conn, &user).await
    }
}

#[async_trait]
impl FlatRepository for PostgresStore {
    async fn create_flat(&self, flat: Flat) -> Result<Flat, CoreError> {
        sqlx::query(
            "INSERT INTO flats (id, flat_number, tenant_name, tariff_override, user_id, \
             initial_reading, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&flat.id)
        .bind(&flat.flat_number)
        .bind(&flat.tenant_name)
        .bind(flat.tariff_override)
        .bind(&flat.user_id)
        .bind(flat.initial_reading)
        .bind(flat.created_at)
        .execute(&self.pool)
        .await?;
        Ok(flat)
    }

    async fn update_flat(&self, flat: Flat) -> Result<Flat, CoreError> {
        let result = sqlx::query(
            "UPDATE flats SET flat_number = $2, tenant_name = $3, tariff_override = $4, \
             user_id = $5, initial_reading = $6 WHERE id = $1",
        )
        .bind(&flat.id)
        .bind(&flat.flat_number)
        .bind(&flat.tenant_name)
        .bind(flat.tariff_override)
        .bind(&flat.user_id)
        .bind(flat.initial_reading)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Flat not found: {}", flat.id)));
        }
        Ok(flat)
    }

    async fn get_flat(&self, flat_id: &str) -> Result<Option<Flat>, CoreError> {
        let row: Option<FlatRow> = sqlx::query_as(&format!("{} WHERE id = $1", FLAT_SELECT))
            .bind(flat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Flat::from))
    }

    async fn list_flats(&self) -> Result<Vec<Flat>, CoreError> {
        let rows: Vec<FlatRow> = sqlx::query_as(&format!("{} ORDER BY flat_number", FLAT_SELECT))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Flat::from).collect())
    }

    async fn put_flat(&self, flat: Flat) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_flat(&mut conn, &flat).await
    }
}

#[async_trait]
impl ReadingRepository for PostgresStore {
    async fn submit_reading(&self, new_reading: Reading) -> Result<Reading, CoreError> {
        let mut tx = self.pool.begin().await?;
        lock_flat(&mut tx, &new_reading.flat_id).await?;

        let existing = fetch_flat_readings(&mut tx, &new_reading.flat_id).await?;
        reading::ensure_month_open(&existing, &new_reading.flat_id, new_reading.bucket())?;

        upsert_reading(&mut tx, &new_reading).await?;
        tx.commit().await?;
        Ok(new_reading)
    }

    async fn get_reading(&self, reading_id: &str) -> Result<Option<Reading>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_reading(&mut conn, reading_id).await
    }

    async fn list_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>, CoreError> {
        let mut query = QueryBuilder::<Postgres>::new(READING_SELECT);
        query.push(" WHERE TRUE");
        if let Some(flat_id) = &filter.flat_id {
            query.push(" AND flat_id = ").push_bind(flat_id.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(month) = filter.month {
            query.push(" AND month = ").push_bind(month.to_string());
        }
        query.push(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(offset) = filter.offset {
            query.push(" OFFSET ").push_bind(offset as i64);
        }

        let rows: Vec<ReadingRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn approve_reading(
        &self,
        reading_id: &str,
        corrected_reading: Decimal,
        rates: &TariffSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Reading, CoreError> {
        let (mut tx, current) = self.begin_on_reading(reading_id).await?;

        let history = fetch_flat_readings(&mut tx, &current.flat_id).await?;
        let initial_reading = sqlx::query_scalar::<_, Option<Decimal>>(
            "SELECT initial_reading FROM flats WHERE id = $1",
        )
        .bind(&current.flat_id)
        .fetch_optional(&mut *tx)
        .await?
        .flatten();
        let previous = billing::previous_reading(&history, &current.id, initial_reading);

        let next = current.approve(corrected_reading, previous, rates, now)?;
        Self::save_transition(tx, next).await
    }

    async fn reject_reading(
        &self,
        reading_id: &str,
        reason: Option<String>,
    ) -> Result<Reading, CoreError> {
        let (tx, current) = self.begin_on_reading(reading_id).await?;
        let next = current.reject(reason)?;
        Self::save_transition(tx, next).await
    }

    async fn reopen_reading(
        &self,
        reading_id: &str,
        reason: String,
    ) -> Result<Reading, CoreError> {
        let (tx, current) = self.begin_on_reading(reading_id).await?;
        let next = current.reopen(reason)?;
        Self::save_transition(tx, next).await
    }

    async fn put_reading(&self, reading: Reading) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_reading(&mut conn, &reading).await
    }
}

#[async_trait]
impl SettingsStore for PostgresStore {
    async fn current_settings(&self) -> Result<GlobalSettings, CoreError> {
        let row: SettingsRow = sqlx::query_as(SETTINGS_SELECT)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::Configuration("global_settings row is missing".into()))?;
        Ok(row.into())
    }

    async fn update_settings(
        &self,
        update: SettingsUpdate,
        now: DateTime<Utc>,
    ) -> Result<GlobalSettings, CoreError> {
        let mut tx = self.pool.begin().await?;
        let row: SettingsRow = sqlx::query_as(&format!("{} FOR UPDATE", SETTINGS_SELECT))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::Configuration("global_settings row is missing".into()))?;

        let next = GlobalSettings::from(row).apply(&update, now)?;
        sqlx::query(
            "UPDATE global_settings SET version = $1, tariff_per_unit = $2, \
             minimum_price = $3, unit_factor = $4, updated_at = $5 WHERE id = 1",
        )
        .bind(next.version as i64)
        .bind(next.tariff_per_unit)
        .bind(next.minimum_price)
        .bind(next.unit_factor)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn put_settings(&self, settings: GlobalSettings) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_settings(&mut conn, &settings).await
    }
}

/// The whole dump is written in one transaction; any failing row rolls
/// every other row back.
#[async_trait]
impl DumpImport for PostgresStore {
    async fn import_dump(&self, dump: DatabaseDump) -> Result<ImportSummary, CoreError> {
        let summary = ImportSummary::of(&dump);
        let mut tx = self.pool.begin().await?;
        upsert_settings(&mut tx, &dump.settings).await?;
        for flat in &dump.flats {
            upsert_flat(&mut tx, flat).await?;
        }
        for user in &dump.users {
            upsert_user(&mut tx, user).await?;
        }
        for reading in &dump.readings {
            upsert_reading(&mut tx, reading).await?;
        }
        tx.commit().await?;
        info!(
            users = summary.users,
            flats = summary.flats,
            readings = summary.readings,
            "Imported database in one transaction"
        );
        Ok(summary)
    }
}
