use crate::{
    CoreError, FlatRepository, ReadingRepository, SettingsStore, UserRepository,
    domain::{
        billing::{self, TariffSnapshot},
        flat::Flat,
        reading::{self, Reading, ReadingFilter},
        settings::{GlobalSettings, SettingsUpdate},
        user::User,
    },
    transfer::{self, DatabaseDump, DumpImport, ImportSummary},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// In-memory implementation of every storage port, for tests and
/// single-process mode. Reading writes that depend on a flat's history are
/// serialized through a per-flat async mutex.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    users: Arc<DashMap<String, User>>,
    flats: Arc<DashMap<String, Flat>>,
    readings: Arc<DashMap<String, Reading>>,
    settings: Arc<RwLock<GlobalSettings>>,
    flat_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_flat(&self, flat_id: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so no map guard is held across the await.
        let lock = self
            .flat_locks
            .entry(flat_id.to_string())
            .or_default()
            .value()
            .clone();
        lock.lock_owned().await
    }

    fn readings_of(&self, flat_id: &str) -> Vec<Reading> {
        self.readings
            .iter()
            .filter(|entry| entry.value().flat_id == flat_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn require_reading(&self, reading_id: &str) -> Result<Reading, CoreError> {
        self.readings
            .get(reading_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("Reading not found: {}", reading_id)))
    }

    /// Applies `transition` to the stored reading while holding its flat's lock.
    async fn transition<F>(&self, reading_id: &str, transition: F) -> Result<Reading, CoreError>
    where
        F: FnOnce(&Reading) -> Result<Reading, CoreError>,
    {
        let flat_id = self.require_reading(reading_id)?.flat_id;
        let _guard = self.lock_flat(&flat_id).await;
        let current = self.require_reading(reading_id)?;
        let next = transition(&current)?;
        self.readings.insert(next.id.clone(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn create_user(&self, user: User) -> Result<User, CoreError> {
        if self
            .users
            .iter()
            .any(|entry| entry.value().username == user.username)
        {
            return Err(CoreError::AlreadyExists(format!(
                "Username already taken: {}",
                user.username
            )));
        }
        self.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError> {
        Ok(self.users.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, CoreError> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().username == username)
            .map(|entry| entry.value().clone()))
    }

    async fn list_users(&self) -> Result<Vec<User>, CoreError> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn count_users(&self) -> Result<u64, CoreError> {
        Ok(self.users.len() as u64)
    }

    async fn set_password_hash(
        &self,
        user_id: &str,
        password_hash: &str,
    ) -> Result<(), CoreError> {
        match self.users.get_mut(user_id) {
            Some(mut entry) => {
                entry.value_mut().password_hash = password_hash.to_string();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("User not found: {}", user_id))),
        }
    }

    async fn set_flat(&self, user_id: &str, flat_id: Option<&str>) -> Result<(), CoreError> {
        match self.users.get_mut(user_id) {
            Some(mut entry) => {
                entry.value_mut().flat_id = flat_id.map(str::to_string);
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("User not found: {}", user_id))),
        }
    }

    async fn put_user(&self, user: User) -> Result<(), CoreError> {
        self.users.insert(user.id.clone(), user);
        Ok(())
    }
}

#[async_trait]
impl FlatRepository for InMemoryStore {
    async fn create_flat(&self, flat: Flat) -> Result<Flat, CoreError> {
        if self
            .flats
            .iter()
            .any(|entry| entry.value().flat_number == flat.flat_number)
        {
            return Err(CoreError::AlreadyExists(format!(
                "Flat number already in use: {}",
                flat.flat_number
            )));
        }
        self.flats.insert(flat.id.clone(), flat.clone());
        Ok(flat)
    }

    async fn update_flat(&self, flat: Flat) -> Result<Flat, CoreError> {
        if !self.flats.contains_key(&flat.id) {
            return Err(CoreError::NotFound(format!("Flat not found: {}", flat.id)));
        }
        if self
            .flats
            .iter()
            .any(|entry| entry.key() != &flat.id && entry.value().flat_number == flat.flat_number)
        {
            return Err(CoreError::AlreadyExists(format!(
                "Flat number already in use: {}",
                flat.flat_number
            )));
        }
        self.flats.insert(flat.id.clone(), flat.clone());
        Ok(flat)
    }

    async fn get_flat(&self, flat_id: &str) -> Result<Option<Flat>, CoreError> {
        Ok(self.flats.get(flat_id).map(|entry| entry.value().clone()))
    }

    async fn list_flats(&self) -> Result<Vec<Flat>, CoreError> {
        let mut flats: Vec<Flat> = self.flats.iter().map(|e| e.value().clone()).collect();
        flats.sort_by(|a, b| a.flat_number.cmp(&b.flat_number));
        Ok(flats)
    }

    async fn put_flat(&self, flat: Flat) -> Result<(), CoreError> {
        self.flats.insert(flat.id.clone(), flat);
        Ok(())
    }
}

#[async_trait]
impl ReadingRepository for InMemoryStore {
    async fn submit_reading(&self, new_reading: Reading) -> Result<Reading, CoreError> {
        let _guard = self.lock_flat(&new_reading.flat_id).await;
        let existing = self.readings_of(&new_reading.flat_id);
        reading::ensure_month_open(&existing, &new_reading.flat_id, new_reading.bucket())?;
        self.readings
            .insert(new_reading.id.clone(), new_reading.clone());
        Ok(new_reading)
    }

    async fn get_reading(&self, reading_id: &str) -> Result<Option<Reading>, CoreError> {
        Ok(self.readings.get(reading_id).map(|entry| entry.value().clone()))
    }

    async fn list_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>, CoreError> {
        let mut readings: Vec<Reading> = self
            .readings
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        reading::sort_newest_first(&mut readings);
        Ok(readings
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn approve_reading(
        &self,
        reading_id: &str,
        corrected_reading: Decimal,
        rates: &TariffSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Reading, CoreError> {
        let flat_id = self.require_reading(reading_id)?.flat_id;
        let initial_reading = self
            .flats
            .get(&flat_id)
            .and_then(|entry| entry.value().initial_reading);

        self.transition(reading_id, |current| {
            let history = self.readings_of(&current.flat_id);
            let previous = billing::previous_reading(&history, &current.id, initial_reading);
            Ok(current.approve(corrected_reading, previous, rates, now)?)
        })
        .await
    }

    async fn reject_reading(
        &self,
        reading_id: &str,
        reason: Option<String>,
    ) -> Result<Reading, CoreError> {
        self.transition(reading_id, |current| Ok(current.reject(reason)?))
            .await
    }

    async fn reopen_reading(
        &self,
        reading_id: &str,
        reason: String,
    ) -> Result<Reading, CoreError> {
        self.transition(reading_id, |current| Ok(current.reopen(reason)?))
            .await
    }

    async fn put_reading(&self, reading: Reading) -> Result<(), CoreError> {
        self.readings.insert(reading.id.clone(), reading);
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn current_settings(&self) -> Result<GlobalSettings, CoreError> {
        Ok(self.settings.read().await.clone())
    }

    async fn update_settings(
        &self,
        update: SettingsUpdate,
        now: DateTime<Utc>,
    ) -> Result<GlobalSettings, CoreError> {
        let mut settings = self.settings.write().await;
        let next = settings.apply(&update, now)?;
        *settings = next.clone();
        Ok(next)
    }

    async fn put_settings(&self, settings: GlobalSettings) -> Result<(), CoreError> {
        *self.settings.write().await = settings;
        Ok(())
    }
}

/// Every `put_*` above is infallible, so the record-by-record import is
/// already all-or-nothing here.
#[async_trait]
impl DumpImport for InMemoryStore {
    async fn import_dump(&self, dump: DatabaseDump) -> Result<ImportSummary, CoreError> {
        transfer::import_all(self, dump).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        flat::FlatDetails,
        reading::{ReadingStatus, SubmitReading, tests::{at, dec, snapshot}},
        user::Role,
    };

    async fn store_with_flat(initial: Option<Decimal>) -> (InMemoryStore, Flat) {
        let store = InMemoryStore::new();
        let flat = Flat::create(
            FlatDetails {
                flat_number: "A-101".into(),
                tenant_name: None,
                tariff_override: None,
                user_id: None,
                initial_reading: initial,
            },
            at(2024, 1, 1),
        )
        .unwrap();
        let flat = store.create_flat(flat).await.unwrap();
        (store, flat)
    }

    fn submission(flat_id: &str, value: &str, now: DateTime<Utc>) -> Reading {
        Reading::submit(
            SubmitReading {
                flat_id: flat_id.to_string(),
                image_ref: "photo.jpg".into(),
                tenant_reading: dec(value),
            },
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_enforces_one_reading_per_month() {
        let (store, flat) = store_with_flat(None).await;
        store
            .submit_reading(submission(&flat.id, "10", at(2024, 5, 1)))
            .await
            .unwrap();

        let second = store
            .submit_reading(submission(&flat.id, "11", at(2024, 5, 20)))
            .await;
        match second {
            Err(CoreError::Conflict(msg)) => assert!(msg.contains("2024-05-01")),
            other => panic!("Expected Conflict, got {:?}", other),
        }

        // Next month is open.
        assert!(
            store
                .submit_reading(submission(&flat.id, "12", at(2024, 6, 1)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_rejected_reading_frees_the_month() {
        let (store, flat) = store_with_flat(None).await;
        let first = store
            .submit_reading(submission(&flat.id, "10", at(2024, 5, 1)))
            .await
            .unwrap();
        store
            .reject_reading(&first.id, Some("blurry".into()))
            .await
            .unwrap();

        assert!(
            store
                .submit_reading(submission(&flat.id, "10", at(2024, 5, 2)))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_first_approval_uses_initial_reading() {
        let (store, flat) = store_with_flat(Some(dec("100"))).await;
        let reading = store
            .submit_reading(submission(&flat.id, "150", at(2024, 5, 1)))
            .await
            .unwrap();

        let approved = store
            .approve_reading(&reading.id, dec("150"), &snapshot("7.5"), at(2024, 5, 2))
            .await
            .unwrap();
        assert_eq!(approved.previous_reading, Some(dec("100")));
        assert_eq!(approved.amount, Some(dec("1112.5")));
        assert_eq!(
            store.get_reading(&reading.id).await.unwrap().unwrap(),
            approved
        );
    }

    #[tokio::test]
    async fn test_approval_chains_on_previous_approval() {
        let (store, flat) = store_with_flat(None).await;
        let may = store
            .submit_reading(submission(&flat.id, "100", at(2024, 5, 1)))
            .await
            .unwrap();
        let may = store
            .approve_reading(&may.id, dec("100"), &snapshot("1"), at(2024, 5, 2))
            .await
            .unwrap();
        assert_eq!(may.previous_reading, Some(Decimal::ZERO));

        let june = store
            .submit_reading(submission(&flat.id, "130", at(2024, 6, 1)))
            .await
            .unwrap();
        let june = store
            .approve_reading(&june.id, dec("130"), &snapshot("1"), at(2024, 6, 2))
            .await
            .unwrap();
        assert_eq!(june.previous_reading, Some(dec("100")));
        assert_eq!(june.units_used, Some(dec("30")));
    }

    #[tokio::test]
    async fn test_settings_change_does_not_touch_approved_amounts() {
        let (store, flat) = store_with_flat(Some(dec("100"))).await;
        store
            .update_settings(
                SettingsUpdate {
                    tariff_per_unit: Some(dec("7.5")),
                    ..SettingsUpdate::default()
                },
                at(2024, 4, 1),
            )
            .await
            .unwrap();
        let reading = store
            .submit_reading(submission(&flat.id, "150", at(2024, 5, 1)))
            .await
            .unwrap();
        let rates = store.current_settings().await.unwrap().snapshot();
        store
            .approve_reading(&reading.id, dec("150"), &rates, at(2024, 5, 2))
            .await
            .unwrap();

        store
            .update_settings(
                SettingsUpdate {
                    tariff_per_unit: Some(dec("20")),
                    ..SettingsUpdate::default()
                },
                at(2024, 5, 3),
            )
            .await
            .unwrap();

        let stored = store.get_reading(&reading.id).await.unwrap().unwrap();
        assert_eq!(stored.amount, Some(dec("1112.5")));
        assert_eq!(stored.tariff_at_approval, Some(dec("7.5")));
        assert_eq!(stored.settings_version_at_approval, Some(2));
    }

    #[tokio::test]
    async fn test_reapproval_and_missing_reading() {
        let (store, flat) = store_with_flat(None).await;
        let reading = store
            .submit_reading(submission(&flat.id, "10", at(2024, 5, 1)))
            .await
            .unwrap();
        store
            .approve_reading(&reading.id, dec("10"), &snapshot("1"), at(2024, 5, 2))
            .await
            .unwrap();

        let again = store
            .approve_reading(&reading.id, dec("12"), &snapshot("1"), at(2024, 5, 3))
            .await;
        assert!(matches!(again, Err(CoreError::Conflict(_))));

        let missing = store
            .approve_reading("nope", dec("12"), &snapshot("1"), at(2024, 5, 3))
            .await;
        assert!(matches!(missing, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reopen_returns_reading_to_queue() {
        let (store, flat) = store_with_flat(None).await;
        let reading = store
            .submit_reading(submission(&flat.id, "10", at(2024, 5, 1)))
            .await
            .unwrap();
        store
            .approve_reading(&reading.id, dec("10"), &snapshot("1"), at(2024, 5, 2))
            .await
            .unwrap();
        let reopened = store
            .reopen_reading(&reading.id, "wrong photo".into())
            .await
            .unwrap();
        assert_eq!(reopened.status, ReadingStatus::Pending);

        let queue = store
            .list_readings(&ReadingFilter {
                status: Some(ReadingStatus::Pending),
                ..ReadingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);

        // Still occupies the month.
        assert!(
            store
                .submit_reading(submission(&flat.id, "11", at(2024, 5, 9)))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_concurrent_submissions_for_one_flat_admit_one() {
        let (store, flat) = store_with_flat(None).await;
        let mut handles = Vec::new();
        for day in 1..=8 {
            let store = store.clone();
            let reading = submission(&flat.id, "10", at(2024, 5, day));
            handles.push(tokio::spawn(
                async move { store.submit_reading(reading).await },
            ));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_chain_on_each_other() {
        let (store, flat) = store_with_flat(Some(dec("100"))).await;
        let may = store
            .submit_reading(submission(&flat.id, "150", at(2024, 5, 1)))
            .await
            .unwrap();
        let june = store
            .submit_reading(submission(&flat.id, "200", at(2024, 6, 1)))
            .await
            .unwrap();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for (id, value) in [(may.id.clone(), "150"), (june.id.clone(), "200")] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .approve_reading(&id, dec(value), &snapshot("1"), Utc::now())
                    .await
            }));
        }
        let mut approved = Vec::new();
        for handle in handles {
            approved.push(handle.await.unwrap().unwrap());
        }

        // Whichever ran second must have seen the first as its baseline.
        let (a, b) = (&approved[0], &approved[1]);
        let chained = [(a, b), (b, a)]
            .into_iter()
            .filter(|(first, second)| second.previous_reading == first.corrected_reading)
            .count();
        assert_eq!(chained, 1);
        let from_initial = approved
            .iter()
            .filter(|r| r.previous_reading == Some(dec("100")))
            .count();
        assert_eq!(from_initial, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_approval_is_refused_and_stays_pending() {
        let (store, flat) = store_with_flat(None).await;
        let reading = store
            .submit_reading(submission(&flat.id, "10", at(2024, 5, 1)))
            .await
            .unwrap();

        let result = store
            .approve_reading(
                &reading.id,
                dec("70000000000000000000000000000"),
                &snapshot("7.5"),
                at(2024, 5, 2),
            )
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));

        let stored = store.get_reading(&reading.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReadingStatus::Pending);
        assert_eq!(stored.amount, None);
    }

    #[tokio::test]
    async fn test_list_readings_pages_after_sorting() {
        let (store, flat) = store_with_flat(None).await;
        for month in 1..=5 {
            store
                .submit_reading(submission(&flat.id, "1", at(2024, month, 1)))
                .await
                .unwrap();
        }
        let page = store
            .list_readings(&ReadingFilter::for_flat(flat.id.clone()).page(2, 1))
            .await
            .unwrap();
        let months: Vec<u32> = page.iter().map(|r| r.bucket().month()).collect();
        assert_eq!(months, vec![4, 3]);

        let past_end = store
            .list_readings(&ReadingFilter::default().page(10, 5))
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_list_readings_newest_first() {
        let (store, flat) = store_with_flat(None).await;
        for month in [3, 5, 4] {
            store
                .submit_reading(submission(&flat.id, "1", at(2024, month, 1)))
                .await
                .unwrap();
        }
        let all = store
            .list_readings(&ReadingFilter::for_flat(flat.id.clone()))
            .await
            .unwrap();
        let months: Vec<u32> = all.iter().map(|r| r.bucket().month()).collect();
        assert_eq!(months, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_user_repository() {
        let store = InMemoryStore::new();
        let user = User {
            id: "u1".into(),
            username: "admin".into(),
            password_hash: "h1".into(),
            role: Role::Admin,
            flat_id: None,
            created_at: at(2024, 1, 1),
        };
        store.create_user(user.clone()).await.unwrap();
        assert!(matches!(
            store.create_user(User { id: "u2".into(), ..user.clone() }).await,
            Err(CoreError::AlreadyExists(_))
        ));
        assert_eq!(store.count_users().await.unwrap(), 1);

        store.set_password_hash("u1", "h2").await.unwrap();
        let found = store.find_by_username("admin").await.unwrap().unwrap();
        assert_eq!(found.password_hash, "h2");
        assert!(store.set_password_hash("missing", "h").await.is_err());

        store.set_flat("u1", Some("f1")).await.unwrap();
        let linked = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(linked.flat_id.as_deref(), Some("f1"));
        store.set_flat("u1", None).await.unwrap();
        assert_eq!(store.get_user("u1").await.unwrap().unwrap().flat_id, None);
        assert!(matches!(
            store.set_flat("missing", None).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_flat_number() {
        let (store, flat) = store_with_flat(None).await;
        let dup = Flat {
            id: "other".into(),
            ..flat.clone()
        };
        assert!(matches!(
            store.create_flat(dup).await,
            Err(CoreError::AlreadyExists(_))
        ));
    }
}
