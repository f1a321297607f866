use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use itrack_core::{
    Listing, ListingId, ListingPage, ListingQuery, NewListing, NewUser, Preferences,
    ReminderBatch, ReminderWindow, SaveOutcome, SavedEntry, SavedStatus, User, UserId,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{LeaseStore, ListingStore, StoreError, StoreResult, UserStore};

/// Process-local store used for tests and database-less runs.
///
/// Enforces the same uniqueness rules as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    listings: BTreeMap<ListingId, Listing>,
    users: BTreeMap<UserId, User>,
    leases: HashMap<String, LeaseRecord>,
}

#[derive(Debug, Clone, Copy)]
struct LeaseRecord {
    holder: Uuid,
    expires_at: DateTime<Utc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listing_count(&self) -> usize {
        self.state.lock().await.listings.len()
    }
}

fn user_mut(state: &mut MemoryState, user_id: UserId) -> StoreResult<&mut User> {
    state
        .users
        .get_mut(&user_id)
        .ok_or(StoreError::NotFound { entity: "user" })
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn find_listing_by_id(&self, id: ListingId) -> StoreResult<Option<Listing>> {
        Ok(self.state.lock().await.listings.get(&id).cloned())
    }

    async fn find_listing_by_source_url(
        &self,
        source_url: &str,
    ) -> StoreResult<Option<Listing>> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .values()
            .find(|l| l.source_url.as_deref() == Some(source_url))
            .cloned())
    }

    async fn find_listing_by_hash(&self, unique_hash: &str) -> StoreResult<Option<Listing>> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .values()
            .find(|l| l.unique_hash == unique_hash)
            .cloned())
    }

    async fn listings_by_ids(&self, ids: &[ListingId]) -> StoreResult<Vec<Listing>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.listings.get(id).cloned())
            .collect())
    }

    async fn insert_listing(&self, listing: NewListing) -> StoreResult<Listing> {
        let mut state = self.state.lock().await;
        if let Some(url) = listing.draft.source_url.as_deref() {
            if state
                .listings
                .values()
                .any(|l| l.source_url.as_deref() == Some(url))
            {
                return Err(StoreError::UniqueViolation {
                    constraint: "listings_source_url_key".to_string(),
                });
            }
        }
        if state
            .listings
            .values()
            .any(|l| l.unique_hash == listing.identity.unique_hash)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "listings_unique_hash_key".to_string(),
            });
        }

        let now = listing.scraped_at;
        let stored = Listing::from_new(Uuid::new_v4(), listing, now);
        state.listings.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn refresh_listing_deadline(
        &self,
        id: ListingId,
        deadline: Option<NaiveDate>,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let listing = state
            .listings
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "listing" })?;
        listing.deadline = deadline;
        listing.scraped_at = Some(scraped_at);
        listing.updated_at = scraped_at;
        Ok(())
    }

    async fn search_listings(
        &self,
        query: &ListingQuery,
        today: NaiveDate,
    ) -> StoreResult<ListingPage> {
        let state = self.state.lock().await;
        let mut hits: Vec<&Listing> = state
            .listings
            .values()
            .filter(|l| query.matches(l, today))
            .collect();
        hits.sort_by(|a, b| query.compare(a, b));

        let total = hits.len() as u64;
        let items = hits
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok(ListingPage::new(items, total, query.page, query.limit))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let mut state = self.state.lock().await;
        let email = user.email.trim().to_lowercase();
        if state.users.values().any(|u| u.email == email) {
            return Err(StoreError::UniqueViolation {
                constraint: "users_email_key".to_string(),
            });
        }
        let stored = User::from_new(Uuid::new_v4(), user, Utc::now());
        state.users.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let email = email.trim().to_lowercase();
        let state = self.state.lock().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn save_listing(
        &self,
        user_id: UserId,
        listing_id: ListingId,
        status: Option<SavedStatus>,
        now: DateTime<Utc>,
    ) -> StoreResult<SaveOutcome> {
        let mut state = self.state.lock().await;
        if !state.listings.contains_key(&listing_id) {
            return Err(StoreError::NotFound { entity: "listing" });
        }
        let user = user_mut(&mut state, user_id)?;
        let outcome = match user.saved.get_mut(&listing_id) {
            Some(entry) => match status {
                Some(status) if status != entry.status => {
                    entry.status = status;
                    SaveOutcome::StatusUpdated
                }
                _ => SaveOutcome::AlreadySaved,
            },
            None => {
                user.saved.insert(
                    listing_id,
                    SavedEntry {
                        listing_id,
                        status: status.unwrap_or(SavedStatus::Interested),
                        saved_at: now,
                        last_reminder_at: None,
                    },
                );
                SaveOutcome::Created
            }
        };
        if outcome != SaveOutcome::AlreadySaved {
            user.updated_at = now;
        }
        Ok(outcome)
    }

    async fn update_saved_status(
        &self,
        user_id: UserId,
        listing_id: ListingId,
        status: SavedStatus,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let user = user_mut(&mut state, user_id)?;
        match user.saved.get_mut(&listing_id) {
            Some(entry) => {
                entry.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_saved(&self, user_id: UserId, listing_id: ListingId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let user = user_mut(&mut state, user_id)?;
        Ok(user.saved.remove(&listing_id).is_some())
    }

    async fn update_preferences(
        &self,
        user_id: UserId,
        preferences: Preferences,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let user = user_mut(&mut state, user_id)?;
        user.preferences = preferences;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn reminder_candidates(
        &self,
        window: &ReminderWindow,
    ) -> StoreResult<Vec<ReminderBatch>> {
        let state = self.state.lock().await;
        let mut batches = Vec::new();
        for user in state.users.values() {
            if !user.preferences.email_reminders {
                continue;
            }
            let mut listings: Vec<Listing> = user
                .saved
                .values()
                .filter_map(|entry| {
                    state
                        .listings
                        .get(&entry.listing_id)
                        .filter(|listing| window.includes(entry, listing))
                        .cloned()
                })
                .collect();
            if listings.is_empty() {
                continue;
            }
            listings.sort_by_key(|l| l.deadline);
            batches.push(ReminderBatch {
                user_id: user.id,
                name: user.name.clone(),
                email: user.email.clone(),
                listings,
            });
        }
        Ok(batches)
    }

    async fn mark_reminded(
        &self,
        user_id: UserId,
        listing_ids: &[ListingId],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let user = user_mut(&mut state, user_id)?;
        for id in listing_ids {
            if let Some(entry) = user.saved.get_mut(id) {
                entry.last_reminder_at = Some(at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.leases.get(name) {
            if current.holder != holder && current.expires_at > now {
                return Ok(false);
            }
        }
        state
            .leases
            .insert(name.to_string(), LeaseRecord { holder, expires_at });
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.leases.get(name).is_some_and(|l| l.holder == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use itrack_core::{IdentityConfidence, ListingDraft, ListingIdentity};

    fn new_listing(url: Option<&str>, hash: &str) -> NewListing {
        let now = Utc::now();
        NewListing {
            draft: ListingDraft {
                title: "ML Intern".to_string(),
                company: "Acme".to_string(),
                source_url: url.map(str::to_string),
                ..ListingDraft::default()
            },
            identity: ListingIdentity {
                unique_hash: hash.to_string(),
                confidence: IdentityConfidence::SourceUrl,
            },
            posted_at: now,
            scraped_at: now,
        }
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: Some("Ada".to_string()),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            roles: vec!["student".to_string()],
            preferences: Preferences::default(),
        }
    }

    #[tokio::test]
    async fn inserts_enforce_source_url_and_hash_uniqueness() {
        let store = MemoryStore::new();
        store
            .insert_listing(new_listing(Some("https://a/1"), "h1"))
            .await
            .expect("first insert");

        let dup_url = store
            .insert_listing(new_listing(Some("https://a/1"), "h2"))
            .await;
        assert!(matches!(dup_url, Err(StoreError::UniqueViolation { .. })));

        let dup_hash = store.insert_listing(new_listing(None, "h1")).await;
        assert!(matches!(dup_hash, Err(StoreError::UniqueViolation { .. })));

        store
            .insert_listing(new_listing(None, "h3"))
            .await
            .expect("url-less listings do not collide on a missing url");
        store
            .insert_listing(new_listing(None, "h4"))
            .await
            .expect("second url-less listing");
        assert_eq!(store.listing_count().await, 3);
    }

    #[tokio::test]
    async fn emails_are_unique_case_insensitively() {
        let store = MemoryStore::new();
        store.create_user(new_user("Ada@Example.com")).await.expect("create");
        let dup = store.create_user(new_user("ada@example.COM")).await;
        assert!(matches!(dup, Err(StoreError::UniqueViolation { .. })));
        assert!(store
            .find_user_by_email("ADA@example.com")
            .await
            .expect("lookup")
            .is_some());
    }

    #[tokio::test]
    async fn saving_twice_updates_status_in_place() {
        let store = MemoryStore::new();
        let user = store.create_user(new_user("a@b.io")).await.expect("user");
        let listing = store
            .insert_listing(new_listing(Some("https://a/1"), "h1"))
            .await
            .expect("listing");
        let now = Utc::now();

        let first = store
            .save_listing(user.id, listing.id, None, now)
            .await
            .expect("save");
        let again = store
            .save_listing(user.id, listing.id, None, now)
            .await
            .expect("save again");
        let applied = store
            .save_listing(user.id, listing.id, Some(SavedStatus::Applied), now)
            .await
            .expect("save with status");

        assert_eq!(first, SaveOutcome::Created);
        assert_eq!(again, SaveOutcome::AlreadySaved);
        assert_eq!(applied, SaveOutcome::StatusUpdated);

        let user = store.find_user_by_id(user.id).await.expect("load").expect("exists");
        assert_eq!(user.saved.len(), 1);
        assert_eq!(user.saved[&listing.id].status, SavedStatus::Applied);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(store
            .try_acquire_lease("ingestion", first, now + Duration::minutes(5), now)
            .await
            .expect("acquire"));
        assert!(!store
            .try_acquire_lease("ingestion", second, now + Duration::minutes(5), now)
            .await
            .expect("contended"));

        let later = now + Duration::minutes(6);
        assert!(store
            .try_acquire_lease("ingestion", second, later + Duration::minutes(5), later)
            .await
            .expect("expired lease is taken over"));

        store.release_lease("ingestion", first).await.expect("stale release");
        assert!(!store
            .try_acquire_lease("ingestion", first, later + Duration::minutes(5), later)
            .await
            .expect("stale holder cannot release someone else's lease"));
    }
}
