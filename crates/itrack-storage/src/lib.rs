//! Persistence traits, the in-memory and Postgres stores, and HTTP fetch utilities.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use itrack_core::{
    Listing, ListingId, ListingPage, ListingQuery, NewListing, NewUser, Preferences,
    ReminderBatch, ReminderWindow, SaveOutcome, SavedStatus, User, UserId,
};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "itrack-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        Self::Backend(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_listing_by_id(&self, id: ListingId) -> StoreResult<Option<Listing>>;
    async fn find_listing_by_source_url(&self, source_url: &str)
        -> StoreResult<Option<Listing>>;
    async fn find_listing_by_hash(&self, unique_hash: &str) -> StoreResult<Option<Listing>>;
    async fn listings_by_ids(&self, ids: &[ListingId]) -> StoreResult<Vec<Listing>>;

    /// Fails with [`StoreError::UniqueViolation`] when the source URL or hash is taken.
    async fn insert_listing(&self, listing: NewListing) -> StoreResult<Listing>;

    /// Replaces the deadline and stamps `scraped_at`; leaves every other field alone.
    async fn refresh_listing_deadline(
        &self,
        id: ListingId,
        deadline: Option<NaiveDate>,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn search_listings(
        &self,
        query: &ListingQuery,
        today: NaiveDate,
    ) -> StoreResult<ListingPage>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with [`StoreError::UniqueViolation`] when the lowercased email exists.
    async fn create_user(&self, user: NewUser) -> StoreResult<User>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Lookup-then-upsert keyed on (user, listing). A repeated save never duplicates.
    async fn save_listing(
        &self,
        user_id: UserId,
        listing_id: ListingId,
        status: Option<SavedStatus>,
        now: DateTime<Utc>,
    ) -> StoreResult<SaveOutcome>;

    /// Returns `false` when the listing is not saved by the user.
    async fn update_saved_status(
        &self,
        user_id: UserId,
        listing_id: ListingId,
        status: SavedStatus,
    ) -> StoreResult<bool>;

    async fn remove_saved(&self, user_id: UserId, listing_id: ListingId) -> StoreResult<bool>;

    async fn update_preferences(
        &self,
        user_id: UserId,
        preferences: Preferences,
    ) -> StoreResult<()>;

    /// Users with reminders enabled and at least one saved listing inside the window.
    async fn reminder_candidates(&self, window: &ReminderWindow)
        -> StoreResult<Vec<ReminderBatch>>;

    async fn mark_reminded(
        &self,
        user_id: UserId,
        listing_ids: &[ListingId],
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Named mutual-exclusion lease with expiry, shared across processes when backed by Postgres.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grants the lease when it is free, expired, or already held by `holder`.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()>;
}

pub trait Store: ListingStore + UserStore + LeaseStore {}

impl<T> Store for T where T: ListingStore + UserStore + LeaseStore {}

/// Connects to Postgres when `DATABASE_URL` is set, otherwise falls back to an in-memory store.
pub async fn open_store_from_env() -> anyhow::Result<Arc<dyn Store>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let store = PgStore::connect(&url).await?;
            Ok(Arc::new(store))
        }
        _ => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
