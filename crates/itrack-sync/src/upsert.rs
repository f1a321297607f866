use std::sync::Arc;

use chrono::{DateTime, Utc};
use itrack_core::{IdentifiedListing, NewListing, SkipReason, UpsertOutcome};
use itrack_storage::{ListingStore, StoreError};
use tracing::debug;

/// Insert-or-refresh keyed on source URL (when present) or identity hash.
///
/// Only the deadline is refreshed on re-ingestion. An incoming listing without a
/// deadline never clears a stored one.
pub struct Upserter<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for Upserter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> Upserter<S>
where
    S: ListingStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn upsert(
        &self,
        listing: &IdentifiedListing,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let existing = match listing.draft.source_url.as_deref() {
            Some(url) => self.store.find_listing_by_source_url(url).await?,
            None => {
                self.store
                    .find_listing_by_hash(&listing.identity.unique_hash)
                    .await?
            }
        };

        let Some(stored) = existing else {
            return match self
                .store
                .insert_listing(NewListing::from_identified(listing, now))
                .await
            {
                Ok(created) => Ok(UpsertOutcome::Created { id: created.id }),
                Err(StoreError::UniqueViolation { constraint }) => {
                    debug!(%constraint, title = %listing.draft.title, "insert lost to an existing identity");
                    Ok(UpsertOutcome::Skipped {
                        id: None,
                        reason: SkipReason::Conflict,
                    })
                }
                Err(err) => Err(err),
            };
        };

        match listing.draft.deadline {
            Some(deadline) if stored.deadline != Some(deadline) => {
                self.store
                    .refresh_listing_deadline(stored.id, Some(deadline), now)
                    .await?;
                Ok(UpsertOutcome::Updated { id: stored.id })
            }
            _ => Ok(UpsertOutcome::Skipped {
                id: Some(stored.id),
                reason: SkipReason::Unchanged,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityPolicy;
    use chrono::NaiveDate;
    use itrack_core::ListingDraft;
    use itrack_storage::MemoryStore;

    fn identified(url: Option<&str>, deadline: Option<NaiveDate>) -> IdentifiedListing {
        IdentityPolicy::default()
            .identify(ListingDraft {
                title: "Machine Learning Intern".to_string(),
                company: "Acme".to_string(),
                location: "Remote".to_string(),
                source: "Greenhouse".to_string(),
                source_url: url.map(str::to_string),
                deadline,
                ..ListingDraft::default()
            })
            .expect("identity")
    }

    #[tokio::test]
    async fn second_ingest_is_skipped_not_created() {
        let store = Arc::new(MemoryStore::new());
        let upserter = Upserter::new(store.clone());
        let listing = identified(Some("https://acme.test/1"), None);

        let first = upserter.upsert(&listing, Utc::now()).await.expect("first");
        let second = upserter.upsert(&listing, Utc::now()).await.expect("second");

        assert!(first.is_created());
        assert_eq!(
            second,
            UpsertOutcome::Skipped {
                id: first.listing_id(),
                reason: SkipReason::Unchanged
            }
        );
        assert_eq!(store.listing_count().await, 1);
    }

    #[tokio::test]
    async fn changed_deadline_refreshes_in_place() {
        let store = Arc::new(MemoryStore::new());
        let upserter = Upserter::new(store.clone());
        let june = NaiveDate::from_ymd_opt(2026, 6, 1);
        let july = NaiveDate::from_ymd_opt(2026, 7, 1);

        let created = upserter
            .upsert(&identified(None, june), Utc::now())
            .await
            .expect("create");
        let updated = upserter
            .upsert(&identified(None, july), Utc::now())
            .await
            .expect("update");
        let cleared = upserter
            .upsert(&identified(None, None), Utc::now())
            .await
            .expect("absent deadline");

        assert_eq!(updated, UpsertOutcome::Updated { id: created.listing_id().expect("id") });
        assert!(matches!(cleared, UpsertOutcome::Skipped { reason: SkipReason::Unchanged, .. }));

        let stored = store
            .find_listing_by_id(created.listing_id().expect("id"))
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.deadline, july);
        assert_eq!(store.listing_count().await, 1);
    }

    #[tokio::test]
    async fn hash_collision_under_a_different_url_is_a_benign_skip() {
        let store = Arc::new(MemoryStore::new());
        let upserter = Upserter::new(store.clone());

        upserter
            .upsert(&identified(Some("https://acme.test/Job"), None), Utc::now())
            .await
            .expect("create");
        // Same hash (locator is case-folded) but the exact-URL lookup misses.
        let outcome = upserter
            .upsert(&identified(Some("https://ACME.test/job"), None), Utc::now())
            .await
            .expect("conflict is not an error");

        assert_eq!(
            outcome,
            UpsertOutcome::Skipped {
                id: None,
                reason: SkipReason::Conflict
            }
        );
        assert_eq!(store.listing_count().await, 1);
    }
}
