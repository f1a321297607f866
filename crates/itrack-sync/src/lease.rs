use chrono::{DateTime, Duration, Utc};
use itrack_storage::{LeaseStore, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

pub const INGESTION_LEASE: &str = "ingestion";

/// A held overlap guard for one ingestion run. The run id is the lease holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    name: String,
    run_id: Uuid,
    expires_at: DateTime<Utc>,
}

impl RunLease {
    /// Returns `None` when another live run holds the lease.
    pub async fn acquire<S: LeaseStore + ?Sized>(
        store: &S,
        name: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, StoreError> {
        let run_id = Uuid::new_v4();
        let expires_at = now + ttl;
        if !store.try_acquire_lease(name, run_id, expires_at, now).await? {
            debug!(lease = name, "lease held by another run");
            return Ok(None);
        }
        Ok(Some(Self {
            name: name.to_string(),
            run_id,
            expires_at,
        }))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Release failures are logged; the lease then lapses at `expires_at`.
    pub async fn release<S: LeaseStore + ?Sized>(self, store: &S) {
        if let Err(err) = store.release_lease(&self.name, self.run_id).await {
            warn!(lease = %self.name, run_id = %self.run_id, error = %err, "failed to release run lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itrack_storage::MemoryStore;

    #[tokio::test]
    async fn second_acquire_waits_for_release_or_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ttl = Duration::minutes(10);

        let first = RunLease::acquire(&store, INGESTION_LEASE, ttl, now)
            .await
            .expect("acquire")
            .expect("free lease");
        assert!(RunLease::acquire(&store, INGESTION_LEASE, ttl, now)
            .await
            .expect("acquire")
            .is_none());

        let after_expiry = first.expires_at() + Duration::seconds(1);
        let takeover = RunLease::acquire(&store, INGESTION_LEASE, ttl, after_expiry)
            .await
            .expect("acquire")
            .expect("expired lease is taken over");
        assert_ne!(takeover.run_id(), first.run_id());

        // The stale holder cannot release the new holder's lease.
        first.release(&store).await;
        assert!(RunLease::acquire(&store, INGESTION_LEASE, ttl, after_expiry)
            .await
            .expect("acquire")
            .is_none());

        takeover.release(&store).await;
        assert!(RunLease::acquire(&store, INGESTION_LEASE, ttl, after_expiry)
            .await
            .expect("acquire")
            .is_some());
    }
}
