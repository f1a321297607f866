//! Deadline reminder digests for saved listings.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use itrack_core::{ListingId, ReminderBatch, ReminderWindow};
use itrack_storage::{StoreError, UserStore};
use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_REMINDER_DAYS_BEFORE: i64 = 3;

/// One user's digest of upcoming deadlines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReminderDigest {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub listing_ids: Vec<ListingId>,
}

impl ReminderDigest {
    pub fn from_batch(batch: &ReminderBatch) -> Self {
        let greeting = match batch.name.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(name) => format!("Hi {name},"),
            None => "Hi,".to_string(),
        };
        let mut lines = vec![
            greeting,
            String::new(),
            "These saved internships close soon:".to_string(),
        ];
        for listing in &batch.listings {
            let deadline = listing
                .deadline
                .map(|d| d.to_string())
                .unwrap_or_default();
            let link = listing.source_url.as_deref().unwrap_or("");
            lines.push(format!(
                "- {} at {} (deadline {deadline}) {link}",
                listing.title, listing.company
            ));
        }
        Self {
            to: batch.email.clone(),
            subject: format!("{} internship deadline(s) coming up", batch.listings.len()),
            body: lines.join("\n").trim_end().to_string(),
            listing_ids: batch.listings.iter().map(|l| l.id).collect(),
        }
    }
}

#[async_trait]
pub trait ReminderSender: Send + Sync {
    async fn send(&self, digest: &ReminderDigest) -> Result<()>;
}

/// Writes digests to the log instead of delivering mail.
#[derive(Debug, Default)]
pub struct LogReminderSender;

#[async_trait]
impl ReminderSender for LogReminderSender {
    async fn send(&self, digest: &ReminderDigest) -> Result<()> {
        info!(
            to = %digest.to,
            subject = %digest.subject,
            listings = digest.listing_ids.len(),
            body = %digest.body,
            "deadline reminder"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderSummary {
    pub users_notified: usize,
    pub entries_reminded: usize,
    pub failures: usize,
}

/// Sends one digest per eligible user. A failed send or stamp is counted and skipped.
pub async fn send_deadline_reminders<S>(
    store: &S,
    sender: &dyn ReminderSender,
    days_before: i64,
    now: DateTime<Utc>,
) -> Result<ReminderSummary, StoreError>
where
    S: UserStore + ?Sized,
{
    let today = now.date_naive();
    let window = ReminderWindow {
        today,
        until: today + Duration::days(days_before.max(0)),
        not_reminded_since: now - Duration::hours(24),
    };
    let batches = store.reminder_candidates(&window).await?;

    let mut summary = ReminderSummary::default();
    for batch in &batches {
        let digest = ReminderDigest::from_batch(batch);
        if let Err(err) = sender.send(&digest).await {
            warn!(user_id = %batch.user_id, error = %err, "reminder delivery failed");
            summary.failures += 1;
            continue;
        }
        if let Err(err) = store
            .mark_reminded(batch.user_id, &digest.listing_ids, now)
            .await
        {
            warn!(user_id = %batch.user_id, error = %err, "failed to stamp reminded entries");
            summary.failures += 1;
            continue;
        }
        summary.users_notified += 1;
        summary.entries_reminded += digest.listing_ids.len();
    }
    info!(
        users = summary.users_notified,
        entries = summary.entries_reminded,
        failures = summary.failures,
        "deadline reminders finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityPolicy;
    use chrono::NaiveDate;
    use itrack_core::{ListingDraft, NewListing, NewUser, Preferences, SavedStatus, UserId};
    use itrack_storage::{ListingStore, MemoryStore};
    use std::sync::Mutex;

    struct FailingSender;

    #[async_trait]
    impl ReminderSender for FailingSender {
        async fn send(&self, _digest: &ReminderDigest) -> Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<ReminderDigest>>,
    }

    #[async_trait]
    impl ReminderSender for RecordingSender {
        async fn send(&self, digest: &ReminderDigest) -> Result<()> {
            self.sent.lock().expect("lock").push(digest.clone());
            Ok(())
        }
    }

    async fn listing(store: &MemoryStore, title: &str, deadline: Option<NaiveDate>) -> ListingId {
        let identified = IdentityPolicy::default()
            .identify(ListingDraft {
                title: title.to_string(),
                company: "Acme".to_string(),
                source: "CSV".to_string(),
                source_url: Some(format!("https://acme.test/{title}")),
                deadline,
                ..ListingDraft::default()
            })
            .expect("identity");
        store
            .insert_listing(NewListing::from_identified(&identified, Utc::now()))
            .await
            .expect("insert")
            .id
    }

    async fn user(store: &MemoryStore, email: &str, reminders: bool) -> UserId {
        store
            .create_user(NewUser {
                name: Some("Asha".to_string()),
                email: email.to_string(),
                password_hash: "x".to_string(),
                roles: vec!["student".to_string()],
                preferences: Preferences {
                    email_reminders: reminders,
                    ..Preferences::default()
                },
            })
            .await
            .expect("user")
            .id
    }

    #[tokio::test]
    async fn reminds_interested_entries_inside_the_window_once_per_day() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let today = now.date_naive();

        let soon = listing(&store, "ML Intern", Some(today + Duration::days(2))).await;
        let later = listing(&store, "AI Intern", Some(today + Duration::days(10))).await;
        let applied = listing(&store, "NLP Intern", Some(today + Duration::days(1))).await;

        let student = user(&store, "asha@example.test", true).await;
        let muted = user(&store, "muted@example.test", false).await;
        for id in [soon, later] {
            store.save_listing(student, id, None, now).await.expect("save");
        }
        store
            .save_listing(student, applied, Some(SavedStatus::Applied), now)
            .await
            .expect("save");
        store.save_listing(muted, soon, None, now).await.expect("save");

        let sender = RecordingSender::default();
        let summary = send_deadline_reminders(&store, &sender, 3, now)
            .await
            .expect("reminders");
        assert_eq!(
            summary,
            ReminderSummary {
                users_notified: 1,
                entries_reminded: 1,
                failures: 0
            }
        );
        let sent = sender.sent.lock().expect("lock").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "asha@example.test");
        assert_eq!(sent[0].listing_ids, vec![soon]);
        assert!(sent[0].body.contains("ML Intern at Acme"));

        let again = send_deadline_reminders(&store, &sender, 3, now + Duration::hours(1))
            .await
            .expect("reminders");
        assert_eq!(again.users_notified, 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_counted_and_not_stamped() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = listing(&store, "CV Intern", Some(now.date_naive())).await;
        let student = user(&store, "cv@example.test", true).await;
        store.save_listing(student, id, None, now).await.expect("save");

        let summary = send_deadline_reminders(&store, &FailingSender, 3, now)
            .await
            .expect("reminders");
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.users_notified, 0);

        let saved = store
            .find_user_by_id(student)
            .await
            .expect("lookup")
            .expect("user");
        assert_eq!(saved.saved[&id].last_reminder_at, None);
    }
}
