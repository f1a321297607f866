use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use itrack_core::{
    IdentityConfidence, Listing, ListingId, ListingPage, ListingQuery, NewListing, NewUser,
    Preferences, ReminderBatch, ReminderWindow, SaveOutcome, SavedEntry, SavedStatus, SortField,
    SortOrder, User, UserId,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::{LeaseStore, ListingStore, StoreError, StoreResult, UserStore};

const LISTING_COLUMNS: &str = r#"
    id, title, company, location, remote, stipend_min, stipend_max, duration_weeks,
    skills, tags, description, source, source_url, external_id, deadline, posted_at,
    scraped_at, unique_hash, identity_confidence, raw_meta, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_saved(&self, user_id: UserId) -> StoreResult<BTreeMap<ListingId, SavedEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT listing_id, status, saved_at, last_reminder_at
              FROM saved_listings
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut saved = BTreeMap::new();
        for row in rows {
            let entry = saved_from_row(&row)?;
            saved.insert(entry.listing_id, entry);
        }
        Ok(saved)
    }

    async fn load_user(&self, row: Option<PgRow>) -> StoreResult<Option<User>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut user = user_from_row(&row)?;
        user.saved = self.load_saved(user.id).await?;
        Ok(Some(user))
    }

    async fn find_listing_where(
        &self,
        column: &str,
        value: &str,
    ) -> StoreResult<Option<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE {column} = $1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn listing_from_row(row: &PgRow) -> StoreResult<Listing> {
    let confidence: String = row.try_get("identity_confidence")?;
    let duration_weeks: Option<i32> = row.try_get("duration_weeks")?;
    Ok(Listing {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        remote: row.try_get("remote")?,
        stipend_min: row.try_get("stipend_min")?,
        stipend_max: row.try_get("stipend_max")?,
        duration_weeks: duration_weeks.and_then(|w| u32::try_from(w).ok()),
        skills: row.try_get("skills")?,
        tags: row.try_get("tags")?,
        description: row.try_get("description")?,
        source: row.try_get("source")?,
        source_url: row.try_get("source_url")?,
        external_id: row.try_get("external_id")?,
        deadline: row.try_get("deadline")?,
        posted_at: row.try_get("posted_at")?,
        scraped_at: row.try_get("scraped_at")?,
        unique_hash: row.try_get("unique_hash")?,
        identity_confidence: IdentityConfidence::parse(&confidence)
            .ok_or_else(|| backend(format!("unknown identity confidence {confidence}")))?,
        raw_meta: row.try_get("raw_meta")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn saved_from_row(row: &PgRow) -> StoreResult<SavedEntry> {
    let status: String = row.try_get("status")?;
    Ok(SavedEntry {
        listing_id: row.try_get("listing_id")?,
        status: SavedStatus::parse(&status)
            .ok_or_else(|| backend(format!("unknown saved status {status}")))?,
        saved_at: row.try_get("saved_at")?,
        last_reminder_at: row.try_get("last_reminder_at")?,
    })
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    let domains: Vec<String> = row.try_get("domains")?;
    let locations: Vec<String> = row.try_get("locations")?;
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        roles: row.try_get("roles")?,
        saved: BTreeMap::new(),
        preferences: Preferences {
            domains: domains.into_iter().collect(),
            locations: locations.into_iter().collect(),
            email_reminders: row.try_get("email_reminders")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// `%term%` with LIKE wildcards in the user's input escaped.
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &ListingQuery, today: NaiveDate) {
    qb.push(" WHERE TRUE");
    if !query.include_expired {
        qb.push(" AND (deadline IS NULL OR deadline >= ")
            .push_bind(today)
            .push(")");
    }
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = like_pattern(search);
        qb.push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR company ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR EXISTS (SELECT 1 FROM unnest(skills) AS s(skill) WHERE s.skill ILIKE ")
            .push_bind(pattern)
            .push("))");
    }
    if !query.skills.is_empty() {
        let patterns: Vec<String> = query.skills.iter().map(|s| like_pattern(s)).collect();
        qb.push(" AND EXISTS (SELECT 1 FROM unnest(skills) AS s(skill) WHERE s.skill ILIKE ANY(")
            .push_bind(patterns)
            .push("))");
    }
    if let Some(location) = query.location.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND location ILIKE ")
            .push_bind(like_pattern(location));
    }
    if let Some(remote) = query.remote {
        qb.push(" AND remote = ").push_bind(remote);
    }
    if let Some(min) = query.min_stipend {
        qb.push(" AND stipend_min >= ").push_bind(min);
    }
}

fn order_clause(query: &ListingQuery) -> String {
    let column = match query.sort_by {
        SortField::PostedAt => "posted_at",
        SortField::Deadline => "deadline",
        SortField::StipendMin => "stipend_min",
    };
    let direction = match query.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    format!(" ORDER BY {column} {direction} NULLS LAST, id ASC")
}

#[async_trait]
impl ListingStore for PgStore {
    async fn find_listing_by_id(&self, id: ListingId) -> StoreResult<Option<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn find_listing_by_source_url(
        &self,
        source_url: &str,
    ) -> StoreResult<Option<Listing>> {
        self.find_listing_where("source_url", source_url).await
    }

    async fn find_listing_by_hash(&self, unique_hash: &str) -> StoreResult<Option<Listing>> {
        self.find_listing_where("unique_hash", unique_hash).await
    }

    async fn listings_by_ids(&self, ids: &[ListingId]) -> StoreResult<Vec<Listing>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn insert_listing(&self, listing: NewListing) -> StoreResult<Listing> {
        let NewListing {
            draft,
            identity,
            posted_at,
            scraped_at,
        } = listing;
        let sql = format!(
            r#"
            INSERT INTO listings (
                id, title, company, location, remote, stipend_min, stipend_max, duration_weeks,
                skills, tags, description, source, source_url, external_id, deadline, posted_at,
                scraped_at, unique_hash, identity_confidence, raw_meta, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $17, $17)
            RETURNING {LISTING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(draft.title)
            .bind(draft.company)
            .bind(draft.location)
            .bind(draft.remote)
            .bind(draft.stipend_min)
            .bind(draft.stipend_max)
            .bind(draft.duration_weeks.and_then(|w| i32::try_from(w).ok()))
            .bind(draft.skills)
            .bind(draft.tags)
            .bind(draft.description)
            .bind(draft.source)
            .bind(draft.source_url)
            .bind(draft.external_id)
            .bind(draft.deadline)
            .bind(posted_at)
            .bind(scraped_at)
            .bind(identity.unique_hash)
            .bind(identity.confidence.as_str())
            .bind(draft.raw_meta)
            .fetch_one(&self.pool)
            .await?;
        listing_from_row(&row)
    }

    async fn refresh_listing_deadline(
        &self,
        id: ListingId,
        deadline: Option<NaiveDate>,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET deadline = $2, scraped_at = $3, updated_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(deadline)
        .bind(scraped_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "listing" });
        }
        Ok(())
    }

    async fn search_listings(
        &self,
        query: &ListingQuery,
        today: NaiveDate,
    ) -> StoreResult<ListingPage> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM listings");
        push_filters(&mut count_qb, query, today);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {LISTING_COLUMNS} FROM listings"));
        push_filters(&mut qb, query, today);
        qb.push(order_clause(query));
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));
        let rows = qb.build().fetch_all(&self.pool).await?;
        let items = rows.iter().map(listing_from_row).collect::<StoreResult<Vec<_>>>()?;

        Ok(ListingPage::new(
            items,
            u64::try_from(total).unwrap_or_default(),
            query.page,
            query.limit,
        ))
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let domains: Vec<String> = user.preferences.domains.iter().cloned().collect();
        let locations: Vec<String> = user.preferences.locations.iter().cloned().collect();
        let row = sqlx::query(
            r#"
            INSERT INTO users (
                id, name, email, password_hash, roles, domains, locations, email_reminders
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, name, email, password_hash, roles, domains, locations, email_reminders,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user.name)
        .bind(user.email.trim().to_lowercase())
        .bind(user.password_hash)
        .bind(user.roles)
        .bind(domains)
        .bind(locations)
        .bind(user.preferences.email_reminders)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, password_hash, roles, domains, locations, email_reminders,
                   created_at, updated_at
              FROM users
             WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        self.load_user(row).await
    }

    async fn find_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, password_hash, roles, domains, locations, email_reminders,
                   created_at, updated_at
              FROM users
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        self.load_user(row).await
    }

    async fn save_listing(
        &self,
        user_id: UserId,
        listing_id: ListingId,
        status: Option<SavedStatus>,
        now: DateTime<Utc>,
    ) -> StoreResult<SaveOutcome> {
        let mut tx = self.pool.begin().await?;

        let user_exists = sqlx::query("SELECT 1 FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !user_exists {
            return Err(StoreError::NotFound { entity: "user" });
        }

        let existing = sqlx::query(
            r#"
            SELECT status
              FROM saved_listings
             WHERE user_id = $1 AND listing_id = $2
               FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(listing_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(row) => {
                let current: String = row.try_get("status")?;
                match status {
                    Some(status) if status.as_str() != current => {
                        sqlx::query(
                            r#"
                            UPDATE saved_listings
                               SET status = $3
                             WHERE user_id = $1 AND listing_id = $2
                            "#,
                        )
                        .bind(user_id)
                        .bind(listing_id)
                        .bind(status.as_str())
                        .execute(&mut *tx)
                        .await?;
                        SaveOutcome::StatusUpdated
                    }
                    _ => SaveOutcome::AlreadySaved,
                }
            }
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO saved_listings (user_id, listing_id, status, saved_at)
                    SELECT $1, id, $3, $4 FROM listings WHERE id = $2
                    ON CONFLICT (user_id, listing_id) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(listing_id)
                .bind(status.unwrap_or(SavedStatus::Interested).as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                if inserted.rows_affected() == 1 {
                    SaveOutcome::Created
                } else if self.find_listing_by_id(listing_id).await?.is_none() {
                    return Err(StoreError::NotFound { entity: "listing" });
                } else {
                    SaveOutcome::AlreadySaved
                }
            }
        };

        if outcome != SaveOutcome::AlreadySaved {
            sqlx::query("UPDATE users SET updated_at = $2 WHERE id = $1")
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn update_saved_status(
        &self,
        user_id: UserId,
        listing_id: ListingId,
        status: SavedStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE saved_listings
               SET status = $3
             WHERE user_id = $1 AND listing_id = $2
            "#,
        )
        .bind(user_id)
        .bind(listing_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_saved(&self, user_id: UserId, listing_id: ListingId) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM saved_listings WHERE user_id = $1 AND listing_id = $2")
                .bind(user_id)
                .bind(listing_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_preferences(
        &self,
        user_id: UserId,
        preferences: Preferences,
    ) -> StoreResult<()> {
        let domains: Vec<String> = preferences.domains.into_iter().collect();
        let locations: Vec<String> = preferences.locations.into_iter().collect();
        let result = sqlx::query(
            r#"
            UPDATE users
               SET domains = $2, locations = $3, email_reminders = $4, updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(domains)
        .bind(locations)
        .bind(preferences.email_reminders)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "user" });
        }
        Ok(())
    }

    async fn reminder_candidates(
        &self,
        window: &ReminderWindow,
    ) -> StoreResult<Vec<ReminderBatch>> {
        let sql = format!(
            r#"
            SELECT u.id AS reminder_user_id, u.name AS reminder_user_name,
                   u.email AS reminder_user_email, {}
              FROM saved_listings s
              JOIN users u ON u.id = s.user_id
              JOIN listings l ON l.id = s.listing_id
             WHERE u.email_reminders
               AND s.status = 'interested'
               AND l.deadline BETWEEN $1 AND $2
               AND (s.last_reminder_at IS NULL OR s.last_reminder_at < $3)
             ORDER BY u.id, l.deadline
            "#,
            prefixed_listing_columns("l")
        );
        let rows = sqlx::query(&sql)
            .bind(window.today)
            .bind(window.until)
            .bind(window.not_reminded_since)
            .fetch_all(&self.pool)
            .await?;

        let mut batches: Vec<ReminderBatch> = Vec::new();
        for row in rows {
            let user_id: Uuid = row.try_get("reminder_user_id")?;
            let listing = listing_from_row(&row)?;
            match batches.last_mut() {
                Some(batch) if batch.user_id == user_id => batch.listings.push(listing),
                _ => batches.push(ReminderBatch {
                    user_id,
                    name: row.try_get("reminder_user_name")?,
                    email: row.try_get("reminder_user_email")?,
                    listings: vec![listing],
                }),
            }
        }
        Ok(batches)
    }

    async fn mark_reminded(
        &self,
        user_id: UserId,
        listing_ids: &[ListingId],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE saved_listings
               SET last_reminder_at = $3
             WHERE user_id = $1 AND listing_id = ANY($2)
            "#,
        )
        .bind(user_id)
        .bind(listing_ids.to_vec())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn prefixed_listing_columns(alias: &str) -> String {
    LISTING_COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl LeaseStore for PgStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO run_leases (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, $4, $3)
            ON CONFLICT (name) DO UPDATE
               SET holder = EXCLUDED.holder,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE run_leases.expires_at <= $4 OR run_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM run_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(like_pattern("ml"), "%ml%");
        assert_eq!(like_pattern("100%_remote"), "%100\\%\\_remote%");
    }

    #[test]
    fn listing_columns_can_be_prefixed() {
        let cols = prefixed_listing_columns("l");
        assert!(cols.starts_with("l.id, l.title"));
        assert!(cols.ends_with("l.updated_at"));
    }

    #[test]
    fn order_clause_puts_nulls_last() {
        let query = ListingQuery {
            sort_by: SortField::Deadline,
            order: SortOrder::Asc,
            ..ListingQuery::default()
        };
        assert_eq!(
            order_clause(&query),
            " ORDER BY deadline ASC NULLS LAST, id ASC"
        );
    }
}
