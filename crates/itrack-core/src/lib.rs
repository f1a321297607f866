//! Core domain model for the internship tracker.

use std::collections::{BTreeMap, BTreeSet};
use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const CRATE_NAME: &str = "itrack-core";

pub type ListingId = Uuid;
pub type UserId = Uuid;

/// Source-neutral record handed from an adapter to the normalizer.
///
/// `description` may still carry markup; stipend and remote fields are only
/// set when the source states them explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub external_id: Option<String>,
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote: Option<bool>,
    pub description: String,
    pub source_url: Option<String>,
    pub stipend_min: Option<f64>,
    pub stipend_max: Option<f64>,
    pub duration_weeks: Option<u32>,
    pub skills: Vec<String>,
    pub tags: Vec<String>,
    pub deadline: Option<NaiveDate>,
    pub posted_at: Option<DateTime<Utc>>,
    pub raw_meta: Option<Value>,
    /// Overrides the adapter's source name when set.
    pub source: Option<String>,
    /// Manually curated input skips the internship/relevance filters.
    pub curated: bool,
}

/// Normalized listing that passed the relevance filters but has no identity yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingDraft {
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote: bool,
    pub stipend_min: Option<f64>,
    pub stipend_max: Option<f64>,
    pub duration_weeks: Option<u32>,
    pub skills: Vec<String>,
    pub tags: Vec<String>,
    pub description: String,
    pub source: String,
    pub source_url: Option<String>,
    pub external_id: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub posted_at: Option<DateTime<Utc>>,
    pub raw_meta: Option<Value>,
}

/// How strongly a stored listing's identity is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityConfidence {
    SourceUrl,
    ExternalId,
    ContentOnly,
}

impl IdentityConfidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceUrl => "source_url",
            Self::ExternalId => "external_id",
            Self::ContentOnly => "content_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "source_url" => Some(Self::SourceUrl),
            "external_id" => Some(Self::ExternalId),
            "content_only" => Some(Self::ContentOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingIdentity {
    pub unique_hash: String,
    pub confidence: IdentityConfidence,
}

/// A draft paired with the identity it will be deduplicated under.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedListing {
    pub draft: ListingDraft,
    pub identity: ListingIdentity,
}

/// Insert payload for the listing store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    pub draft: ListingDraft,
    pub identity: ListingIdentity,
    pub posted_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl NewListing {
    /// `posted_at` falls back to `now` when the source did not state one.
    pub fn from_identified(listing: &IdentifiedListing, now: DateTime<Utc>) -> Self {
        Self {
            draft: listing.draft.clone(),
            identity: listing.identity.clone(),
            posted_at: listing.draft.posted_at.unwrap_or(now),
            scraped_at: now,
        }
    }
}

/// Persisted internship listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote: bool,
    pub stipend_min: Option<f64>,
    pub stipend_max: Option<f64>,
    pub duration_weeks: Option<u32>,
    pub skills: Vec<String>,
    pub tags: Vec<String>,
    pub description: String,
    pub source: String,
    pub source_url: Option<String>,
    pub external_id: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub posted_at: DateTime<Utc>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub unique_hash: String,
    pub identity_confidence: IdentityConfidence,
    pub raw_meta: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn from_new(id: ListingId, new: NewListing, now: DateTime<Utc>) -> Self {
        let NewListing {
            draft,
            identity,
            posted_at,
            scraped_at,
        } = new;
        Self {
            id,
            title: draft.title,
            company: draft.company,
            location: draft.location,
            remote: draft.remote,
            stipend_min: draft.stipend_min,
            stipend_max: draft.stipend_max,
            duration_weeks: draft.duration_weeks,
            skills: draft.skills,
            tags: draft.tags,
            description: draft.description,
            source: draft.source,
            source_url: draft.source_url,
            external_id: draft.external_id,
            deadline: draft.deadline,
            posted_at,
            scraped_at: Some(scraped_at),
            unique_hash: identity.unique_hash,
            identity_confidence: identity.confidence,
            raw_meta: draft.raw_meta,
            created_at: now,
            updated_at: now,
        }
    }

    /// Listings without a deadline never expire.
    pub fn is_active_on(&self, today: NaiveDate) -> bool {
        self.deadline.is_none_or(|deadline| deadline >= today)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Stored record already reflects the incoming data.
    Unchanged,
    /// The insert lost against a uniqueness constraint.
    Conflict,
}

/// Result of routing one identified listing through the upserter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created {
        id: ListingId,
    },
    Updated {
        id: ListingId,
    },
    Skipped {
        id: Option<ListingId>,
        reason: SkipReason,
    },
}

impl UpsertOutcome {
    pub fn listing_id(&self) -> Option<ListingId> {
        match self {
            Self::Created { id } | Self::Updated { id } => Some(*id),
            Self::Skipped { id, .. } => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavedStatus {
    Interested,
    Applied,
    Selected,
}

impl SavedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interested => "interested",
            Self::Applied => "applied",
            Self::Selected => "selected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interested" => Some(Self::Interested),
            "applied" => Some(Self::Applied),
            "selected" => Some(Self::Selected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedEntry {
    pub listing_id: ListingId,
    pub status: SavedStatus,
    pub saved_at: DateTime<Utc>,
    pub last_reminder_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    Created,
    AlreadySaved,
    StatusUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub domains: BTreeSet<String>,
    pub locations: BTreeSet<String>,
    pub email_reminders: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            domains: ["AI", "ML", "Data Science"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            locations: BTreeSet::new(),
            email_reminders: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: Option<String>,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub roles: Vec<String>,
    /// At most one entry per listing.
    pub saved: BTreeMap<ListingId, SavedEntry>,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub name: Option<String>,
    /// Stored lowercased.
    pub email: String,
    pub password_hash: String,
    pub roles: Vec<String>,
    pub preferences: Preferences,
}

impl User {
    pub fn from_new(id: UserId, new: NewUser, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: new.name,
            email: new.email.trim().to_lowercase(),
            password_hash: new.password_hash,
            roles: new.roles,
            saved: BTreeMap::new(),
            preferences: new.preferences,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    PostedAt,
    Deadline,
    StipendMin,
}

impl SortField {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "postedAt" => Some(Self::PostedAt),
            "deadline" => Some(Self::Deadline),
            "stipendMin" => Some(Self::StipendMin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Filter, sort and pagination parameters for listing search.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingQuery {
    pub search: Option<String>,
    pub skills: Vec<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    pub min_stipend: Option<f64>,
    pub include_expired: bool,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub page: u32,
    pub limit: u32,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self {
            search: None,
            skills: Vec::new(),
            location: None,
            remote: None,
            min_stipend: None,
            include_expired: false,
            sort_by: SortField::default(),
            order: SortOrder::default(),
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl ListingQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }

    /// In-process equivalent of the SQL filter used by the Postgres store.
    pub fn matches(&self, listing: &Listing, today: NaiveDate) -> bool {
        if !self.include_expired && !listing.is_active_on(today) {
            return false;
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let hit = contains_folded(&listing.title, search)
                || contains_folded(&listing.company, search)
                || contains_folded(&listing.description, search)
                || listing.skills.iter().any(|skill| contains_folded(skill, search));
            if !hit {
                return false;
            }
        }
        if !self.skills.is_empty()
            && !self.skills.iter().any(|wanted| {
                listing
                    .skills
                    .iter()
                    .any(|skill| contains_folded(skill, wanted))
            })
        {
            return false;
        }
        if let Some(location) = self.location.as_deref().filter(|s| !s.is_empty()) {
            if !contains_folded(&listing.location, location) {
                return false;
            }
        }
        if let Some(remote) = self.remote {
            if listing.remote != remote {
                return false;
            }
        }
        if let Some(min) = self.min_stipend {
            if listing.stipend_min.is_none_or(|value| value < min) {
                return false;
            }
        }
        true
    }

    /// Ordering for the selected sort field. Missing values sort last in both directions.
    pub fn compare(&self, a: &Listing, b: &Listing) -> Ordering {
        let primary = match self.sort_by {
            SortField::PostedAt => Some(self.directed(a.posted_at.cmp(&b.posted_at))),
            SortField::Deadline => self.compare_optional(a.deadline, b.deadline),
            SortField::StipendMin => self.compare_optional(
                a.stipend_min.map(OrderedAmount),
                b.stipend_min.map(OrderedAmount),
            ),
        };
        primary.unwrap_or(Ordering::Equal).then_with(|| a.id.cmp(&b.id))
    }

    fn directed(&self, ordering: Ordering) -> Ordering {
        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }

    fn compare_optional<T: Ord>(&self, a: Option<T>, b: Option<T>) -> Option<Ordering> {
        Some(match (a, b) {
            (Some(a), Some(b)) => self.directed(a.cmp(&b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedAmount(f64);

impl Eq for OrderedAmount {}

impl PartialOrd for OrderedAmount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedAmount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingPage {
    pub items: Vec<Listing>,
    pub total: u64,
    pub page: u32,
    pub pages: u32,
    pub limit: u32,
}

impl ListingPage {
    pub fn new(items: Vec<Listing>, total: u64, page: u32, limit: u32) -> Self {
        let pages = if limit == 0 {
            0
        } else {
            total.div_ceil(u64::from(limit)) as u32
        };
        Self {
            items,
            total,
            page,
            pages,
            limit,
        }
    }
}

/// Selection window for deadline reminders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderWindow {
    pub today: NaiveDate,
    pub until: NaiveDate,
    /// Entries reminded at or after this instant are skipped.
    pub not_reminded_since: DateTime<Utc>,
}

impl ReminderWindow {
    pub fn includes(&self, entry: &SavedEntry, listing: &Listing) -> bool {
        entry.status == SavedStatus::Interested
            && listing
                .deadline
                .is_some_and(|deadline| deadline >= self.today && deadline <= self.until)
            && entry
                .last_reminder_at
                .is_none_or(|at| at < self.not_reminded_since)
    }
}

/// One user's reminder-eligible saved listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderBatch {
    pub user_id: UserId,
    pub name: Option<String>,
    pub email: String,
    pub listings: Vec<Listing>,
}
