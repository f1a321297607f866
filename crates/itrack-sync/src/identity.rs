//! Content-derived listing identity.

use std::str::FromStr;

use itrack_core::{IdentifiedListing, IdentityConfidence, ListingDraft, ListingIdentity};
use sha2::{Digest, Sha256};

/// SHA-256 over `title|company|location|locator`, each trimmed and lowercased, hex-encoded.
pub fn identity_hash(title: &str, company: &str, location: &str, locator: &str) -> String {
    let normalized = [title, company, location, locator]
        .iter()
        .map(|part| part.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("|");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// What to do with listings that have neither a source URL nor an upstream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlLessIdentity {
    /// Hash on content alone and flag the identity as low-confidence.
    #[default]
    Merge,
    Reject,
}

impl FromStr for UrlLessIdentity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown url-less identity policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentOnlyRejected;

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPolicy {
    pub url_less: UrlLessIdentity,
}

impl IdentityPolicy {
    pub fn new(url_less: UrlLessIdentity) -> Self {
        Self { url_less }
    }

    pub fn identify(&self, draft: ListingDraft) -> Result<IdentifiedListing, ContentOnlyRejected> {
        let external_id = draft
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let (locator, confidence) = match (draft.source_url.as_deref(), external_id) {
            (Some(url), _) if !url.trim().is_empty() => {
                (url.to_string(), IdentityConfidence::SourceUrl)
            }
            (_, Some(id)) => (
                format!("ext:{}:{id}", draft.source.trim().to_lowercase()),
                IdentityConfidence::ExternalId,
            ),
            _ => (String::new(), IdentityConfidence::ContentOnly),
        };

        if confidence == IdentityConfidence::ContentOnly && self.url_less == UrlLessIdentity::Reject
        {
            return Err(ContentOnlyRejected);
        }

        let unique_hash = identity_hash(&draft.title, &draft.company, &draft.location, &locator);
        Ok(IdentifiedListing {
            draft,
            identity: ListingIdentity {
                unique_hash,
                confidence,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(url: Option<&str>, external_id: Option<&str>) -> ListingDraft {
        ListingDraft {
            title: "ML Intern".to_string(),
            company: "Acme".to_string(),
            location: "Remote".to_string(),
            source: "Lever".to_string(),
            source_url: url.map(str::to_string),
            external_id: external_id.map(str::to_string),
            ..ListingDraft::default()
        }
    }

    #[test]
    fn hash_matches_known_digest() {
        assert_eq!(
            identity_hash("Machine Learning Intern", "Acme", "Remote", "https://x/1"),
            "d281e7164a80af5e2cb5d5b26b9ac9b6aea8e0a5b6f572f88a26010c7e96ff37"
        );
        assert_eq!(
            identity_hash("", "", "", ""),
            "be5be69f55e91af25e54ecc2154d4da359b67b3b27e25f5cc0b3ff54eb74dff3"
        );
    }

    #[test]
    fn hash_ignores_case_and_surrounding_whitespace() {
        let a = identity_hash("Machine Learning Intern", "Acme", "Remote", "https://x/1");
        let b = identity_hash("  machine learning INTERN ", "ACME ", " remote", "HTTPS://X/1 ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, identity_hash("Machine Learning Intern", "Acme", "Remote", "https://x/2"));
    }

    #[test]
    fn locator_prefers_url_then_external_id() {
        let policy = IdentityPolicy::default();
        let by_url = policy.identify(draft(Some("https://x/1"), Some("42"))).expect("url");
        assert_eq!(by_url.identity.confidence, IdentityConfidence::SourceUrl);

        let by_id = policy.identify(draft(None, Some("42"))).expect("id");
        assert_eq!(by_id.identity.confidence, IdentityConfidence::ExternalId);
        assert_eq!(
            by_id.identity.unique_hash,
            identity_hash("ML Intern", "Acme", "Remote", "ext:lever:42")
        );

        let content = policy.identify(draft(Some("  "), None)).expect("content");
        assert_eq!(content.identity.confidence, IdentityConfidence::ContentOnly);
    }

    #[test]
    fn reject_policy_refuses_content_only_identity() {
        let policy = IdentityPolicy::new(UrlLessIdentity::Reject);
        assert_eq!(policy.identify(draft(None, None)), Err(ContentOnlyRejected));
        assert!(policy.identify(draft(None, Some("7"))).is_ok());
        assert_eq!("REJECT".parse::<UrlLessIdentity>(), Ok(UrlLessIdentity::Reject));
    }
}
