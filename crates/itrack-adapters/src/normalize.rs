//! Raw record → [`ListingDraft`] conversion with relevance filtering.

use std::sync::LazyLock;

use itrack_core::{ListingDraft, RawListing};
use regex::Regex;
use scraper::Html;

pub const DESCRIPTION_LIMIT: usize = 4000;

static INTERNSHIP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\binterns?(?:hips?)?\b").expect("internship pattern compiles")
});

static AI_ML: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:artificial intelligence|generative ai|machine learning|deep learning|neural networks?|data science|computer vision|nlp|llms?|genai|mlops|ai|ml)\b",
    )
    .expect("keyword pattern compiles")
});

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[a-zA-Z/!][^>]*>").expect("markup pattern compiles"));

const AMOUNT: &str = r"([0-9]{1,3}(?:[,\s]?[0-9]{3})+|[0-9]+k)";
const CURRENCY: &str = r"(?:\$|₹|rs\.?|inr)?";

static STIPEND_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"{CURRENCY}\s*{AMOUNT}\s*[-–to]{{1,3}}\s*{CURRENCY}\s*{AMOUNT}"
    ))
    .expect("range pattern compiles")
});

static STIPEND_SINGLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"{CURRENCY}\s*{AMOUNT}\s*(?:stipend|per\s*month|monthly)"
    ))
    .expect("single pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingTitle,
    NotInternship,
    NotRelevant,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingTitle => "missing_title",
            Self::NotInternship => "not_internship",
            Self::NotRelevant => "not_relevant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    description_limit: usize,
    default_tags: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            description_limit: DESCRIPTION_LIMIT,
            default_tags: ["AI", "ML", "Data"].into_iter().map(str::to_string).collect(),
        }
    }
}

impl Normalizer {
    pub fn normalize(&self, raw: RawListing, source_name: &str) -> Result<ListingDraft, Rejection> {
        let title = collapse_whitespace(&raw.title);
        if title.is_empty() {
            return Err(Rejection::MissingTitle);
        }
        let description = truncate_chars(&html_to_text(&raw.description), self.description_limit);

        if !raw.curated {
            if !is_internship_title(&title) {
                return Err(Rejection::NotInternship);
            }
            if !is_ai_ml_relevant(&title, &description) {
                return Err(Rejection::NotRelevant);
            }
        }

        let location = raw.location.trim().to_string();
        let remote = raw
            .remote
            .unwrap_or_else(|| location.to_lowercase().contains("remote"));

        let (stipend_min, stipend_max) = if raw.stipend_min.is_some() || raw.stipend_max.is_some() {
            (raw.stipend_min, raw.stipend_max)
        } else {
            match infer_stipend(&description) {
                Some((min, max)) => (positive(min), positive(max)),
                None => (None, None),
            }
        };

        let tags = if raw.tags.is_empty() && !raw.curated {
            self.default_tags.clone()
        } else {
            raw.tags
        };

        Ok(ListingDraft {
            title,
            company: raw.company.trim().to_string(),
            location,
            remote,
            stipend_min,
            stipend_max,
            duration_weeks: raw.duration_weeks,
            skills: raw.skills,
            tags,
            description,
            source: raw
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| source_name.to_string()),
            source_url: raw.source_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()),
            external_id: raw.external_id,
            deadline: raw.deadline,
            posted_at: raw.posted_at,
            raw_meta: raw.raw_meta,
        })
    }
}

fn positive(value: f64) -> Option<f64> {
    (value > 0.0).then_some(value)
}

pub fn is_internship_title(title: &str) -> bool {
    INTERNSHIP.is_match(title)
}

pub fn is_ai_ml_relevant(title: &str, description: &str) -> bool {
    AI_ML.is_match(title) || AI_ML.is_match(description)
}

/// Decodes entities, drops tags, and collapses whitespace.
///
/// Some boards ship entity-escaped markup (`&lt;p&gt;`), which only becomes tags
/// after the first decode, so a second pass runs when markup survives.
pub fn html_to_text(input: &str) -> String {
    let mut text = fragment_text(input);
    if MARKUP.is_match(&text) {
        text = fragment_text(&text);
    }
    collapse_whitespace(&text.replace('\u{a0}', " "))
}

fn fragment_text(input: &str) -> String {
    Html::parse_fragment(input)
        .root_element()
        .text()
        .collect::<String>()
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(input: &str, limit: usize) -> String {
    match input.char_indices().nth(limit) {
        Some((cut, _)) => input[..cut].to_string(),
        None => input.to_string(),
    }
}

/// Best-effort monthly stipend extraction. Returns `(min, max)`.
pub fn infer_stipend(text: &str) -> Option<(f64, f64)> {
    let lowered = text.to_lowercase();
    if let Some(caps) = STIPEND_RANGE.captures(&lowered) {
        let min = parse_amount(caps.get(1)?.as_str())?;
        let max = parse_amount(caps.get(2)?.as_str())?;
        return Some((min, max));
    }
    let caps = STIPEND_SINGLE.captures(&lowered)?;
    let amount = parse_amount(caps.get(1)?.as_str())?;
    Some((amount, amount))
}

fn parse_amount(token: &str) -> Option<f64> {
    let digits: String = token
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    let value = match digits.strip_suffix('k') {
        Some(thousands) => thousands.parse::<f64>().ok()? * 1000.0,
        None => digits.parse::<f64>().ok()?,
    };
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(title: &str, description: &str) -> RawListing {
        RawListing {
            title: title.to_string(),
            company: "Acme".to_string(),
            location: "Remote - India".to_string(),
            description: description.to_string(),
            ..RawListing::default()
        }
    }

    #[test]
    fn rejects_non_internships_and_accepts_ml_interns() {
        let normalizer = Normalizer::default();
        assert_eq!(
            normalizer
                .normalize(raw("Senior Backend Engineer", "Scale our APIs"), "Greenhouse")
                .unwrap_err(),
            Rejection::NotInternship
        );
        let draft = normalizer
            .normalize(raw("Machine Learning Intern", ""), "Greenhouse")
            .expect("accepted");
        assert_eq!(draft.source, "Greenhouse");
        assert!(draft.remote);
        assert_eq!(draft.tags, vec!["AI", "ML", "Data"]);
    }

    #[test]
    fn keyword_matches_are_word_bounded() {
        assert!(!is_internship_title("Internal Tools Engineer"));
        assert!(is_internship_title("Summer Internship 2026"));
        assert!(!is_ai_ml_relevant("Marketing Intern", "Maintain our email campaigns"));
        assert!(is_ai_ml_relevant("Research Intern", "Evaluate LLMs and NLP pipelines"));
        assert!(is_ai_ml_relevant("MLOps Intern", "Join our platform team"));
        assert!(is_ai_ml_relevant("GenAI Intern", "Join our platform team"));
        assert!(is_ai_ml_relevant("Generative AI Intern", ""));
        assert!(!is_ai_ml_relevant("Email Marketing Intern", "Plain campaigns"));

        let normalizer = Normalizer::default();
        assert_eq!(
            normalizer
                .normalize(raw("Marketing Intern", "Maintain our email campaigns"), "Lever")
                .unwrap_err(),
            Rejection::NotRelevant
        );
    }

    #[test]
    fn curated_records_skip_relevance_filters() {
        let mut record = raw("Research Assistant", "Lab work");
        record.curated = true;
        let draft = Normalizer::default()
            .normalize(record, "CSV")
            .expect("curated is accepted");
        assert!(draft.tags.is_empty());
    }

    #[test]
    fn infers_stipend_ranges_and_single_amounts() {
        assert_eq!(
            infer_stipend("Stipend: ₹10,000 - ₹20,000 per month"),
            Some((10000.0, 20000.0))
        );
        assert_eq!(infer_stipend("5k-8k stipend"), Some((5000.0, 8000.0)));
        assert_eq!(infer_stipend("$3000 to $5000"), Some((3000.0, 5000.0)));
        assert_eq!(infer_stipend("INR 15000 monthly"), Some((15000.0, 15000.0)));
        assert_eq!(infer_stipend("Competitive pay and great mentors"), None);
    }

    #[test]
    fn explicit_stipend_wins_over_inference() {
        let mut record = raw("ML Intern", "Stipend: 5k-8k stipend");
        record.stipend_min = Some(12000.0);
        let draft = Normalizer::default().normalize(record, "CSV").expect("ok");
        assert_eq!(draft.stipend_min, Some(12000.0));
        assert_eq!(draft.stipend_max, None);

        let draft = Normalizer::default()
            .normalize(raw("ML Intern", "No stipend mentioned"), "Lever")
            .expect("ok");
        assert_eq!((draft.stipend_min, draft.stipend_max), (None, None));
    }

    #[test]
    fn strips_escaped_markup_and_truncates() {
        assert_eq!(
            html_to_text("&lt;p&gt;Join our &lt;strong&gt;AI&lt;/strong&gt; team&lt;/p&gt;"),
            "Join our AI team"
        );
        assert_eq!(html_to_text("<p>Tom&nbsp;&amp; Jerry</p>"), "Tom & Jerry");
        assert_eq!(html_to_text("<p>Paid Intern<b>ship</b> in ML</p>"), "Paid Internship in ML");

        let long = format!("<p>{}</p>", "é".repeat(DESCRIPTION_LIMIT + 50));
        let draft = Normalizer::default()
            .normalize(raw("AI Intern", &long), "Ashby")
            .expect("ok");
        assert_eq!(draft.description.chars().count(), DESCRIPTION_LIMIT);
    }
}
