//! Post-normalization enrichment hooks.

use std::path::Path;

use anyhow::{Context, Result};
use itrack_core::ListingDraft;
use serde::Deserialize;

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, draft: &mut ListingDraft);
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, _draft: &mut ListingDraft) {}
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRule {
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    skill: Option<String>,
    contains_any: Vec<String>,
}

/// Keyword rules from `rules/tags.yaml` that add tags and skills.
///
/// Matching is a case-insensitive substring test against title and description.
pub struct YamlTagRules {
    rules: Vec<TagRule>,
}

impl YamlTagRules {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("tags.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: TagRulesFile = serde_yaml::from_str(text)?;
        Ok(Self { rules: file.rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        values.push(value.to_string());
    }
}

impl EnrichmentHook for YamlTagRules {
    fn apply(&self, draft: &mut ListingDraft) {
        let combined = format!("{} {}", draft.title, draft.description).to_lowercase();
        for rule in &self.rules {
            let hit = rule
                .contains_any
                .iter()
                .any(|needle| combined.contains(&needle.to_lowercase()));
            if !hit {
                continue;
            }
            if let Some(tag) = &rule.tag {
                push_unique(&mut draft.tags, tag);
            }
            if let Some(skill) = &rule.skill {
                push_unique(&mut draft.skills, skill);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
version: 1
rules:
  - tag: NLP
    contains_any: ["nlp", "language model"]
  - skill: PyTorch
    contains_any: ["pytorch"]
  - tag: Vision
    skill: OpenCV
    contains_any: ["computer vision"]
"#;

    #[test]
    fn rules_add_tags_and_skills_without_duplicates() {
        let rules = YamlTagRules::from_yaml(RULES).expect("parse rules");
        assert_eq!(rules.len(), 3);

        let mut draft = ListingDraft {
            title: "NLP Research Intern".to_string(),
            description: "Fine-tune large Language Models in PyTorch".to_string(),
            tags: vec!["AI".to_string(), "nlp".to_string()],
            skills: vec!["Python".to_string()],
            ..ListingDraft::default()
        };
        rules.apply(&mut draft);

        assert_eq!(draft.tags, vec!["AI", "nlp"]);
        assert_eq!(draft.skills, vec!["Python", "PyTorch"]);
    }

    #[test]
    fn unmatched_rules_leave_draft_untouched() {
        let rules = YamlTagRules::from_yaml(RULES).expect("parse rules");
        let mut draft = ListingDraft {
            title: "Data Science Intern".to_string(),
            ..ListingDraft::default()
        };
        let before = draft.clone();
        rules.apply(&mut draft);
        assert_eq!(draft, before);
    }

    #[test]
    fn workspace_rules_file_parses() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let rules = YamlTagRules::from_workspace_root(&root).expect("rules/tags.yaml");
        assert!(!rules.is_empty());
    }
}
