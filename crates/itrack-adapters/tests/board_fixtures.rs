// Board fixtures run through adapter parsing and the normalizer, end to end.

use std::path::{Path, PathBuf};

use chrono::Utc;
use itrack_adapters::{adapter_for_source, FetchedPage, Normalizer, Rejection, SourceConfig};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn page(fixture: &str, target: &str) -> FetchedPage {
    let path = workspace_root().join("fixtures").join(fixture);
    FetchedPage {
        target: target.to_string(),
        url: format!("file://{}", path.display()),
        content_type: "application/json".to_string(),
        body: std::fs::read(&path).expect("fixture exists"),
        fetched_at: Utc::now(),
    }
}

fn source(kind: &str, display_name: &str, board: &str) -> SourceConfig {
    SourceConfig {
        source_id: format!("{kind}-boards"),
        kind: kind.to_string(),
        display_name: display_name.to_string(),
        enabled: true,
        boards: vec![board.to_string()],
        path: None,
    }
}

/// Returns accepted titles and rejection reasons for one fixture page.
fn ingest(config: &SourceConfig, page: &FetchedPage) -> (Vec<String>, Vec<Rejection>, usize) {
    let adapter = adapter_for_source(config).expect("known kind");
    let normalizer = Normalizer::default();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut errored = 0;
    for record in adapter.parse_listing(page).expect("page parses") {
        match record {
            Ok(raw) => match normalizer.normalize(raw, adapter.source_name()) {
                Ok(draft) => {
                    assert_eq!(draft.source, config.display_name);
                    accepted.push(draft.title);
                }
                Err(reason) => rejected.push(reason),
            },
            Err(_) => errored += 1,
        }
    }
    (accepted, rejected, errored)
}

#[test]
fn greenhouse_fixture_keeps_only_ai_internships() {
    let (accepted, rejected, errored) = ingest(
        &source("greenhouse", "Greenhouse", "acme"),
        &page("greenhouse/acme.json", "acme"),
    );
    assert_eq!(accepted, vec!["Machine Learning Intern"]);
    assert_eq!(rejected, vec![Rejection::NotInternship]);
    assert_eq!(errored, 1);
}

#[test]
fn lever_fixture_accepts_both_postings() {
    let (accepted, rejected, errored) = ingest(
        &source("lever", "Lever", "globex"),
        &page("lever/globex.json", "globex"),
    );
    assert_eq!(
        accepted,
        vec!["AI Research Intern (Summer 2026)", "Data Science Intern"]
    );
    assert!(rejected.is_empty());
    assert_eq!(errored, 0);
}

#[test]
fn ashby_fixtures_parse_in_both_payload_shapes() {
    let config = source("ashby", "Ashby", "initech");
    for fixture in ["ashby/job_board.json", "ashby/organization.json"] {
        let (accepted, rejected, errored) = ingest(&config, &page(fixture, "initech"));
        assert_eq!(accepted.len(), 1, "{fixture}");
        assert!(rejected.is_empty(), "{fixture}");
        assert_eq!(errored, 0, "{fixture}");
    }
}
