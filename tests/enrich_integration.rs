use std::collections::HashSet;
use std::fs;
use std::path::Path;

use qmd_pipeline::enrich;
use qmd_pipeline::llm::MockLanguageModel;
use tempfile::tempdir;

const RESPONSE: &str = r#"{
  "introduction": "This document sets out the production methodology for the coastal mapping layer.",
  "keywords": ["coastal zone mapping", "land cover classification", "satellite imagery", "change detection", "habitat typology", "spatial resolution", "accuracy assessment", "wetland delineation", "photointerpretation", "reference datasets"]
}"#;

fn write_doc(docs: &Path) {
    fs::create_dir_all(docs.join("products")).unwrap();
    fs::write(
        docs.join("products/coastal_v1.qmd"),
        "---\ntitle: Coastal Mapping\ncategory: products\n---\n\n# Methodology\n\nLong body text.\n",
    )
    .unwrap();
}

#[tokio::test]
async fn enriches_then_serves_from_cache() {
    let dir = tempdir().unwrap();
    let docs = dir.path().join("DOCS");
    let cache = dir.path().join(".llm_cache");
    write_doc(&docs);

    let mut model = MockLanguageModel::new();
    // one call for the initial run, one after the document changes;
    // the in-between run must be served from cache
    model
        .expect_generate()
        .times(2)
        .returning(|_, _| Ok(RESPONSE.to_string()));

    let report = enrich::run(&model, &docs, &cache, &[], &HashSet::new(), 950_000)
        .await
        .unwrap();
    assert_eq!(report.enriched, 1);
    assert_eq!(report.from_cache, 0);
    assert!(report.tokens_sent > 0);

    let content = fs::read_to_string(docs.join("products/coastal_v1.qmd")).unwrap();
    assert!(content.contains("description: This document sets out the production methodology"));
    assert!(content.contains("coastal zone mapping"));
    assert!(content.contains("# Methodology"));

    // cache file landed under the cache dir
    let cache_files: Vec<_> = fs::read_dir(&cache).unwrap().collect();
    assert_eq!(cache_files.len(), 1);

    // second run: unchanged document, no model call
    let report = enrich::run(&model, &docs, &cache, &[], &HashSet::new(), 950_000)
        .await
        .unwrap();
    assert_eq!(report.enriched, 0);
    assert_eq!(report.from_cache, 1);

    // the document changes, the hash no longer matches, the model is asked again
    fs::write(
        docs.join("products/coastal_v1.qmd"),
        "---\ntitle: Coastal Mapping\ncategory: products\n---\n\n# Methodology\n\nRevised body text.\n",
    )
    .unwrap();
    let report = enrich::run(&model, &docs, &cache, &[], &HashSet::new(), 950_000)
        .await
        .unwrap();
    assert_eq!(report.enriched, 1);
}

#[tokio::test]
async fn modified_list_forces_regeneration() {
    let dir = tempdir().unwrap();
    let docs = dir.path().join("DOCS");
    let cache = dir.path().join(".llm_cache");
    write_doc(&docs);

    let mut model = MockLanguageModel::new();
    model
        .expect_generate()
        .times(2)
        .returning(|_, _| Ok(RESPONSE.to_string()));

    enrich::run(&model, &docs, &cache, &[], &HashSet::new(), 950_000)
        .await
        .unwrap();

    // the hash still matches, but CI flagged the document as modified
    let modified: HashSet<String> = ["DOCS/products/coastal_v1.qmd".to_string()]
        .into_iter()
        .collect();
    let report = enrich::run(&model, &docs, &cache, &[], &modified, 950_000)
        .await
        .unwrap();
    assert_eq!(report.enriched, 1);
}

#[tokio::test]
async fn token_budget_defers_documents() {
    let dir = tempdir().unwrap();
    let docs = dir.path().join("DOCS");
    let cache = dir.path().join(".llm_cache");
    write_doc(&docs);

    let mut model = MockLanguageModel::new();
    model.expect_generate().times(0);

    let report = enrich::run(&model, &docs, &cache, &[], &HashSet::new(), 1)
        .await
        .unwrap();
    assert_eq!(report.enriched, 0);
    assert_eq!(report.skipped_budget, 1);

    // no cache, so the frontmatter is untouched
    let content = fs::read_to_string(docs.join("products/coastal_v1.qmd")).unwrap();
    assert!(!content.contains("description:"));
}
