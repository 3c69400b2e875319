use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use qmd_pipeline::convert::{
    convert_all, convert_pdf, ConvertOptions, ConvertOutcome, MockPdfParser, ParseStatus,
};
use qmd_pipeline::error::Error;
use tempfile::tempdir;

fn options() -> ConvertOptions {
    ConvertOptions {
        force: false,
        poll_interval: Duration::from_millis(1),
        max_wait: Duration::from_secs(5),
        concurrency: 2,
    }
}

fn parsed_markdown() -> String {
    let payload = BASE64.encode(b"image-bytes");
    format!("# Parsed Report\n\n![figure](data:image/png;base64,{payload})\n")
}

#[tokio::test]
async fn converts_a_pdf_after_polling() {
    let dir = tempdir().unwrap();
    let pdf = dir.path().join("report.pdf");
    std::fs::write(&pdf, b"%PDF-1.4 fake").unwrap();

    let mut parser = MockPdfParser::new();
    parser
        .expect_upload()
        .times(1)
        .returning(|_| Ok("upload-1".to_string()));

    // parsing completes on the second poll
    let polls = Arc::new(AtomicUsize::new(0));
    let polls_clone = Arc::clone(&polls);
    parser.expect_fetch_markdown().times(2).returning(move |id| {
        assert_eq!(id, "upload-1");
        if polls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(ParseStatus::Pending)
        } else {
            Ok(ParseStatus::Ready(parsed_markdown()))
        }
    });

    let outcome = convert_pdf(&parser, &pdf, &options()).await.unwrap();
    let ConvertOutcome::Converted { qmd, images } = outcome else {
        panic!("expected a conversion");
    };
    assert_eq!(images, 1);
    assert_eq!(qmd, dir.path().join("report.qmd"));

    let content = std::fs::read_to_string(&qmd).unwrap();
    // YAML header was added and the inline image extracted
    assert!(content.starts_with("---"));
    assert!(content.contains("category: products"));
    assert!(content.contains("report-media/img-"));
    assert!(!content.contains("base64"));

    assert!(dir.path().join("report.qmd.bak").is_file());
    assert!(dir.path().join("report-media").is_dir());
}

#[tokio::test]
async fn existing_qmd_skips_the_upload() {
    let dir = tempdir().unwrap();
    let pdf = dir.path().join("report.pdf");
    std::fs::write(&pdf, b"%PDF-1.4 fake").unwrap();
    std::fs::write(dir.path().join("report.qmd"), "---\ntitle: done\n---\n").unwrap();

    let mut parser = MockPdfParser::new();
    parser.expect_upload().times(0);
    parser.expect_fetch_markdown().times(0);

    let outcome = convert_pdf(&parser, &pdf, &options()).await.unwrap();
    assert!(matches!(outcome, ConvertOutcome::Skipped { .. }));
}

#[tokio::test]
async fn force_reconverts_existing_qmd() {
    let dir = tempdir().unwrap();
    let pdf = dir.path().join("report.pdf");
    std::fs::write(&pdf, b"%PDF-1.4 fake").unwrap();
    std::fs::write(dir.path().join("report.qmd"), "---\ntitle: stale\n---\n").unwrap();

    let mut parser = MockPdfParser::new();
    parser
        .expect_upload()
        .times(1)
        .returning(|_| Ok("upload-2".to_string()));
    parser
        .expect_fetch_markdown()
        .times(1)
        .returning(|_| Ok(ParseStatus::Ready("# Fresh".to_string())));

    let mut opts = options();
    opts.force = true;
    let outcome = convert_pdf(&parser, &pdf, &opts).await.unwrap();
    assert!(matches!(outcome, ConvertOutcome::Converted { .. }));
    let content = std::fs::read_to_string(dir.path().join("report.qmd")).unwrap();
    assert!(content.contains("# Fresh"));
}

#[tokio::test]
async fn polling_gives_up_after_max_wait() {
    let dir = tempdir().unwrap();
    let pdf = dir.path().join("slow.pdf");
    std::fs::write(&pdf, b"%PDF-1.4 fake").unwrap();

    let mut parser = MockPdfParser::new();
    parser
        .expect_upload()
        .returning(|_| Ok("upload-slow".to_string()));
    parser
        .expect_fetch_markdown()
        .returning(|_| Ok(ParseStatus::Pending));

    let mut opts = options();
    opts.max_wait = Duration::ZERO;
    let err = convert_pdf(&parser, &pdf, &opts).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test]
async fn convert_all_collects_failures_without_aborting() {
    let dir = tempdir().unwrap();
    let good = dir.path().join("good.pdf");
    let bad = dir.path().join("bad.pdf");
    std::fs::write(&good, b"%PDF-1.4 fake").unwrap();
    std::fs::write(&bad, b"%PDF-1.4 fake").unwrap();

    let mut parser = MockPdfParser::new();
    parser.expect_upload().returning(|path| {
        if path.file_name().and_then(|n| n.to_str()) == Some("bad.pdf") {
            Err(Error::Api {
                status: 500,
                body: "upstream broke".to_string(),
            })
        } else {
            Ok("upload-good".to_string())
        }
    });
    parser
        .expect_fetch_markdown()
        .returning(|_| Ok(ParseStatus::Ready("# Good".to_string())));

    let pdfs: Vec<PathBuf> = vec![good, bad.clone()];
    let report = convert_all(&parser, &pdfs, &options()).await;

    assert_eq!(report.converted.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad);
    assert!(report.failed[0].1.contains("500"));
}
