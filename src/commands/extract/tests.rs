use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use super::*;
use crate::checkbox::CalibrationRecord;
use crate::tokenizer::TokenType;

const BOX_X: i32 = 300;
const BOX_SIDE: u32 = 12;

#[derive(Clone)]
struct FakePage {
    text: String,
    raster: Option<GrayImage>,
}

struct FakeSource {
    leading: Vec<u8>,
    pages: Vec<FakePage>,
    failing_pages: Vec<u32>,
    page_delay: Option<Duration>,
}

impl FakeSource {
    fn new(pages: Vec<FakePage>) -> Self {
        Self {
            leading: Vec::new(),
            pages,
            failing_pages: Vec::new(),
            page_delay: None,
        }
    }
}

impl PageSource for FakeSource {
    fn leading_bytes(&self, _path: &Path) -> Result<Vec<u8>> {
        Ok(self.leading.clone())
    }

    fn page_count(&self, _path: &Path) -> Result<u32> {
        Ok(self.pages.len() as u32)
    }

    fn load_page(&self, _path: &Path, page: u32) -> Result<PageContent> {
        if let Some(delay) = self.page_delay {
            thread::sleep(delay);
        }
        if self.failing_pages.contains(&page) {
            bail!("synthetic failure on page {page}");
        }
        let fake = self
            .pages
            .get(page as usize - 1)
            .context("page out of range")?;
        Ok(PageContent {
            page,
            lines: lines_from_plain_text(&fake.text),
            raster: fake.raster.clone().map(|image| PageRaster { image, dpi: 72.0 }),
        })
    }
}

fn draw_box(image: &mut GrayImage, x: i32, y: i32, checked: bool) {
    draw_hollow_rect_mut(image, Rect::at(x, y).of_size(BOX_SIDE, BOX_SIDE), Luma([0]));
    if checked {
        draw_filled_rect_mut(image, Rect::at(x + 3, y + 3).of_size(6, 6), Luma([0]));
    }
}

/// One MiCOM code every other line, each with a box level with its code.
/// At 72 dpi points and pixels coincide, so code `i` is centred at y = 42 + 24i.
fn micom_page(checked: &[bool]) -> FakePage {
    let mut text = String::new();
    for (index, _) in checked.iter().enumerate() {
        text.push_str(&format!("09.0{index}  Trip output {index}\n\n"));
    }

    // Spare room below the last code for stray boxes.
    let height = 60 + 24 * checked.len() as u32 + 80;
    let mut image = GrayImage::from_pixel(400, height, Luma([255]));
    for (index, is_checked) in checked.iter().enumerate() {
        draw_box(&mut image, BOX_X, 36 + 24 * index as i32, *is_checked);
    }

    FakePage {
        text,
        raster: Some(image),
    }
}

fn calibrated(noise_floor: f64) -> CalibrationStore {
    let mut store = CalibrationStore::default();
    store.insert(CalibrationRecord {
        template_id: "micom_p122".to_string(),
        threshold: 0.3,
        noise_floor,
        sample_count: 12,
        separation_margin: 0.5,
        generated_at: None,
    });
    store
}

fn extractor(calibrations: CalibrationStore, options: ExtractOptions) -> Extractor {
    Extractor::new(ExtractionConfig::default(), calibrations, options)
        .expect("extractor builds")
}

fn input(index: usize, filename: &str, kind: DocumentKind) -> DocumentInput {
    DocumentInput {
        index,
        path: PathBuf::from(filename),
        filename: filename.to_string(),
        kind,
        sha256: "0".repeat(64),
    }
}

fn states(outcome: &DocumentOutcome) -> Vec<Vec<CheckboxState>> {
    outcome
        .records
        .iter()
        .map(|record| record.checkbox_states.clone())
        .collect()
}

#[test]
fn five_codes_each_owning_a_checked_box() {
    let source = FakeSource::new(vec![micom_page(&[true; 5])]);
    let outcome = extractor(calibrated(0.0), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::Completed);
    assert_eq!(outcome.grammar, Some(Grammar::MicomP122));
    assert_eq!(outcome.records.len(), 5);
    assert_eq!(
        outcome
            .records
            .iter()
            .map(ParameterRecord::checked_count)
            .sum::<usize>(),
        5
    );
    assert!(states(&outcome)
        .iter()
        .all(|states| states == &vec![CheckboxState::Checked]));
    assert!(outcome.diagnostics.is_empty());
    assert!(outcome
        .records
        .iter()
        .all(|record| (record.overall_confidence - 1.0).abs() < 1e-9));
    assert_eq!(outcome.records[2].code, "09.02");
    assert_eq!(outcome.records[2].template_id, "micom_p122");
}

#[test]
fn mixed_states_stay_with_their_codes() {
    let source = FakeSource::new(vec![micom_page(&[true, false, true, false, false])]);
    let outcome = extractor(calibrated(0.0), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    use CheckboxState::{Checked, Unchecked};
    assert_eq!(
        states(&outcome),
        vec![
            vec![Checked],
            vec![Unchecked],
            vec![Checked],
            vec![Unchecked],
            vec![Unchecked],
        ]
    );
}

#[test]
fn missing_calibration_leaves_states_not_evaluated() {
    let source = FakeSource::new(vec![micom_page(&[true, false, true])]);
    let outcome = extractor(CalibrationStore::default(), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::Completed);
    assert_eq!(outcome.count_issues("calibration_missing"), 1);
    assert!(states(&outcome)
        .iter()
        .all(|states| states == &vec![CheckboxState::NotEvaluated]));
    assert!(outcome
        .records
        .iter()
        .all(|record| record.overall_confidence == 0.0));
}

#[test]
fn invalid_calibration_is_never_used() {
    let mut calibrations = CalibrationStore::default();
    calibrations.insert(CalibrationRecord {
        template_id: "micom_p122".to_string(),
        threshold: 0.4,
        noise_floor: 0.0,
        sample_count: 4,
        separation_margin: -0.1,
        generated_at: None,
    });
    let source = FakeSource::new(vec![micom_page(&[true])]);
    let outcome = extractor(calibrations, ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.count_issues("calibration_invalid"), 1);
    assert_eq!(states(&outcome), vec![vec![CheckboxState::NotEvaluated]]);
}

#[test]
fn sparse_regions_below_noise_floor_are_dropped_from_counts() {
    let source = FakeSource::new(vec![micom_page(&[true, false, false, false, false])]);
    let outcome = extractor(calibrated(0.02), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.count_issues("region_rejected_as_noise"), 4);
    assert_eq!(states(&outcome)[0], vec![CheckboxState::Checked]);
    assert!(states(&outcome)[1..].iter().all(Vec::is_empty));
    let counts = summarize_counts(std::slice::from_ref(&outcome));
    assert_eq!(counts.checkboxes_attributed, 1);
    assert_eq!(counts.noise_regions_rejected, 4);
}

#[test]
fn far_away_box_is_reported_not_attributed() {
    let mut page = micom_page(&[false, false]);
    if let Some(image) = page.raster.as_mut() {
        // Anchors sit at y = 42 and 66; this box is centred at 146.
        draw_box(image, BOX_X, 140, true);
    }
    let source = FakeSource::new(vec![page]);
    let outcome = extractor(calibrated(0.0), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].y, 140);
    assert_eq!(outcome.diagnostics[0].state, CheckboxState::Checked);
    assert_eq!(outcome.count_issues("unattributable_checkbox"), 1);
    assert_eq!(
        states(&outcome),
        vec![vec![CheckboxState::Unchecked], vec![CheckboxState::Unchecked]]
    );
}

#[test]
fn failing_page_does_not_sink_the_document() {
    let mut source = FakeSource::new(vec![
        micom_page(&[true]),
        micom_page(&[true]),
        micom_page(&[false]),
    ]);
    source.failing_pages = vec![2];
    let outcome = extractor(calibrated(0.0), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::Partial);
    assert_eq!(outcome.pages_processed, 2);
    assert_eq!(
        outcome
            .records
            .iter()
            .map(|record| record.page)
            .collect::<Vec<_>>(),
        vec![1, 3]
    );
    assert!(outcome
        .issues
        .iter()
        .any(|issue| matches!(issue, ExtractionIssue::PageFailed { page: 2, .. })));
}

#[test]
fn every_page_failing_fails_the_document() {
    let mut source = FakeSource::new(vec![micom_page(&[true])]);
    source.failing_pages = vec![1];
    let outcome = extractor(calibrated(0.0), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::Failed);
    assert!(outcome.records.is_empty());
}

#[test]
fn expired_deadline_times_out_before_the_next_page() {
    let source = FakeSource::new(vec![micom_page(&[true]), micom_page(&[true])]);
    let options = ExtractOptions {
        max_pages_per_doc: None,
        document_timeout: Some(Duration::ZERO),
    };
    let outcome = extractor(calibrated(0.0), options)
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::TimedOut);
    assert_eq!(outcome.pages_processed, 0);
    assert!(outcome.issues.iter().any(|issue| matches!(
        issue,
        ExtractionIssue::DocumentTimedOut { pages_done: 0, .. }
    )));
}

#[test]
fn slow_last_page_still_times_out_and_keeps_its_records() {
    let mut source = FakeSource::new(vec![micom_page(&[true])]);
    source.page_delay = Some(Duration::from_millis(120));
    let options = ExtractOptions {
        max_pages_per_doc: None,
        document_timeout: Some(Duration::from_millis(30)),
    };
    let outcome = extractor(calibrated(0.0), options)
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::TimedOut);
    assert_eq!(outcome.pages_processed, 1);
    assert!(!outcome.records.is_empty());
    assert_eq!(outcome.count_issues("document_timed_out"), 1);
    assert!(outcome.issues.iter().any(|issue| matches!(
        issue,
        ExtractionIssue::DocumentTimedOut { pages_done: 1, .. }
    )));
}

#[test]
fn slow_page_stops_the_remaining_pages() {
    let mut source = FakeSource::new(vec![micom_page(&[true]); 3]);
    source.page_delay = Some(Duration::from_millis(60));
    let options = ExtractOptions {
        max_pages_per_doc: None,
        document_timeout: Some(Duration::from_millis(20)),
    };
    let outcome = extractor(calibrated(0.0), options)
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::TimedOut);
    assert_eq!(outcome.pages_processed, 1);
}

#[cfg(unix)]
#[test]
fn hung_tool_is_killed_at_the_limit() {
    let started = Instant::now();
    let error = run_tool(
        Command::new("sleep").arg("5"),
        Some(Duration::from_millis(50)),
    )
    .expect_err("sleep outlives the limit");
    assert!(error.to_string().contains("killed after 50 ms"));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[cfg(unix)]
#[test]
fn timed_tool_output_is_captured() {
    let output = run_tool(
        Command::new("echo").arg("Pages: 3"),
        Some(Duration::from_secs(10)),
    )
    .expect("echo runs");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "Pages: 3");
}

#[test]
fn page_limit_caps_processing() {
    let source = FakeSource::new(vec![micom_page(&[true]); 3]);
    let options = ExtractOptions {
        max_pages_per_doc: Some(2),
        document_timeout: None,
    };
    let outcome = extractor(calibrated(0.0), options)
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.pages_processed, 2);
    assert_eq!(outcome.records.len(), 2);
}

#[test]
fn unrecognized_format_stops_only_that_document() {
    let source = FakeSource::new(vec![micom_page(&[true])]);
    let outcome = extractor(calibrated(0.0), ExtractOptions::default())
        .process_with_source(&input(0, "mystery.pdf", DocumentKind::Pdf), &source);

    assert_eq!(outcome.status, DocumentStatus::Failed);
    assert_eq!(outcome.grammar, None);
    assert_eq!(outcome.pages_processed, 0);
    assert_eq!(outcome.count_issues("format_unrecognized"), 1);
}

#[test]
fn identical_input_yields_identical_records() {
    let source = FakeSource::new(vec![micom_page(&[true, false, true])]);
    let extractor = extractor(calibrated(0.0), ExtractOptions::default());
    let document = input(0, "P122_feeder06.pdf", DocumentKind::Pdf);

    let first = extractor.process_with_source(&document, &source);
    let second = extractor.process_with_source(&document, &source);
    assert_eq!(first.records, second.records);
    assert_eq!(first.diagnostics, second.diagnostics);
    assert_eq!(first.issues, second.issues);
}

#[test]
fn key_value_dump_runs_through_the_text_track() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("feeder.txt");
    fs::write(
        &path,
        "RID := P122_204-PN-06_LADO_A_2014-08-01  TID := SUB\n50P1P := 1.00\n",
    )
    .expect("write dump");

    let document = DocumentInput {
        path,
        ..input(0, "feeder.txt", DocumentKind::KeyValue)
    };
    let outcome =
        extractor(CalibrationStore::default(), ExtractOptions::default()).process(&document);

    assert_eq!(outcome.status, DocumentStatus::Completed);
    assert_eq!(outcome.grammar, Some(Grammar::SelSettings));
    assert_eq!(
        outcome
            .records
            .iter()
            .map(|record| record.code.as_str())
            .collect::<Vec<_>>(),
        vec!["RID", "TID", "50P1P"]
    );

    let rid = &outcome.records[0];
    assert_eq!(
        rid.tokens
            .iter()
            .map(|token| token.token_type)
            .collect::<Vec<_>>(),
        vec![
            TokenType::ModelPrefix,
            TokenType::PlantReference,
            TokenType::BusBar,
            TokenType::Feeder,
            TokenType::Side,
            TokenType::Date,
        ]
    );
    assert!(rid.overall_confidence > 0.8);
    assert!(rid.checkbox_states.is_empty());
}

#[test]
fn batch_keeps_input_order_and_stages_every_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = StagingStore::open(&dir.path().join(STAGING_DB_FILENAME)).expect("store opens");

    let extractor = Extractor::with_sources(
        ExtractionConfig::default(),
        calibrated(0.0),
        ExtractOptions::default(),
        Box::new(KeyValueSource),
        Box::new(FakeSource::new(vec![micom_page(&[true, false, true])])),
    )
    .expect("extractor builds");
    let inputs = (0..6)
        .map(|index| input(index, &format!("P122_feeder{index:02}.pdf"), DocumentKind::Pdf))
        .collect::<Vec<_>>();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(3)
        .build()
        .expect("pool builds");

    let mut staged = 0usize;
    let outcomes = run_batch(&pool, &extractor, &inputs, |outcome| {
        staged += store.stage_document("run-test", outcome)?;
        Ok(())
    })
    .expect("batch runs");

    assert_eq!(
        outcomes
            .iter()
            .map(|outcome| outcome.index)
            .collect::<Vec<_>>(),
        (0..6).collect::<Vec<_>>()
    );
    assert_eq!(staged, 18);
    assert_eq!(store.staged_row_count("run-test").expect("count"), 18);
    assert_eq!(
        count_rows(store.connection(), "SELECT COUNT(*) FROM documents").expect("count"),
        6
    );
}

#[test]
fn restaging_a_document_replaces_its_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = StagingStore::open(&dir.path().join(STAGING_DB_FILENAME)).expect("store opens");

    let mut page = micom_page(&[true, true]);
    if let Some(image) = page.raster.as_mut() {
        draw_box(image, BOX_X, 140, false);
    }
    let source = FakeSource::new(vec![page]);
    let outcome = extractor(calibrated(0.0), ExtractOptions::default())
        .process_with_source(&input(0, "P122_feeder06.pdf", DocumentKind::Pdf), &source);

    store.stage_document("run-a", &outcome).expect("first stage");
    store.stage_document("run-a", &outcome).expect("second stage");
    store.stage_document("run-b", &outcome).expect("other run");

    assert_eq!(store.staged_row_count("run-a").expect("count"), 2);
    assert_eq!(
        count_rows(
            store.connection(),
            "SELECT COUNT(*) FROM checkbox_diagnostics WHERE run_id = 'run-a'"
        )
        .expect("count"),
        1
    );

    let (checkbox_1, checked_count): (Option<String>, i64) = store
        .connection()
        .query_row(
            "SELECT checkbox_1, checked_count FROM parameter_rows
             WHERE run_id = 'run-a' AND code = '09.00'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("row exists");
    assert_eq!(checkbox_1.as_deref(), Some("checked"));
    assert_eq!(checked_count, 1);
}

#[test]
fn bbox_words_are_parsed_and_unescaped() {
    let source = PopplerSource::new(150.0, None).expect("regexes compile");
    let html = r#"
<page width="595.276000" height="841.890000">
    <word xMin="56.800000" yMin="70.012000" xMax="80.104000" yMax="82.000000">09.0A</word>
    <word xMin="90.000000" yMin="70.012000" xMax="120.000000" yMax="82.000000">I&gt;&gt;</word>
    <word xMin="90.000000" yMin="90.000000" xMax="91.000000" yMax="99.000000"> </word>
</page>"#;

    let words = parse_bbox_words(html, &source.word_pattern);
    assert_eq!(words.len(), 2);
    assert_eq!(words[0].0, "09.0A");
    assert_eq!(words[1].0, "I>>");
    assert!((words[1].1.x - 90.0).abs() < 1e-9);
    assert!((words[1].1.width - 30.0).abs() < 1e-9);

    let lines = lines_from_words(words);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].text.starts_with("09.0A"));
}
