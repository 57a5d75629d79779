use super::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DocumentStatus {
    Completed,
    /// Some pages failed; records from the rest are kept.
    Partial,
    Failed,
    TimedOut,
}

impl DocumentStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DocumentInput {
    /// Position in the inventory; outcomes are re-sorted by it.
    pub(crate) index: usize,
    pub(crate) path: PathBuf,
    pub(crate) filename: String,
    pub(crate) kind: DocumentKind,
    pub(crate) sha256: String,
}

#[derive(Debug, Clone)]
pub(crate) struct DocumentOutcome {
    pub(crate) index: usize,
    pub(crate) filename: String,
    pub(crate) sha256: String,
    pub(crate) grammar: Option<Grammar>,
    pub(crate) template_id: Option<String>,
    pub(crate) status: DocumentStatus,
    pub(crate) pages_processed: usize,
    pub(crate) records: Vec<ParameterRecord>,
    pub(crate) diagnostics: Vec<CheckboxDiagnostic>,
    pub(crate) issues: Vec<ExtractionIssue>,
    pub(crate) elapsed_ms: u128,
}

impl DocumentOutcome {
    fn new(input: &DocumentInput) -> Self {
        Self {
            index: input.index,
            filename: input.filename.clone(),
            sha256: input.sha256.clone(),
            grammar: None,
            template_id: None,
            status: DocumentStatus::Completed,
            pages_processed: 0,
            records: Vec::new(),
            diagnostics: Vec::new(),
            issues: Vec::new(),
            elapsed_ms: 0,
        }
    }

    fn fail(mut self, issue: ExtractionIssue, started: Instant) -> Self {
        self.issues.push(issue);
        self.status = DocumentStatus::Failed;
        self.elapsed_ms = started.elapsed().as_millis();
        self
    }

    pub(crate) fn count_issues(&self, kind: &str) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.kind() == kind)
            .count()
    }

    pub(crate) fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            filename: self.filename.clone(),
            grammar: self.grammar,
            template_id: self.template_id.clone(),
            status: self.status.as_str().to_string(),
            pages_processed: self.pages_processed,
            record_count: self.records.len(),
            issue_count: self.issues.len(),
            elapsed_ms: self.elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ExtractOptions {
    pub(crate) max_pages_per_doc: Option<u32>,
    pub(crate) document_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct PageOutput {
    records: Vec<ParameterRecord>,
    diagnostics: Vec<CheckboxDiagnostic>,
    issues: Vec<ExtractionIssue>,
}

/// Read-only state shared by every worker.
pub(crate) struct Extractor {
    detector: FormatDetector,
    tokenizer: FieldTokenizer,
    grammars: BTreeMap<Grammar, LineGrammar>,
    config: ExtractionConfig,
    calibrations: CalibrationStore,
    options: ExtractOptions,
    key_value: Box<dyn PageSource>,
    pdf: Box<dyn PageSource>,
}

impl Extractor {
    pub(crate) fn new(
        config: ExtractionConfig,
        calibrations: CalibrationStore,
        options: ExtractOptions,
    ) -> Result<Self> {
        let pdf = PopplerSource::new(config.raster_dpi, options.document_timeout)?;
        Self::with_sources(
            config,
            calibrations,
            options,
            Box::new(KeyValueSource),
            Box::new(pdf),
        )
    }

    pub(crate) fn with_sources(
        config: ExtractionConfig,
        calibrations: CalibrationStore,
        options: ExtractOptions,
        key_value: Box<dyn PageSource>,
        pdf: Box<dyn PageSource>,
    ) -> Result<Self> {
        let mut grammars = BTreeMap::new();
        for grammar in [
            Grammar::MicomP122x205,
            Grammar::MicomP122,
            Grammar::MicomP220,
            Grammar::SepamS40,
            Grammar::SelSettings,
        ] {
            grammars.insert(grammar, LineGrammar::for_grammar(grammar)?);
        }

        Ok(Self {
            detector: FormatDetector::new()?,
            tokenizer: FieldTokenizer::new()?,
            grammars,
            config,
            calibrations,
            options,
            key_value,
            pdf,
        })
    }

    pub(crate) fn process(&self, input: &DocumentInput) -> DocumentOutcome {
        let source = match input.kind {
            DocumentKind::Pdf => self.pdf.as_ref(),
            DocumentKind::KeyValue => self.key_value.as_ref(),
        };
        self.process_with_source(input, source)
    }

    pub(crate) fn process_with_source(
        &self,
        input: &DocumentInput,
        source: &dyn PageSource,
    ) -> DocumentOutcome {
        let started = Instant::now();
        let mut outcome = DocumentOutcome::new(input);

        let leading = match source.leading_bytes(&input.path) {
            Ok(leading) => leading,
            Err(err) => {
                warn!(filename = %input.filename, error = %err, "document source unavailable");
                let issue = ExtractionIssue::SourceUnavailable {
                    reason: format!("{err:#}"),
                };
                return outcome.fail(issue, started);
            }
        };

        let grammar = match self.detector.require(&input.filename, &leading) {
            Ok(grammar) => grammar,
            Err(issue) => {
                warn!(filename = %input.filename, "format unrecognized; skipping document");
                return outcome.fail(issue, started);
            }
        };
        let settings = self.config.resolve(grammar);
        outcome.grammar = Some(grammar);
        outcome.template_id = Some(settings.template_id.clone());

        // Missing calibration blocks classification only; the rest still runs.
        let classifier = match StateClassifier::from_calibration(
            &settings.template_id,
            self.calibrations.get(&settings.template_id),
        ) {
            Ok(classifier) => {
                debug!(
                    filename = %input.filename,
                    template_id = classifier.template_id(),
                    "classifier ready"
                );
                Some(classifier)
            }
            Err(issue) => {
                warn!(
                    filename = %input.filename,
                    template_id = %settings.template_id,
                    issue = %issue,
                    "checkbox states will not be evaluated"
                );
                outcome.issues.push(issue);
                None
            }
        };
        let region_detector = RegionDetector::new(settings.detector.clone());

        let page_count = match source.page_count(&input.path) {
            Ok(count) => count,
            Err(err) => {
                let issue = ExtractionIssue::SourceUnavailable {
                    reason: format!("{err:#}"),
                };
                return outcome.fail(issue, started);
            }
        };
        let page_limit = self
            .options
            .max_pages_per_doc
            .map(|limit| limit.min(page_count))
            .unwrap_or(page_count);

        let mut failed_pages = 0usize;
        if !self.deadline_passed(started, &mut outcome) {
            for page in 1..=page_limit {
                let page_output = source.load_page(&input.path, page).map(|content| {
                    self.process_page(
                        &content,
                        grammar,
                        &settings,
                        classifier.as_ref(),
                        &region_detector,
                    )
                });

                match page_output {
                    Ok(page_output) => {
                        debug!(
                            filename = %input.filename,
                            page,
                            records = page_output.records.len(),
                            "page processed"
                        );
                        outcome.pages_processed += 1;
                        outcome.records.extend(page_output.records);
                        outcome.diagnostics.extend(page_output.diagnostics);
                        outcome.issues.extend(page_output.issues);
                    }
                    Err(err) => {
                        warn!(filename = %input.filename, page, error = %err, "page failed");
                        failed_pages += 1;
                        outcome.issues.push(ExtractionIssue::PageFailed {
                            page,
                            reason: format!("{err:#}"),
                        });
                    }
                }

                // The page that crossed the deadline keeps its records.
                if self.deadline_passed(started, &mut outcome) {
                    break;
                }
            }
        }

        if outcome.status != DocumentStatus::TimedOut && failed_pages > 0 {
            outcome.status = if outcome.pages_processed == 0 {
                DocumentStatus::Failed
            } else {
                DocumentStatus::Partial
            };
        }
        outcome.elapsed_ms = started.elapsed().as_millis();

        info!(
            filename = %input.filename,
            grammar = %grammar,
            status = outcome.status.as_str(),
            pages = outcome.pages_processed,
            records = outcome.records.len(),
            issues = outcome.issues.len(),
            "document processed"
        );
        outcome
    }

    /// Marks the outcome timed out once the document deadline has passed.
    fn deadline_passed(&self, started: Instant, outcome: &mut DocumentOutcome) -> bool {
        let expired = self
            .options
            .document_timeout
            .is_some_and(|timeout| started.elapsed() >= timeout);
        if expired {
            outcome.issues.push(ExtractionIssue::DocumentTimedOut {
                elapsed_ms: started.elapsed().as_millis(),
                pages_done: outcome.pages_processed,
            });
            outcome.status = DocumentStatus::TimedOut;
        }
        expired
    }

    fn process_page(
        &self,
        content: &PageContent,
        grammar: Grammar,
        settings: &TemplateSettings,
        classifier: Option<&StateClassifier>,
        region_detector: &RegionDetector,
    ) -> PageOutput {
        let mut output = PageOutput::default();
        let codes = self.scan_codes(content, grammar);

        let mut states_by_code = BTreeMap::<String, Vec<(CheckboxState, f64)>>::new();
        if let Some(raster) = &content.raster {
            let regions = self.attribute_checkboxes(
                content,
                raster,
                &codes,
                settings,
                classifier,
                region_detector,
                &mut output,
            );
            for (code_id, region) in regions {
                if let Some(state) = CheckboxState::from_classification(region.classification) {
                    states_by_code
                        .entry(code_id)
                        .or_default()
                        .push((state, region.confidence));
                }
            }
        }

        for code in codes {
            let field = self.tokenizer.tokenize(&code.raw_value);
            debug_assert_eq!(field.reconstruct(), code.raw_value);
            for token in field.low_confidence_tokens() {
                output.issues.push(ExtractionIssue::LowConfidenceToken {
                    code: code.code.clone(),
                    text: token.text.clone(),
                    confidence: token.confidence,
                });
            }

            let checkboxes = states_by_code.remove(&code.id).unwrap_or_default();
            let checkbox_confidences = checkboxes
                .iter()
                .map(|(_, confidence)| *confidence)
                .collect::<Vec<f64>>();

            output.records.push(ParameterRecord {
                overall_confidence: overall_confidence(field.confidence, &checkbox_confidences),
                checkbox_states: checkboxes.into_iter().map(|(state, _)| state).collect(),
                tokens: field.tokens,
                code: code.code,
                description: code.description,
                raw_value: code.raw_value,
                page: code.page,
                grammar,
                template_id: settings.template_id.clone(),
            });
        }

        output
    }

    fn scan_codes(&self, content: &PageContent, grammar: Grammar) -> Vec<ParameterCode> {
        let Some(line_grammar) = self.grammars.get(&grammar) else {
            return Vec::new();
        };

        let mut codes = Vec::new();
        for line in &content.lines {
            for code_line in line_grammar.parse_line(&line.text) {
                let anchor = line
                    .word_at(code_line.code_offset)
                    .map(|word| word.bbox)
                    .or_else(|| line.bbox());
                let Some(anchor) = anchor else {
                    continue;
                };
                codes.push(ParameterCode::new(
                    content.page,
                    codes.len(),
                    code_line.code,
                    code_line.description,
                    code_line.raw_value,
                    anchor,
                ));
            }
        }
        codes
    }

    /// Image track: returns `(code id, region)` pairs in detection order and
    /// records noise and unattributable regions in `output`.
    #[allow(clippy::too_many_arguments)]
    fn attribute_checkboxes(
        &self,
        content: &PageContent,
        raster: &PageRaster,
        codes: &[ParameterCode],
        settings: &TemplateSettings,
        classifier: Option<&StateClassifier>,
        region_detector: &RegionDetector,
        output: &mut PageOutput,
    ) -> Vec<(String, CheckboxRegion)> {
        let pixels_per_point = raster.pixels_per_point();
        let text_boxes = content
            .text_boxes()
            .map(|bbox| bbox.to_pixels(pixels_per_point))
            .collect::<Vec<PixelRect>>();

        let detected = region_detector.detect(content.page, &raster.image, raster.dpi, &text_boxes);
        let margin = interior_margin_px(settings.interior_margin_pt, raster.dpi);
        let (noise, regions): (Vec<CheckboxRegion>, Vec<CheckboxRegion>) =
            classify_candidates(detected.candidates, &detected.binary, margin, classifier)
                .into_iter()
                .partition(CheckboxRegion::is_noise);

        for region in &noise {
            output.issues.push(ExtractionIssue::RegionRejectedAsNoise {
                region_id: region.id.clone(),
                density: region.interior_ink_density,
            });
        }

        let anchors = codes
            .iter()
            .map(|code| AnchorPosition {
                code_id: code.id.clone(),
                center_y: code.anchor.center_y() * pixels_per_point,
            })
            .collect::<Vec<AnchorPosition>>();
        let tolerance_px = resolve_tolerance_px(&settings.tolerance, &anchors, raster.dpi);
        let positions = regions
            .iter()
            .map(CheckboxRegion::position)
            .collect::<Vec<_>>();
        let correlation = correlate(&positions, &anchors, tolerance_px);

        let mut attributed = Vec::with_capacity(regions.len());
        for region in regions {
            match correlation.code_for(&region.id) {
                Some(code_id) => attributed.push((code_id.to_string(), region)),
                None => {
                    let state = CheckboxState::from_classification(region.classification)
                        .unwrap_or(CheckboxState::NotEvaluated);
                    output.issues.push(ExtractionIssue::UnattributableCheckbox {
                        page: content.page,
                        x: region.rect.x,
                        y: region.rect.y,
                        state: state.as_str().to_string(),
                    });
                    output.diagnostics.push(CheckboxDiagnostic {
                        page: content.page,
                        region_id: region.id,
                        x: region.rect.x,
                        y: region.rect.y,
                        width: region.rect.width,
                        height: region.rect.height,
                        state,
                        interior_ink_density: region.interior_ink_density,
                    });
                }
            }
        }
        attributed
    }
}
