use super::*;

pub fn run(args: ExtractArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let source_dir = args
        .source_dir
        .clone()
        .unwrap_or_else(|| cache_root.join("sources"));
    let inventory_manifest_path = args
        .inventory_manifest_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join(INVENTORY_MANIFEST_FILENAME));
    let extract_manifest_path = args.extract_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "extract_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join(STAGING_DB_FILENAME));
    let calibration_path = args
        .calibration_path
        .clone()
        .unwrap_or_else(|| cache_root.join(CALIBRATION_FILENAME));

    info!(cache_root = %cache_root.display(), run_id = %run_id, "starting extract");

    let inventory =
        load_or_refresh_inventory(&source_dir, &inventory_manifest_path, args.refresh_inventory)?;

    let mut config = ExtractionConfig::load(args.config_path.as_deref())?;
    if let Some(raster_dpi) = args.raster_dpi {
        config.raster_dpi = raster_dpi;
        config.validate()?;
    }
    let raster_dpi = config.raster_dpi;
    let calibrations = CalibrationStore::load(&calibration_path)?;
    info!(
        path = %calibration_path.display(),
        templates = calibrations.records.len(),
        "loaded calibration store"
    );

    let mut warnings = Vec::new();
    let tool_versions = collect_tool_versions();
    let has_pdfs = inventory
        .documents
        .iter()
        .any(|document| document.kind == DocumentKind::Pdf);
    if has_pdfs && (tool_versions.pdftotext.is_none() || tool_versions.pdftoppm.is_none()) {
        let message = "poppler tools not found; PDF documents will fail".to_string();
        warn!("{message}");
        warnings.push(message);
    }

    let options = ExtractOptions {
        max_pages_per_doc: args.max_pages_per_doc,
        document_timeout: args.document_timeout_secs.map(Duration::from_secs),
    };
    let extractor = Extractor::new(config, calibrations, options)?;
    let inputs = document_inputs(&source_dir, &inventory);

    let jobs = args.jobs.unwrap_or_else(default_jobs).max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("failed to build extraction worker pool")?;

    let mut store = StagingStore::open(&db_path)?;
    info!(documents = inputs.len(), jobs, db = %db_path.display(), "extracting");

    let outcomes = run_batch(&pool, &extractor, &inputs, |outcome| {
        let rows = store.stage_document(&run_id, outcome)?;
        debug!(filename = %outcome.filename, rows, "staged document");
        Ok(())
    })?;

    let records_jsonl_path = args.records_jsonl.clone();
    if let Some(path) = &records_jsonl_path {
        let records = outcomes
            .iter()
            .flat_map(|outcome| outcome.records.iter())
            .collect::<Vec<&ParameterRecord>>();
        write_json_lines(path, &records)?;
        info!(path = %path.display(), records = records.len(), "wrote records");
    }

    let mut counts = summarize_counts(&outcomes);
    counts.rows_staged = store.staged_row_count(&run_id)?;

    let status = if counts.failed_count + counts.timed_out_count + counts.partial_count == 0 {
        "completed"
    } else {
        "completed_with_issues"
    };

    let manifest = ExtractRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_extract_command(&args),
        jobs,
        raster_dpi,
        tool_versions,
        paths: ExtractPaths {
            cache_root: cache_root.display().to_string(),
            source_directory: source_dir.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            inventory_manifest_path: inventory_manifest_path.display().to_string(),
            db_path: db_path.display().to_string(),
            calibration_path: calibration_path.display().to_string(),
            config_path: args
                .config_path
                .as_ref()
                .map(|path| path.display().to_string()),
            records_jsonl_path: records_jsonl_path.map(|path| path.display().to_string()),
        },
        counts,
        documents: outcomes.iter().map(DocumentOutcome::summary).collect(),
        source_hashes: inventory.documents,
        warnings,
    };

    write_json_pretty(&extract_manifest_path, &manifest)?;

    info!(path = %extract_manifest_path.display(), "wrote extract run manifest");
    info!(
        status,
        documents = manifest.counts.document_count,
        records = manifest.counts.records_emitted,
        rows = manifest.counts.rows_staged,
        "extract completed"
    );

    Ok(())
}

/// Fans documents out over `pool` and hands each outcome to `on_outcome` on
/// the calling thread as soon as it completes. Returns outcomes in input order.
pub(crate) fn run_batch<F>(
    pool: &ThreadPool,
    extractor: &Extractor,
    inputs: &[DocumentInput],
    mut on_outcome: F,
) -> Result<Vec<DocumentOutcome>>
where
    F: FnMut(&DocumentOutcome) -> Result<()>,
{
    let (sender, receiver) = mpsc::channel::<DocumentOutcome>();
    let mut outcomes = Vec::with_capacity(inputs.len());
    let mut sink_result = Ok(());

    thread::scope(|scope| {
        scope.spawn(move || {
            pool.install(|| {
                inputs.par_iter().for_each_with(sender, |sender, input| {
                    // The receiver only goes away once this scope unwinds.
                    let _ = sender.send(extractor.process(input));
                });
            });
        });

        for outcome in receiver {
            if sink_result.is_ok() {
                sink_result = on_outcome(&outcome);
            }
            outcomes.push(outcome);
        }
    });

    sink_result?;
    outcomes.sort_by_key(|outcome| outcome.index);
    Ok(outcomes)
}

fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(1)
}

pub(crate) fn document_inputs(
    source_dir: &Path,
    inventory: &DocumentInventoryManifest,
) -> Vec<DocumentInput> {
    inventory
        .documents
        .iter()
        .enumerate()
        .map(|(index, document)| DocumentInput {
            index,
            path: source_dir.join(&document.filename),
            filename: document.filename.clone(),
            kind: document.kind,
            sha256: document.sha256.clone(),
        })
        .collect()
}

pub(crate) fn summarize_counts(outcomes: &[DocumentOutcome]) -> ExtractCounts {
    let mut counts = ExtractCounts {
        document_count: outcomes.len(),
        ..ExtractCounts::default()
    };

    for outcome in outcomes {
        match outcome.status {
            DocumentStatus::Completed => counts.completed_count += 1,
            DocumentStatus::Partial => counts.partial_count += 1,
            DocumentStatus::Failed => counts.failed_count += 1,
            DocumentStatus::TimedOut => counts.timed_out_count += 1,
        }
        counts.pages_processed += outcome.pages_processed;
        counts.records_emitted += outcome.records.len();
        for record in &outcome.records {
            counts.checkboxes_attributed += record.checkbox_states.len();
            counts.checkboxes_checked += record.checked_count();
            counts.checkboxes_not_evaluated += record.count_state(CheckboxState::NotEvaluated);
        }
        counts.unattributable_checkboxes += outcome.diagnostics.len();
        counts.noise_regions_rejected += outcome.count_issues("region_rejected_as_noise");
        counts.low_confidence_tokens += outcome.count_issues("low_confidence_token");
    }

    counts
}

fn load_or_refresh_inventory(
    source_dir: &Path,
    inventory_manifest_path: &Path,
    refresh_inventory: bool,
) -> Result<DocumentInventoryManifest> {
    if refresh_inventory || !inventory_manifest_path.exists() {
        let manifest = inventory::build_manifest(source_dir)?;
        write_json_pretty(inventory_manifest_path, &manifest)?;
        info!(
            path = %inventory_manifest_path.display(),
            document_count = manifest.document_count,
            "refreshed inventory manifest"
        );
        return Ok(manifest);
    }

    let manifest: DocumentInventoryManifest = read_json(inventory_manifest_path)?;

    info!(
        path = %inventory_manifest_path.display(),
        document_count = manifest.document_count,
        "loaded existing inventory manifest"
    );

    Ok(manifest)
}

fn render_extract_command(args: &ExtractArgs) -> String {
    let mut command = vec![
        "relayscan".to_string(),
        "extract".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];

    let paths = [
        ("--source-dir", &args.source_dir),
        ("--inventory-manifest-path", &args.inventory_manifest_path),
        ("--extract-manifest-path", &args.extract_manifest_path),
        ("--db-path", &args.db_path),
        ("--calibration-path", &args.calibration_path),
        ("--config", &args.config_path),
        ("--records-jsonl", &args.records_jsonl),
    ];
    for (flag, path) in paths {
        if let Some(path) = path {
            command.push(flag.to_string());
            command.push(path.display().to_string());
        }
    }
    if args.refresh_inventory {
        command.push("--refresh-inventory".to_string());
    }
    if let Some(jobs) = args.jobs {
        command.push("--jobs".to_string());
        command.push(jobs.to_string());
    }
    if let Some(timeout) = args.document_timeout_secs {
        command.push("--document-timeout-secs".to_string());
        command.push(timeout.to_string());
    }
    if let Some(raster_dpi) = args.raster_dpi {
        command.push("--raster-dpi".to_string());
        command.push(raster_dpi.to_string());
    }
    if let Some(max_pages) = args.max_pages_per_doc {
        command.push("--max-pages-per-doc".to_string());
        command.push(max_pages.to_string());
    }

    command.join(" ")
}
