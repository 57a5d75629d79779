use super::*;

#[derive(Debug, Serialize)]
struct ValidationReport {
    manifest_version: u32,
    run_id: String,
    generated_at: String,
    status: String,
    db_path: String,
    glossary_path: String,
    filename: Option<String>,
    grammar: Option<String>,
    min_confidence: f64,
    summary: ValidationSummary,
    checks: Vec<ValidationCheck>,
    findings: Findings,
}

#[derive(Debug, Serialize)]
struct ValidationSummary {
    glossary_entries: usize,
    staged_rows: usize,
    matched_codes: usize,
    missing_count: usize,
    unexpected_count: usize,
    description_mismatch_count: usize,
    low_confidence_count: usize,
    not_evaluated_checkbox_count: usize,
    total_checks: usize,
    passed: usize,
    failed: usize,
}

pub fn run(args: ValidateArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join(STAGING_DB_FILENAME));
    let report_path = args
        .report_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join(VALIDATION_REPORT_FILENAME));

    if !(0.0..=1.0).contains(&args.min_confidence) {
        bail!("--min-confidence must be within [0, 1], got {}", args.min_confidence);
    }

    let glossary: Glossary = read_json(&args.glossary_path)?;
    info!(
        glossary = %args.glossary_path.display(),
        entries = glossary.entries.len(),
        "loaded glossary"
    );

    let connection = open_read_only(&db_path)?;
    if !table_exists(&connection, "parameter_rows")? {
        bail!(
            "{} has no parameter_rows table; run extract first",
            db_path.display()
        );
    }

    let run_id = resolve_run_id(&connection, args.run_id.as_deref())?;
    let rows = load_staged_rows(
        &connection,
        &run_id,
        args.filename.as_deref(),
        glossary.grammar.as_deref(),
    )?;
    info!(run_id = %run_id, rows = rows.len(), "loaded staged rows");
    if rows.is_empty() {
        warn!(run_id = %run_id, "no staged rows matched the filters");
    }

    let findings = compare_rows(&glossary, &rows, args.min_confidence);
    let checks = build_checks(&findings);
    let passed = checks.iter().filter(|check| check.result == "pass").count();
    let failed = checks.len() - passed;

    let report = ValidationReport {
        manifest_version: 1,
        run_id: run_id.clone(),
        generated_at: now_utc_string(),
        status: if failed == 0 { "passed" } else { "failed" }.to_string(),
        db_path: db_path.display().to_string(),
        glossary_path: args.glossary_path.display().to_string(),
        filename: args.filename.clone(),
        grammar: glossary.grammar.clone(),
        min_confidence: args.min_confidence,
        summary: ValidationSummary {
            glossary_entries: glossary.entries.len(),
            staged_rows: findings.staged_rows,
            matched_codes: findings.matched_codes,
            missing_count: findings.missing_codes.len(),
            unexpected_count: findings.unexpected_codes.len(),
            description_mismatch_count: findings.description_mismatches.len(),
            low_confidence_count: findings.low_confidence_rows.len(),
            not_evaluated_checkbox_count: findings.not_evaluated_checkboxes,
            total_checks: checks.len(),
            passed,
            failed,
        },
        checks,
        findings,
    };

    write_json_pretty(&report_path, &report)?;
    info!(path = %report_path.display(), "wrote validation report");

    for check in report.checks.iter().filter(|check| check.result == "fail") {
        warn!(check_id = %check.check_id, name = %check.name, "validation check failed");
    }
    info!(
        status = %report.status,
        matched = report.summary.matched_codes,
        missing = report.summary.missing_count,
        unexpected = report.summary.unexpected_count,
        mismatched = report.summary.description_mismatch_count,
        low_confidence = report.summary.low_confidence_count,
        "validation completed"
    );

    if args.strict && report.findings.has_glossary_differences() {
        bail!(
            "strict validation failed: {} missing, {} unexpected, {} mismatched descriptions",
            report.summary.missing_count,
            report.summary.unexpected_count,
            report.summary.description_mismatch_count
        );
    }

    Ok(())
}

fn open_read_only(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        bail!("staging store {} does not exist", db_path.display());
    }
    Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open database read-only: {}", db_path.display()))
}
