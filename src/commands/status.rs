use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::checkbox::CalibrationStore;
use crate::cli::StatusArgs;
use crate::commands::extract::{
    CALIBRATION_FILENAME, STAGING_DB_FILENAME, count_rows, table_exists,
};
use crate::commands::inventory::INVENTORY_MANIFEST_FILENAME;
use crate::model::{DocumentInventoryManifest, ExtractRunManifest};
use crate::util::read_json;

const STAGING_TABLES: &[&str] = &[
    "documents",
    "parameter_rows",
    "checkbox_diagnostics",
    "document_issues",
];

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let inventory_path = manifest_dir.join(INVENTORY_MANIFEST_FILENAME);
    let calibration_path = args.cache_root.join(CALIBRATION_FILENAME);
    let db_path = args.cache_root.join(STAGING_DB_FILENAME);

    info!(cache_root = %args.cache_root.display(), "status requested");

    if inventory_path.exists() {
        let inventory: DocumentInventoryManifest = read_json(&inventory_path)?;
        info!(
            generated_at = %inventory.generated_at,
            source_directory = %inventory.source_directory,
            document_count = inventory.document_count,
            recognized_count = inventory.recognized_count,
            "loaded inventory manifest"
        );
    } else {
        warn!(path = %inventory_path.display(), "inventory manifest missing");
    }

    match latest_extract_manifest(&manifest_dir)? {
        Some(path) => {
            let manifest: ExtractRunManifest = read_json(&path)?;
            info!(
                path = %path.display(),
                run_id = %manifest.run_id,
                status = %manifest.status,
                started_at = %manifest.started_at,
                documents = manifest.counts.document_count,
                completed = manifest.counts.completed_count,
                partial = manifest.counts.partial_count,
                failed = manifest.counts.failed_count,
                timed_out = manifest.counts.timed_out_count,
                records = manifest.counts.records_emitted,
                "latest extract run"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no extract run manifests"),
    }

    if calibration_path.exists() {
        let store = CalibrationStore::load(&calibration_path)?;
        let valid = store
            .records
            .values()
            .filter(|record| record.is_valid())
            .count();
        info!(
            path = %calibration_path.display(),
            templates = store.records.len(),
            valid,
            invalid = store.records.len() - valid,
            "loaded calibration store"
        );
        for record in store.records.values().filter(|record| !record.is_valid()) {
            warn!(
                template_id = %record.template_id,
                separation_margin = record.separation_margin,
                "calibration is invalid; checkboxes will not be evaluated"
            );
        }
    } else {
        warn!(path = %calibration_path.display(), "calibration store missing");
    }

    if db_path.exists() {
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        for table in STAGING_TABLES {
            if !table_exists(&conn, table)? {
                warn!(table, "staging table missing");
                continue;
            }
            let rows = count_rows(&conn, &format!("SELECT COUNT(*) FROM {table}"))?;
            info!(table, rows, "staging table");
        }

        if table_exists(&conn, "documents")? {
            let latest_run: Option<String> = conn
                .query_row("SELECT MAX(run_id) FROM documents", [], |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()?
                .flatten();
            let schema_version: Option<String> = conn
                .query_row(
                    "SELECT value FROM metadata WHERE key = 'db_schema_version'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            info!(
                path = %db_path.display(),
                latest_run = %latest_run.unwrap_or_default(),
                db_schema_version = %schema_version.unwrap_or_default(),
                "database status"
            );
        }
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}

/// Run manifests carry a compact UTC timestamp, so the last name sorts newest.
fn latest_extract_manifest(manifest_dir: &Path) -> Result<Option<PathBuf>> {
    if !manifest_dir.exists() {
        return Ok(None);
    }

    let mut manifests = Vec::new();
    for entry in fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?
    {
        let path = entry?.path();
        let is_run_manifest = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("extract_run_") && name.ends_with(".json"));
        if is_run_manifest {
            manifests.push(path);
        }
    }

    manifests.sort();
    Ok(manifests.pop())
}
